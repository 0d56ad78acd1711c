//! Chunks: the unit of output.
//!
//! Streams emit values in chunks so per-element work in the compiler is
//! amortised. A chunk is an immutable, owned sequence.

use std::fmt;
use std::ops::Index;

/// An owned, ordered batch of output values.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Chunk<O> {
    items: Vec<O>,
}

impl<O> Chunk<O> {
    /// The empty chunk.
    pub fn empty() -> Self {
        Chunk { items: Vec::new() }
    }

    /// A chunk of one value.
    pub fn singleton(o: O) -> Self {
        Chunk { items: vec![o] }
    }

    /// Wrap a vector.
    pub fn from_vec(items: Vec<O>) -> Self {
        Chunk { items }
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if the chunk holds no values.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The first value.
    pub fn head(&self) -> Option<&O> {
        self.items.first()
    }

    /// The last value.
    pub fn last(&self) -> Option<&O> {
        self.items.last()
    }

    /// Borrowing iterator.
    pub fn iter(&self) -> std::slice::Iter<'_, O> {
        self.items.iter()
    }

    /// View as a slice.
    pub fn as_slice(&self) -> &[O] {
        &self.items
    }

    /// Unwrap into the backing vector.
    pub fn into_vec(self) -> Vec<O> {
        self.items
    }

    /// Apply `f` to every value.
    pub fn map<O2, F>(self, f: F) -> Chunk<O2>
    where
        F: FnMut(O) -> O2,
    {
        Chunk { items: self.items.into_iter().map(f).collect() }
    }

    /// Keep the values matching `p`.
    pub fn filter<P>(self, mut p: P) -> Chunk<O>
    where
        P: FnMut(&O) -> bool,
    {
        Chunk { items: self.items.into_iter().filter(|o| p(o)).collect() }
    }

    /// Split after the first `n` values.
    pub fn split_at(mut self, n: usize) -> (Chunk<O>, Chunk<O>) {
        let n = n.min(self.items.len());
        let rest = self.items.split_off(n);
        (self, Chunk { items: rest })
    }

    /// Concatenate two chunks.
    pub fn concat(mut self, other: Chunk<O>) -> Chunk<O> {
        self.items.extend(other.items);
        self
    }
}

impl<O> Default for Chunk<O> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<O: fmt::Debug> fmt::Debug for Chunk<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Chunk").field(&self.items).finish()
    }
}

impl<O> Index<usize> for Chunk<O> {
    type Output = O;

    fn index(&self, index: usize) -> &O {
        &self.items[index]
    }
}

impl<O> From<Vec<O>> for Chunk<O> {
    fn from(items: Vec<O>) -> Self {
        Chunk { items }
    }
}

impl<O> FromIterator<O> for Chunk<O> {
    fn from_iter<I: IntoIterator<Item = O>>(iter: I) -> Self {
        Chunk { items: iter.into_iter().collect() }
    }
}

impl<O> IntoIterator for Chunk<O> {
    type Item = O;
    type IntoIter = std::vec::IntoIter<O>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, O> IntoIterator for &'a Chunk<O> {
    type Item = &'a O;
    type IntoIter = std::slice::Iter<'a, O>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_at_bounds() {
        let (a, b) = Chunk::from_vec(vec![1, 2, 3]).split_at(2);
        assert_eq!(a.into_vec(), vec![1, 2]);
        assert_eq!(b.into_vec(), vec![3]);

        let (a, b) = Chunk::from_vec(vec![1]).split_at(5);
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
    }

    #[test]
    fn test_map_filter() {
        let c: Chunk<i32> = (1..=6).collect();
        let evens = c.filter(|n| n % 2 == 0).map(|n| n * 10);
        assert_eq!(evens.as_slice(), &[20, 40, 60]);
        assert_eq!(evens[1], 40);
    }

    #[test]
    fn test_head_last_concat() {
        let c = Chunk::singleton('a').concat(Chunk::from_vec(vec!['b', 'c']));
        assert_eq!(c.head(), Some(&'a'));
        assert_eq!(c.last(), Some(&'c'));
        assert_eq!(Chunk::<u8>::empty().head(), None);
    }
}
