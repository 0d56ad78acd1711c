//! # Synchronization Primitives
//!
//! - [`Deferred`]: a write-once cell that effects can wait on
//! - [`Ref`]: a shared mutable cell with atomic read-modify-write effects
//!
//! Waiters registered on a `Deferred` are notified outside its lock, in
//! registration order, within a single trampoline batch.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_runtime::{Deferred, IO};
//!
//! let d = Deferred::<u32>::new();
//! let reader = d.get().map(|n| n + 1);
//! d.complete(41).unsafe_run_sync().unwrap();
//! assert_eq!(reader.unsafe_run_sync().unwrap(), 42);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::io::IO;
use crate::trampoline;

type Waiter<A> = Box<dyn FnOnce(A) + Send>;

/// Handle to a registered `Deferred` waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

enum DeferredState<A> {
    Unset {
        waiters: BTreeMap<u64, Waiter<A>>,
        next_id: u64,
    },
    Set(A),
}

/// A write-once cell.
pub struct Deferred<A> {
    state: Arc<Mutex<DeferredState<A>>>,
}

impl<A> Clone for Deferred<A> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<A> fmt::Debug for Deferred<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.lock() {
            DeferredState::Unset { waiters, .. } => f
                .debug_struct("Deferred")
                .field("waiters", &waiters.len())
                .finish(),
            DeferredState::Set(_) => f.write_str("Deferred(set)"),
        }
    }
}

impl<A: Clone + Send + 'static> Default for Deferred<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Clone + Send + 'static> Deferred<A> {
    /// An empty cell.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeferredState::Unset {
                waiters: BTreeMap::new(),
                next_id: 0,
            })),
        }
    }

    /// The value, if set.
    pub fn try_get(&self) -> Option<A> {
        match &*self.state.lock() {
            DeferredState::Set(a) => Some(a.clone()),
            DeferredState::Unset { .. } => None,
        }
    }

    /// Returns true once a value is set.
    pub fn is_set(&self) -> bool {
        matches!(&*self.state.lock(), DeferredState::Set(_))
    }

    /// Register `f` to receive the value.
    ///
    /// If the value is already set `f` runs immediately and `None` is
    /// returned; otherwise the returned id can remove the waiter.
    pub fn on_complete<F>(&self, f: F) -> Option<WaiterId>
    where
        F: FnOnce(A) + Send + 'static,
    {
        let mut state = self.state.lock();
        match &mut *state {
            DeferredState::Set(a) => {
                let a = a.clone();
                drop(state);
                f(a);
                None
            }
            DeferredState::Unset { waiters, next_id } => {
                let id = *next_id;
                *next_id += 1;
                waiters.insert(id, Box::new(f));
                Some(WaiterId(id))
            }
        }
    }

    /// Remove a waiter. Returns false if it already ran or was removed.
    pub fn remove_waiter(&self, id: WaiterId) -> bool {
        match &mut *self.state.lock() {
            DeferredState::Unset { waiters, .. } => waiters.remove(&id.0).is_some(),
            DeferredState::Set(_) => false,
        }
    }

    /// Set the value and notify waiters. Returns false if already set.
    pub fn try_complete(&self, a: A) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, DeferredState::Set(a.clone())) {
                DeferredState::Unset { waiters, .. } => waiters,
                previous @ DeferredState::Set(_) => {
                    *state = previous;
                    return false;
                }
            }
        };

        if !waiters.is_empty() {
            trampoline::execute(Box::new(move || {
                for (_, waiter) in waiters {
                    waiter(a.clone());
                }
            }));
        }
        true
    }

    /// Effect that sets the value; fails with an illegal state if already set.
    pub fn complete(&self, a: A) -> IO<()> {
        let this = self.clone();
        IO::try_delay(move || {
            if this.try_complete(a) {
                Ok(())
            } else {
                Err(Error::illegal_state("deferred already completed"))
            }
        })
    }

    /// Effect that waits for the value.
    ///
    /// Cancelling the wait removes the waiter.
    pub fn get(&self) -> IO<A> {
        if let Some(a) = self.try_get() {
            return IO::pure(a);
        }
        let this = self.clone();
        IO::cancelable(move |cb| {
            let waiter = cb.clone();
            match this.on_complete(move |a| {
                waiter.complete(a);
            }) {
                Some(id) => IO::delay(move || {
                    this.remove_waiter(id);
                }),
                None => IO::unit(),
            }
        })
    }
}

/// A value and the number of writes that produced it.
struct Versioned<A> {
    version: u64,
    value: A,
}

/// A shared mutable cell.
///
/// Read-modify-write operations run the caller's function on a snapshot,
/// outside the lock, and commit only if no other write landed in between;
/// otherwise they retry on a fresh snapshot. The function may therefore run
/// more than once, and it may freely read or write the same cell.
pub struct Ref<A> {
    cell: Arc<Mutex<Versioned<A>>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&self.cell.lock().value).finish()
    }
}

fn snapshot<A: Clone>(cell: &Mutex<Versioned<A>>) -> (u64, A) {
    let current = cell.lock();
    (current.version, current.value.clone())
}

/// Store `next` unless a write landed after `seen`.
fn compare_and_set<A>(cell: &Mutex<Versioned<A>>, seen: u64, next: A) -> bool {
    let mut current = cell.lock();
    if current.version != seen {
        return false;
    }
    current.version += 1;
    current.value = next;
    true
}

impl<A: Clone + Send + 'static> Ref<A> {
    /// A cell holding `initial`.
    pub fn new(initial: A) -> Self {
        Self {
            cell: Arc::new(Mutex::new(Versioned { version: 0, value: initial })),
        }
    }

    /// Effect that allocates a cell.
    pub fn of(initial: A) -> IO<Ref<A>> {
        IO::delay(move || Ref::new(initial))
    }

    /// Read the current value.
    pub fn get(&self) -> IO<A> {
        let cell = Arc::clone(&self.cell);
        IO::delay(move || cell.lock().value.clone())
    }

    /// Replace the value.
    pub fn set(&self, a: A) -> IO<()> {
        self.get_and_set(a).void()
    }

    /// Replace the value, returning the previous one.
    pub fn get_and_set(&self, a: A) -> IO<A> {
        let cell = Arc::clone(&self.cell);
        IO::delay(move || {
            let mut current = cell.lock();
            current.version += 1;
            std::mem::replace(&mut current.value, a)
        })
    }

    /// Apply `f` atomically.
    pub fn update<F>(&self, mut f: F) -> IO<()>
    where
        F: FnMut(A) -> A + Send + 'static,
    {
        self.modify(move |a| (f(a), ()))
    }

    /// Apply `f` to one snapshot. Yields false, leaving the cell as it is,
    /// if another write landed while `f` ran.
    pub fn try_update<F>(&self, f: F) -> IO<bool>
    where
        F: FnOnce(A) -> A + Send + 'static,
    {
        let cell = Arc::clone(&self.cell);
        IO::delay(move || {
            let (seen, current) = snapshot(&cell);
            compare_and_set(&cell, seen, f(current))
        })
    }

    /// Apply `f` atomically and return its second component.
    pub fn modify<B, F>(&self, mut f: F) -> IO<B>
    where
        B: Send + 'static,
        F: FnMut(A) -> (A, B) + Send + 'static,
    {
        let cell = Arc::clone(&self.cell);
        IO::delay(move || loop {
            let (seen, current) = snapshot(&cell);
            let (next, out) = f(current);
            if compare_and_set(&cell, seen, next) {
                return out;
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    #[test]
    fn test_complete_then_get() {
        let d = Deferred::new();
        d.complete(7).unsafe_run_sync().unwrap();
        assert_eq!(d.get().unsafe_run_sync().unwrap(), 7);
        assert_eq!(d.try_get(), Some(7));
    }

    #[test]
    fn test_second_complete_fails() {
        let d = Deferred::new();
        d.complete(1).unsafe_run_sync().unwrap();
        let err = d.complete(2).unsafe_run_sync().unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        assert_eq!(d.try_get(), Some(1));
    }

    #[test]
    fn test_waiters_notified_in_order() {
        let d = Deferred::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..5 {
            let log = log.clone();
            d.on_complete(move |v| log.lock().push((tag, v)));
        }
        assert!(d.try_complete(9));
        assert_eq!(
            *log.lock(),
            vec![(0, 9), (1, 9), (2, 9), (3, 9), (4, 9)]
        );
    }

    #[test]
    fn test_removed_waiter_not_called() {
        let d = Deferred::<u32>::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let id = d.on_complete(move |_| *h.lock() += 1).unwrap();
        assert!(d.remove_waiter(id));
        assert!(!d.remove_waiter(id));
        d.try_complete(1);
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn test_on_complete_after_set_runs_inline() {
        let d = Deferred::new();
        d.try_complete("done");
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        assert!(d.on_complete(move |v| *s.lock() = Some(v)).is_none());
        assert_eq!(*seen.lock(), Some("done"));
    }

    #[test]
    fn test_get_resumes_from_other_thread() {
        let d = Deferred::<String>::new();
        let d2 = d.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            d2.try_complete("hello".to_string());
        });
        assert_eq!(d.get().unsafe_run_sync().unwrap(), "hello");
    }

    #[test]
    fn test_ref_modify() {
        let r = Ref::new(10);
        let old = r.modify(|n| (n + 5, n)).unsafe_run_sync().unwrap();
        assert_eq!(old, 10);
        r.update(|n| n * 2).unsafe_run_sync().unwrap();
        assert_eq!(r.get().unsafe_run_sync().unwrap(), 30);
        assert_eq!(r.get_and_set(1).unsafe_run_sync().unwrap(), 30);
        assert_eq!(r.get().unsafe_run_sync().unwrap(), 1);
    }

    #[test]
    fn test_ref_try_update() {
        let r = Ref::new(1);
        assert!(r.try_update(|n| n + 1).unsafe_run_sync().unwrap());
        assert_eq!(r.get().unsafe_run_sync().unwrap(), 2);

        let other = r.clone();
        let applied = r
            .try_update(move |n| {
                other.set(100).unsafe_run_sync().unwrap();
                n + 1
            })
            .unsafe_run_sync()
            .unwrap();
        assert!(!applied);
        assert_eq!(r.get().unsafe_run_sync().unwrap(), 100);
    }

    #[test]
    fn test_ref_modify_retries_after_conflicting_write() {
        let r = Ref::new(1);
        let other = r.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let seen = r
            .modify(move |n| {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    other.set(10).unsafe_run_sync().unwrap();
                }
                (n + 1, n)
            })
            .unsafe_run_sync()
            .unwrap();
        assert_eq!(seen, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(r.get().unsafe_run_sync().unwrap(), 11);
    }

    #[test]
    fn test_ref_modify_may_read_same_ref() {
        let r = Ref::new(3);
        let other = r.clone();
        let peeked = r
            .modify(move |n| (n * 2, other.get().unsafe_run_sync().unwrap()))
            .unsafe_run_sync()
            .unwrap();
        assert_eq!(peeked, 3);
        assert_eq!(r.get().unsafe_run_sync().unwrap(), 6);
    }

    #[test]
    fn test_ref_concurrent_updates_all_land() {
        let r = Ref::new(0usize);
        crossbeam_utils::thread::scope(|s| {
            for _ in 0..4 {
                let r = r.clone();
                s.spawn(move |_| {
                    for _ in 0..250 {
                        r.update(|n| n + 1).unsafe_run_sync().unwrap();
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(r.get().unsafe_run_sync().unwrap(), 1_000);
    }
}
