//! Runtime Errors
//!
//! Every failure that travels through an effect's result channel is an
//! [`Error`]. Errors are cheap to clone because one outcome can fan out to
//! several waiters (a completed [`Deferred`](crate::sync::Deferred), a joined
//! fiber, a raced loser).
//!
//! # Components
//!
//! - `Error`: the error value carried by `RaiseError` and callbacks
//! - `CompositeFailure`: several causes gathered while releasing resources
//! - `ExitCase`: why an effect, a bracket or a scope finished

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Result type used throughout the runtime.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by an effect.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A plain message raised by user code.
    #[error("{0}")]
    Message(String),

    /// An error from outside the runtime.
    #[error(transparent)]
    External(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// User code panicked while the run-loop was evaluating it.
    #[error("panicked: {0}")]
    Panicked(String),

    /// Several failures collected during cleanup.
    #[error(transparent)]
    Composite(CompositeFailure),

    /// A protocol violation, such as completing a cell twice.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A resource finished acquiring after its owning scope closed.
    #[error("resource acquired after its scope was closed")]
    AcquireAfterScopeClosed,

    /// A timed computation did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Create an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Message(message.into())
    }

    /// Wrap an external error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::External(Arc::new(error))
    }

    /// Create an illegal-state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState(message.into())
    }

    /// Combine a primary failure with a secondary one.
    ///
    /// The primary error stays first; nested composites are flattened.
    pub fn compose(self, secondary: Error) -> Error {
        Error::Composite(CompositeFailure::new(self, vec![secondary]))
    }

    /// Returns true if this is a composite of several failures.
    pub fn is_composite(&self) -> bool {
        matches!(self, Error::Composite(_))
    }

    /// Returns true if this error reports a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Number of individual causes in this error.
    pub fn cause_count(&self) -> usize {
        match self {
            Error::Composite(c) => c.len(),
            _ => 1,
        }
    }
}

/// An aggregate of failures encountered during cascading cleanup.
///
/// Always holds at least two causes. Nested composites are flattened, so
/// every element of [`iter`](CompositeFailure::iter) is a leaf error.
#[derive(Debug, Clone)]
pub struct CompositeFailure {
    head: Box<Error>,
    tail: Vec<Error>,
}

impl CompositeFailure {
    /// Create a composite from a first cause and further causes.
    pub fn new(head: Error, tail: Vec<Error>) -> Self {
        let mut all = Vec::with_capacity(tail.len() + 1);
        flatten_into(head, &mut all);
        for e in tail {
            flatten_into(e, &mut all);
        }
        let mut iter = all.into_iter();
        // flatten_into always pushes at least one error
        let head = iter
            .next()
            .unwrap_or_else(|| Error::illegal_state("empty composite"));
        Self {
            head: Box::new(head),
            tail: iter.collect(),
        }
    }

    /// Fold a list of errors into a single error.
    ///
    /// Returns `None` for an empty list, the error itself for a single
    /// element, and a `Composite` otherwise.
    pub fn from_list(errors: Vec<Error>) -> Option<Error> {
        let mut iter = errors.into_iter();
        let head = iter.next()?;
        let tail: Vec<Error> = iter.collect();
        if tail.is_empty() {
            Some(head)
        } else {
            Some(Error::Composite(CompositeFailure::new(head, tail)))
        }
    }

    /// The first cause.
    pub fn head(&self) -> &Error {
        &self.head
    }

    /// All causes, in the order they were encountered.
    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        std::iter::once(self.head.as_ref()).chain(self.tail.iter())
    }

    /// Number of causes.
    pub fn len(&self) -> usize {
        self.tail.len() + 1
    }

    /// A composite is never empty.
    pub fn is_empty(&self) -> bool {
        false
    }
}

fn flatten_into(error: Error, out: &mut Vec<Error>) {
    match error {
        Error::Composite(c) => {
            out.push(*c.head);
            out.extend(c.tail);
        }
        other => out.push(other),
    }
}

impl fmt::Display for CompositeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failures: ", self.len())?;
        for (i, e) in self.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompositeFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.head.as_ref())
    }
}

/// The reason an effect, bracket or scope finished.
#[derive(Debug, Clone, Default)]
pub enum ExitCase {
    /// Finished normally.
    #[default]
    Completed,
    /// Finished with a failure.
    Error(Error),
    /// Cancelled before finishing.
    Canceled,
}

impl ExitCase {
    /// Normal completion.
    pub fn completed() -> Self {
        ExitCase::Completed
    }

    /// Completion with an error.
    pub fn error(e: Error) -> Self {
        ExitCase::Error(e)
    }

    /// Cancellation.
    pub fn canceled() -> Self {
        ExitCase::Canceled
    }

    /// Derive the exit case from an outcome.
    pub fn from_result<A>(result: &Result<A>) -> Self {
        match result {
            Ok(_) => ExitCase::Completed,
            Err(e) => ExitCase::Error(e.clone()),
        }
    }

    /// Returns true for `Canceled`.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ExitCase::Canceled)
    }

    /// Returns true for `Completed`.
    pub fn is_completed(&self) -> bool {
        matches!(self, ExitCase::Completed)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_list_sizes() {
        assert!(CompositeFailure::from_list(vec![]).is_none());

        let single = CompositeFailure::from_list(vec![Error::msg("a")]).unwrap();
        assert!(!single.is_composite());
        assert_eq!(single.to_string(), "a");

        let many = CompositeFailure::from_list(vec![Error::msg("a"), Error::msg("b")]).unwrap();
        assert!(many.is_composite());
        assert_eq!(many.cause_count(), 2);
    }

    #[test]
    fn test_compose_flattens() {
        let inner = Error::msg("a").compose(Error::msg("b"));
        let outer = inner.compose(Error::msg("c"));
        match outer {
            Error::Composite(c) => {
                let names: Vec<String> = c.iter().map(|e| e.to_string()).collect();
                assert_eq!(names, vec!["a", "b", "c"]);
            }
            other => panic!("expected composite, got {other:?}"),
        }
    }

    #[test]
    fn test_composite_display() {
        let e = Error::msg("first").compose(Error::msg("second"));
        assert_eq!(e.to_string(), "2 failures: first; second");
    }

    #[test]
    fn test_exit_case_canceled_is_distinct() {
        assert!(ExitCase::canceled().is_canceled());
        assert!(!ExitCase::canceled().is_completed());
        assert!(ExitCase::completed().is_completed());
    }

    #[test]
    fn test_exit_case_from_result() {
        let ok: Result<i32> = Ok(1);
        assert!(ExitCase::from_result(&ok).is_completed());
        let err: Result<i32> = Err(Error::msg("x"));
        assert!(matches!(ExitCase::from_result(&err), ExitCase::Error(_)));
    }

    #[test]
    fn test_external_error_is_transparent() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let e = Error::new(io);
        assert_eq!(e.to_string(), "disk gone");
    }
}
