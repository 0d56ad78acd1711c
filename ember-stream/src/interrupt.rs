//! Scope Interruption
//!
//! An interruptible scope owns a single-assignment [`Deferred`] that is
//! completed with an [`Interrupt`] when the scope should stop. Evaluation
//! inside the scope races every effect against that cell, and the compiler
//! checks it before each continuation.
//!
//! Interruptible children listen to their parent's cell, so interrupting a
//! scope reaches every interruptible descendant. Non-interruptible children
//! share their parent's cell and root.

use std::fmt;

use ember_runtime::{Concurrent, Deferred, Effect, Either, Error, WaiterId};

use crate::algebra::Value;
use crate::token::Token;

/// Why an interruptible scope stopped.
#[derive(Debug, Clone)]
pub enum Interrupt {
    /// Interrupted without failure; carries the interruption root.
    Scope(Token),
    /// Interrupted with a failure.
    Failed(Error),
}

/// The concurrency capabilities an interruptible scope needs, captured from
/// a [`Concurrent`] effect so scope code itself only requires [`Effect`].
pub struct Interruptible<F: Effect> {
    pub(crate) await_interrupt: fn(Deferred<Interrupt>) -> F::Of<Interrupt>,
    #[allow(clippy::type_complexity)]
    pub(crate) race: fn(
        F::Of<Interrupt>,
        F::Of<Result<Value, Error>>,
    ) -> F::Of<Either<Interrupt, Result<Value, Error>>>,
}

impl<F: Concurrent> Interruptible<F> {
    /// Capture the capabilities of `F`.
    pub fn new() -> Self {
        Interruptible {
            await_interrupt: |cell: Deferred<Interrupt>| F::lift_io(cell.get()),
            race: |interrupt, fa| F::race(interrupt, fa),
        }
    }
}

impl<F: Concurrent> Default for Interruptible<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Effect> Clone for Interruptible<F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F: Effect> Copy for Interruptible<F> {}

impl<F: Effect> fmt::Debug for Interruptible<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Interruptible")
    }
}

/// Interruption state attached to a scope.
pub(crate) struct InterruptContext<F: Effect> {
    pub(crate) interruptible: Interruptible<F>,
    pub(crate) cell: Deferred<Interrupt>,
    pub(crate) interrupt_root: Token,
    parent_link: Option<(Deferred<Interrupt>, WaiterId)>,
}

impl<F: Effect> Clone for InterruptContext<F> {
    fn clone(&self) -> Self {
        InterruptContext {
            interruptible: self.interruptible,
            cell: self.cell.clone(),
            interrupt_root: self.interrupt_root,
            parent_link: self.parent_link.clone(),
        }
    }
}

impl<F: Effect> InterruptContext<F> {
    /// Context of an interruptible scope without an interruptible parent.
    pub(crate) fn root(interruptible: Interruptible<F>, scope_id: Token) -> Self {
        InterruptContext {
            interruptible,
            cell: Deferred::new(),
            interrupt_root: scope_id,
            parent_link: None,
        }
    }

    /// Context of a child scope opened under this one.
    ///
    /// An interruptible child gets its own cell fed from this one; any other
    /// child shares this cell.
    pub(crate) fn child(&self, interruptible: Option<Interruptible<F>>, scope_id: Token) -> Self {
        match interruptible {
            None => InterruptContext {
                interruptible: self.interruptible,
                cell: self.cell.clone(),
                interrupt_root: self.interrupt_root,
                parent_link: None,
            },
            Some(interruptible) => {
                let cell = Deferred::new();
                let forward = cell.clone();
                let waiter = self.cell.on_complete(move |interrupt| {
                    forward.try_complete(interrupt);
                });
                InterruptContext {
                    interruptible,
                    cell,
                    interrupt_root: scope_id,
                    parent_link: waiter.map(|id| (self.cell.clone(), id)),
                }
            }
        }
    }

    /// Stop listening to the parent's cell.
    pub(crate) fn cancel_parent(&self) {
        if let Some((parent, id)) = &self.parent_link {
            parent.remove_waiter(*id);
        }
    }

    /// Complete the cell. Returns false if it was already interrupted.
    pub(crate) fn interrupt(&self, cause: Result<(), Error>) -> bool {
        let interrupt = match cause {
            Ok(()) => Interrupt::Scope(self.interrupt_root),
            Err(e) => Interrupt::Failed(e),
        };
        self.cell.try_complete(interrupt)
    }

    pub(crate) fn current(&self) -> Option<Interrupt> {
        self.cell.try_get()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ember_runtime::IoEffect;

    fn ctx() -> InterruptContext<IoEffect> {
        InterruptContext::root(Interruptible::new(), Token::new())
    }

    #[test]
    fn test_interrupt_once() {
        let c = ctx();
        assert!(c.current().is_none());
        assert!(c.interrupt(Ok(())));
        assert!(!c.interrupt(Err(Error::msg("late"))));
        match c.current() {
            Some(Interrupt::Scope(root)) => assert_eq!(root, c.interrupt_root),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_interruptible_child_follows_parent() {
        let parent = ctx();
        let child = parent.child(Some(Interruptible::new()), Token::new());
        assert_ne!(child.interrupt_root, parent.interrupt_root);

        parent.interrupt(Err(Error::msg("stop")));
        // Waiters are notified through the trampoline, which has drained
        // by the time `try_complete` returns on this thread.
        assert!(matches!(child.current(), Some(Interrupt::Failed(_))));
    }

    #[test]
    fn test_child_interrupt_does_not_reach_parent() {
        let parent = ctx();
        let child = parent.child(Some(Interruptible::new()), Token::new());
        child.interrupt(Ok(()));
        assert!(parent.current().is_none());
    }

    #[test]
    fn test_cancel_parent_detaches() {
        let parent = ctx();
        let child = parent.child(Some(Interruptible::new()), Token::new());
        child.cancel_parent();
        parent.interrupt(Ok(()));
        assert!(child.current().is_none());
    }

    #[test]
    fn test_plain_child_shares_cell() {
        let parent = ctx();
        let child = parent.child(None, Token::new());
        assert_eq!(child.interrupt_root, parent.interrupt_root);
        child.interrupt(Ok(()));
        assert!(parent.current().is_some());
    }

    #[test]
    fn test_child_of_interrupted_parent_starts_interrupted() {
        let parent = ctx();
        parent.interrupt(Ok(()));
        let child = parent.child(Some(Interruptible::new()), Token::new());
        assert!(child.current().is_some());
    }
}
