//! Scoped Resources
//!
//! A [`Resource`] is the record a scope keeps for one acquired value: its
//! finalizer, whether its scope still holds it, and how many leases pin it.
//! The finalizer runs exactly once, when the resource is both released and
//! unleased.
//!
//! ## Lifecycle
//!
//! ```text
//! new ──acquired(fin)──▶ open ──release──▶ released ──last lease──▶ finalized
//!                          │                                          ▲
//!                          └──────── release with no leases ──────────┘
//! ```

use std::sync::Arc;

use ember_runtime::{CompositeFailure, Effect, Error, ExitCase};
use parking_lot::Mutex;

use crate::algebra::Finalizer;
use crate::token::Token;

struct ResourceState<F: Effect> {
    open: bool,
    finalizer: Option<Finalizer<F>>,
    leases: usize,
}

impl<F: Effect> ResourceState<F> {
    fn is_finished(&self) -> bool {
        !self.open && self.leases == 0
    }
}

/// A resource registered with a scope.
pub struct Resource<F: Effect> {
    id: Token,
    state: Mutex<ResourceState<F>>,
}

impl<F: Effect> std::fmt::Debug for Resource<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("open", &state.open)
            .field("leases", &state.leases)
            .finish()
    }
}

/// Run a finalizer, capturing its failure.
pub(crate) fn run_finalizer<F: Effect>(finalizer: Finalizer<F>, exit: ExitCase) -> F::Of<Result<(), Error>> {
    F::attempt(F::suspend(move || finalizer(exit)))
}

impl<F: Effect> Resource<F> {
    /// A fresh open resource with no finalizer yet.
    pub fn new() -> Arc<Self> {
        Arc::new(Resource {
            id: Token::new(),
            state: Mutex::new(ResourceState { open: true, finalizer: None, leases: 0 }),
        })
    }

    /// Identity of this resource.
    pub fn id(&self) -> Token {
        self.id
    }

    /// True until the owning scope releases it.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of outstanding leases.
    pub fn lease_count(&self) -> usize {
        self.state.lock().leases
    }

    /// Attach the finalizer once acquisition succeeded.
    ///
    /// Yields `true` when the finalizer was stored. If the resource finished
    /// while it was being acquired, the finalizer runs right away and the
    /// result is `false` (or the finalizer's failure).
    pub fn acquired(self: &Arc<Self>, finalizer: Finalizer<F>) -> F::Of<Result<bool, Error>> {
        let this = Arc::clone(self);
        F::suspend(move || {
            let mut state = this.state.lock();
            if state.is_finished() {
                drop(state);
                tracing::trace!(resource = %this.id, "resource finished before acquisition completed");
                F::map(run_finalizer::<F>(finalizer, ExitCase::Completed), |r| r.map(|()| false))
            } else {
                state.finalizer = Some(finalizer);
                F::pure(Ok(true))
            }
        })
    }

    /// Mark the resource released by its scope.
    ///
    /// Runs the finalizer with `exit` unless a lease still pins the
    /// resource, in which case the last lease to cancel runs it.
    pub fn release(self: &Arc<Self>, exit: ExitCase) -> F::Of<Result<(), Error>> {
        let this = Arc::clone(self);
        F::suspend(move || {
            let finalizer = {
                let mut state = this.state.lock();
                state.open = false;
                if state.leases == 0 {
                    state.finalizer.take()
                } else {
                    None
                }
            };
            match finalizer {
                Some(finalizer) => {
                    tracing::trace!(resource = %this.id, "running finalizer");
                    run_finalizer::<F>(finalizer, exit)
                }
                None => F::pure(Ok(())),
            }
        })
    }

    /// Pin the resource. Returns false if it is no longer open.
    pub(crate) fn try_lease(&self) -> bool {
        let mut state = self.state.lock();
        if state.open {
            state.leases += 1;
            true
        } else {
            false
        }
    }

    /// Drop one pin, running the finalizer if this was the last one on a
    /// released resource.
    pub(crate) fn cancel_lease(self: &Arc<Self>) -> F::Of<Result<(), Error>> {
        let this = Arc::clone(self);
        F::suspend(move || {
            let finalizer = {
                let mut state = this.state.lock();
                state.leases = state.leases.saturating_sub(1);
                if state.is_finished() {
                    state.finalizer.take()
                } else {
                    None
                }
            };
            match finalizer {
                Some(finalizer) => run_finalizer::<F>(finalizer, ExitCase::Completed),
                None => F::pure(Ok(())),
            }
        })
    }
}

/// Pins on a set of resources, taken with
/// [`CompileScope::lease`](crate::CompileScope::lease).
///
/// While a lease is held none of its resources are finalized, even if their
/// scopes close.
pub struct Lease<F: Effect> {
    resources: Vec<Arc<Resource<F>>>,
}

impl<F: Effect> Lease<F> {
    pub(crate) fn new(resources: Vec<Arc<Resource<F>>>) -> Self {
        Lease { resources }
    }

    /// Number of pinned resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// True if nothing was pinned.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Release every pin, running finalizers that were waiting on it.
    /// Failures are composed.
    pub fn cancel(self) -> F::Of<Result<(), Error>> {
        let steps = self.resources.iter().map(|r| r.cancel_lease()).collect();
        F::map(collect_errors::<F>(steps), |errors| match CompositeFailure::from_list(errors) {
            None => Ok(()),
            Some(e) => Err(e),
        })
    }
}

/// Run each effect in order, gathering every failure.
pub(crate) fn collect_errors<F: Effect>(steps: Vec<F::Of<Result<(), Error>>>) -> F::Of<Vec<Error>> {
    collect_from::<F>(steps.into_iter(), Vec::new())
}

fn collect_from<F: Effect>(
    mut steps: std::vec::IntoIter<F::Of<Result<(), Error>>>,
    errors: Vec<Error>,
) -> F::Of<Vec<Error>> {
    match steps.next() {
        None => F::pure(errors),
        Some(step) => F::flat_map(F::attempt(step), move |result| {
            let mut errors = errors;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) | Err(e) => errors.push(e),
            }
            collect_from::<F>(steps, errors)
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ember_runtime::{IoEffect, IO};

    type Res = Resource<IoEffect>;

    fn counting(counter: &Arc<AtomicUsize>) -> Finalizer<IoEffect> {
        let c = counter.clone();
        Box::new(move |_exit| {
            IO::delay(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn test_release_runs_finalizer_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Res::new();
        assert!(r.acquired(counting(&runs)).unsafe_run_sync().unwrap().unwrap());
        r.release(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        r.release(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!r.is_open());
    }

    #[test]
    fn test_acquired_after_release_finalizes_immediately() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Res::new();
        r.release(ExitCase::Canceled).unsafe_run_sync().unwrap().unwrap();
        let stored = r.acquired(counting(&runs)).unsafe_run_sync().unwrap().unwrap();
        assert!(!stored);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lease_defers_finalizer() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Res::new();
        r.acquired(counting(&runs)).unsafe_run_sync().unwrap().unwrap();

        assert!(r.try_lease());
        let lease = Lease::new(vec![r.clone()]);
        r.release(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(!r.try_lease());

        lease.cancel().unsafe_run_sync().unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(r.lease_count(), 0);
    }

    #[test]
    fn test_failing_finalizer_is_reported() {
        let r = Res::new();
        let fin: Finalizer<IoEffect> = Box::new(|_| IO::raise_error(Error::msg("close failed")));
        r.acquired(fin).unsafe_run_sync().unwrap().unwrap();
        let err = r.release(ExitCase::Completed).unsafe_run_sync().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "close failed");
    }

    #[test]
    fn test_collect_errors_keeps_order() {
        let steps: Vec<IO<Result<(), Error>>> = vec![
            IO::pure(Err(Error::msg("a"))),
            IO::pure(Ok(())),
            IO::raise_error(Error::msg("b")),
        ];
        let errors = collect_errors::<IoEffect>(steps).unsafe_run_sync().unwrap();
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        assert_eq!(messages, vec!["a", "b"]);
    }
}
