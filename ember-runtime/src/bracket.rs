//! # Bracket
//!
//! Acquire a resource, use it, and release it exactly once regardless of
//! how the use ends.
//!
//! ## Design
//!
//! - Acquisition runs uncancelable. If it fails, neither use nor release
//!   runs.
//! - A [`ForwardCancelable`] is pushed on the caller's connection before
//!   acquiring, so a cancel that arrives mid-acquisition releases the
//!   resource as soon as it exists.
//! - Release runs uncancelable and at most once. A release racing with a
//!   cancellation token is awaited by the loser rather than run twice.
//! - A use failure followed by a release failure raises both, composed.
//! - `use_` and `release` each receive the resource, so [`IO::bracket`]
//!   needs `A: Clone`. A resource that is not `Clone` goes through
//!   [`IO::bracket_shared`], which hands both sides the same `Arc<A>`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_runtime::IO;
//!
//! let program = IO::delay(|| open_file()).bracket_shared(
//!     |file| IO::delay(move || file.read_all()),
//!     |file, _| IO::delay(move || file.close()),
//! );
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::callback::Callback;
use crate::connection::{Connection, ForwardCancelable};
use crate::error::{Error, ExitCase};
use crate::io::{unbox, Node, IO};
use crate::panic::catch_panic;
use crate::run_loop;
use crate::sync::Deferred;

type ReleaseFn<A> = Box<dyn FnOnce(A, ExitCase) -> IO<()> + Send>;

/// Holds the acquired value until its release runs.
struct ReleaseFrame<A> {
    pending: Mutex<Option<(A, ReleaseFn<A>)>>,
    released: Deferred<()>,
}

impl<A: Send + 'static> ReleaseFrame<A> {
    fn new(a: A, release: ReleaseFn<A>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Some((a, release))),
            released: Deferred::new(),
        })
    }

    /// Run the release once; later callers wait for the first to finish.
    fn release(self: Arc<Self>, exit: ExitCase) -> IO<()> {
        IO::suspend(move || {
            let taken = self.pending.lock().take();
            match taken {
                None => self.released.get(),
                Some((a, release)) => {
                    let released = self.released.clone();
                    let action = match catch_panic(move || release(a, exit)) {
                        Ok(io) => io,
                        Err(e) => IO::raise_error(e),
                    };
                    action.attempt().flat_map(move |result| {
                        released.try_complete(());
                        IO::from_result(result)
                    })
                }
            }
        })
    }

    /// Release on the normal path: uncancelable, then pop the bracket's token.
    fn release_and_pop(self: Arc<Self>, exit: ExitCase) -> IO<()> {
        IO::from_node(Node::ContextSwitch {
            source: Box::new(self.release(exit).into_node()),
            modify: Box::new(|_| Connection::uncancelable()),
            restore: Some(Box::new(|old, _| {
                old.pop();
                old
            })),
        })
    }

    /// The token run if the bracket is cancelled during use.
    fn cancel_token(self: Arc<Self>) -> IO<()> {
        self.release(ExitCase::Canceled).uncancelable()
    }
}

impl<A: Clone + Send + 'static> IO<A> {
    /// Acquire with `self`, use with `use_`, release with `release`.
    pub fn bracket<B, U, R>(self, use_: U, release: R) -> IO<B>
    where
        B: Send + 'static,
        U: FnOnce(A) -> IO<B> + Send + 'static,
        R: FnOnce(A) -> IO<()> + Send + 'static,
    {
        self.bracket_case(use_, move |a, _| release(a))
    }

    /// Like [`bracket`](Self::bracket), with the release told how use ended.
    pub fn bracket_case<B, U, R>(self, use_: U, release: R) -> IO<B>
    where
        B: Send + 'static,
        U: FnOnce(A) -> IO<B> + Send + 'static,
        R: FnOnce(A, ExitCase) -> IO<()> + Send + 'static,
    {
        let acquire = self;
        IO::async_with_conn(
            move |conn: Connection, cb: Callback<B>| {
                let forward = ForwardCancelable::new();
                conn.push(forward.cancel());
                if conn.is_canceled() {
                    let _ = forward.complete(IO::unit());
                    return;
                }

                run_loop::start(
                    acquire.into_node(),
                    Connection::uncancelable(),
                    Box::new(move |outcome| match outcome.map(unbox::<A>) {
                        Ok(a) => {
                            let frame = ReleaseFrame::new(a.clone(), Box::new(release));
                            let _ = forward.complete(Arc::clone(&frame).cancel_token());
                            if conn.is_canceled() {
                                return;
                            }
                            let used = match catch_panic(move || use_(a)) {
                                Ok(io) => io,
                                Err(e) => IO::raise_error(e),
                            };
                            let on_error = Arc::clone(&frame);
                            let guarded = used.redeem_with(
                                move |e: Error| {
                                    on_error
                                        .release_and_pop(ExitCase::Error(e.clone()))
                                        .attempt()
                                        .flat_map(move |r| {
                                            IO::raise_error(match r {
                                                Ok(()) => e,
                                                Err(e2) => e.compose(e2),
                                            })
                                        })
                                },
                                move |b: B| frame.release_and_pop(ExitCase::Completed).as_(b),
                            );
                            run_loop::start(
                                guarded.into_node(),
                                conn,
                                Box::new(move |outcome| {
                                    cb.call(outcome.map(unbox::<B>));
                                }),
                            );
                        }
                        Err(e) => {
                            conn.pop();
                            let _ = forward.complete(IO::unit());
                            cb.fail(e);
                        }
                    }),
                );
            },
            true,
        )
    }
}

impl<A: Send + Sync + 'static> IO<A> {
    /// [`bracket_case`](Self::bracket_case) for resources that are not
    /// `Clone`: the acquired value is moved into an `Arc` shared by `use_`
    /// and `release`.
    pub fn bracket_shared<B, U, R>(self, use_: U, release: R) -> IO<B>
    where
        B: Send + 'static,
        U: FnOnce(Arc<A>) -> IO<B> + Send + 'static,
        R: FnOnce(Arc<A>, ExitCase) -> IO<()> + Send + 'static,
    {
        self.map(Arc::new).bracket_case(use_, release)
    }
}

impl<A: Send + 'static> IO<A> {
    /// Run `finalizer` however this evaluation ends.
    pub fn guarantee(self, finalizer: IO<()>) -> IO<A> {
        self.guarantee_case(move |_| finalizer)
    }

    /// Run `finalizer` with the exit case however this evaluation ends.
    pub fn guarantee_case<F>(self, finalizer: F) -> IO<A>
    where
        F: FnOnce(ExitCase) -> IO<()> + Send + 'static,
    {
        IO::unit().bracket_case(move |()| self, move |(), exit| finalizer(exit))
    }

    /// Run `finalizer` only if this evaluation is cancelled.
    pub fn on_cancel(self, finalizer: IO<()>) -> IO<A> {
        self.guarantee_case(move |exit| match exit {
            ExitCase::Canceled => finalizer,
            _ => IO::unit(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    type Log = Arc<Mutex<Vec<String>>>;

    fn push(log: &Log, entry: impl Into<String>) -> IO<()> {
        let log = log.clone();
        let entry = entry.into();
        IO::delay(move || log.lock().push(entry))
    }

    fn exit_name(exit: &ExitCase) -> &'static str {
        match exit {
            ExitCase::Completed => "completed",
            ExitCase::Error(_) => "error",
            ExitCase::Canceled => "canceled",
        }
    }

    #[test]
    fn test_bracket_success() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let (l1, l2) = (log.clone(), log.clone());
        let io = IO::pure(5).bracket_case(
            move |n| push(&l1, format!("use {n}")).as_(n * 2),
            move |n, exit| push(&l2, format!("release {n} {}", exit_name(&exit))),
        );
        assert_eq!(io.unsafe_run_sync().unwrap(), 10);
        assert_eq!(*log.lock(), vec!["use 5", "release 5 completed"]);
    }

    #[test]
    fn test_bracket_use_failure_releases() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let io: IO<i32> = IO::pure(1).bracket_case(
            |_| IO::raise_error(Error::msg("use failed")),
            move |_, exit| push(&l, exit_name(&exit)),
        );
        assert_eq!(io.unsafe_run_sync().unwrap_err().to_string(), "use failed");
        assert_eq!(*log.lock(), vec!["error"]);
    }

    #[test]
    fn test_bracket_composes_release_failure() {
        let io: IO<i32> = IO::pure(1).bracket(
            |_| IO::raise_error(Error::msg("use failed")),
            |_| IO::raise_error(Error::msg("release failed")),
        );
        let err = io.unsafe_run_sync().unwrap_err();
        assert!(err.is_composite());
        assert_eq!(err.cause_count(), 2);
    }

    #[test]
    fn test_acquire_failure_skips_use_and_release() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let (l1, l2) = (log.clone(), log.clone());
        let io: IO<i32> = IO::<i32>::raise_error(Error::msg("acquire failed"))
            .bracket(move |_| push(&l1, "use").as_(0), move |_| push(&l2, "release"));
        assert!(io.unsafe_run_sync().is_err());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_cancel_during_use_releases_once() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let in_use = Deferred::<()>::new();
        let signal = in_use.clone();
        let io: IO<()> = IO::pure(()).bracket_case(
            move |()| signal.complete(()).then(IO::never()),
            move |(), exit| push(&l, exit_name(&exit)),
        );
        let token = io.run_cancelable(|_| {});
        in_use.get().unsafe_run_sync().unwrap();
        token.unsafe_run_sync().unwrap();
        assert_eq!(*log.lock(), vec!["canceled"]);
    }

    #[test]
    fn test_bracket_shared_takes_non_clone_resource() {
        struct Handle {
            name: String,
            closed: Mutex<bool>,
        }

        let seen: Arc<Mutex<Option<Arc<Handle>>>> = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let io = IO::delay(|| Handle { name: "db".into(), closed: Mutex::new(false) }).bracket_shared(
            |h| IO::delay(move || h.name.len()),
            move |h, exit| {
                IO::delay(move || {
                    assert!(matches!(exit, ExitCase::Completed));
                    *h.closed.lock() = true;
                    *s.lock() = Some(h);
                })
            },
        );
        assert_eq!(io.unsafe_run_sync().unwrap(), 2);

        let handle = seen.lock().take().unwrap();
        assert!(*handle.closed.lock());
        assert_eq!(handle.name, "db");
    }

    #[test]
    fn test_guarantee_runs_on_both_paths() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        IO::pure(1).guarantee(push(&log, "ok")).unsafe_run_sync().unwrap();
        let _ = IO::<i32>::raise_error(Error::msg("x"))
            .guarantee(push(&log, "err"))
            .unsafe_run_sync();
        assert_eq!(*log.lock(), vec!["ok", "err"]);
    }

    #[test]
    fn test_on_cancel_skipped_on_success() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        IO::pure(1).on_cancel(push(&log, "cancel")).unsafe_run_sync().unwrap();
        assert!(log.lock().is_empty());
    }
}
