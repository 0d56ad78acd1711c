//! # Racing
//!
//! [`IO::race_pair`] runs two evaluations concurrently and completes with
//! the first to finish, handing back a [`Fiber`] for the other one.
//! [`IO::race`] additionally cancels the loser.
//!
//! Each side runs under its own connection. Both are bound to the caller's
//! connection, so cancelling the race cancels both sides. When the winner
//! fails, the loser is cancelled first and the failures are composed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::callback::Callback;
use crate::connection::Connection;
use crate::error::Error;
use crate::fiber::{Fiber, FiberCell};
use crate::io::{unbox, IO};
use crate::panic::report_failure;
use crate::run_loop;

/// One of two values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Either<L, R> {
    /// The left value.
    Left(L),
    /// The right value.
    Right(R),
}

impl<L, R> Either<L, R> {
    /// Returns true for `Left`.
    pub fn is_left(&self) -> bool {
        matches!(self, Either::Left(_))
    }

    /// Returns true for `Right`.
    pub fn is_right(&self) -> bool {
        matches!(self, Either::Right(_))
    }

    /// The left value, if any.
    pub fn left(self) -> Option<L> {
        match self {
            Either::Left(l) => Some(l),
            Either::Right(_) => None,
        }
    }

    /// The right value, if any.
    pub fn right(self) -> Option<R> {
        match self {
            Either::Left(_) => None,
            Either::Right(r) => Some(r),
        }
    }
}

/// Winner value plus the loser's fiber.
pub type RacePair<A, B> = Either<(A, Fiber<B>), (Fiber<A>, B)>;

/// Deliver the winner's failure after cancelling the loser.
fn fail_after_cancel<T: Send + 'static>(loser: &Connection, main: Connection, cb: Callback<T>, e: Error) {
    loser.cancel().run_async(move |cancel_result| {
        main.pop();
        cb.fail(match cancel_result {
            Ok(()) => e,
            Err(e2) => e.compose(e2),
        });
    });
}

impl<A: Send + 'static> IO<A> {
    /// Race two evaluations, returning the winner's value and the loser's
    /// fiber.
    pub fn race_pair<B: Send + 'static>(self, other: IO<B>) -> IO<RacePair<A, B>> {
        let lh = self;
        let rh = other;
        IO::async_with_conn(
            move |main: Connection, cb: Callback<RacePair<A, B>>| {
                let active = Arc::new(AtomicBool::new(true));
                let conn_l = Connection::new();
                let conn_r = Connection::new();
                main.push_pair(&conn_l, &conn_r);

                let cell_l: Arc<FiberCell<A>> = Arc::new(FiberCell::new());
                let cell_r: Arc<FiberCell<B>> = Arc::new(FiberCell::new());

                let finish_l = {
                    let (active, main, cb) = (active.clone(), main.clone(), cb.clone());
                    let (cell_l, cell_r) = (cell_l.clone(), cell_r.clone());
                    let conn_r = conn_r.clone();
                    move |outcome: Result<A, Error>| {
                        if !active.swap(false, Ordering::SeqCst) {
                            cell_l.complete(outcome);
                            return;
                        }
                        match outcome {
                            Ok(a) => {
                                main.pop();
                                cb.complete(Either::Left((a, Fiber::from_parts(cell_r, conn_r))));
                            }
                            Err(e) => fail_after_cancel(&conn_r, main, cb, e),
                        }
                    }
                };

                let finish_r = {
                    let (active, main, cb) = (active, main, cb);
                    let (cell_l, cell_r) = (cell_l, cell_r);
                    let conn_l = conn_l.clone();
                    move |outcome: Result<B, Error>| {
                        if !active.swap(false, Ordering::SeqCst) {
                            cell_r.complete(outcome);
                            return;
                        }
                        match outcome {
                            Ok(b) => {
                                main.pop();
                                cb.complete(Either::Right((Fiber::from_parts(cell_l, conn_l), b)));
                            }
                            Err(e) => fail_after_cancel(&conn_l, main, cb, e),
                        }
                    }
                };

                run_loop::start(
                    IO::shift().then(lh).into_node(),
                    conn_l,
                    Box::new(move |outcome| finish_l(outcome.map(unbox::<A>))),
                );
                run_loop::start(
                    IO::shift().then(rh).into_node(),
                    conn_r,
                    Box::new(move |outcome| finish_r(outcome.map(unbox::<B>))),
                );
            },
            true,
        )
    }

    /// Race two evaluations and cancel the loser.
    ///
    /// Completes once the loser's cancellation has finished. A failure while
    /// cancelling the loser is reported, not raised.
    pub fn race<B: Send + 'static>(self, other: IO<B>) -> IO<Either<A, B>> {
        self.race_pair(other).flat_map(|pair| match pair {
            Either::Left((a, loser)) => loser.cancel().attempt().map(move |r| {
                if let Err(e) = r {
                    report_failure(&e);
                }
                Either::Left(a)
            }),
            Either::Right((loser, b)) => loser.cancel().attempt().map(move |r| {
                if let Err(e) = r {
                    report_failure(&e);
                }
                Either::Right(b)
            }),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Deferred;
    use std::time::Duration;

    fn slow<A: Send + 'static>(a: A, millis: u64) -> IO<A> {
        IO::blocking(move || {
            std::thread::sleep(Duration::from_millis(millis));
            a
        })
    }

    #[test]
    fn test_either_accessors() {
        let l: Either<i32, &str> = Either::Left(1);
        assert!(l.is_left());
        assert_eq!(l.left(), Some(1));
        let r: Either<i32, &str> = Either::Right("r");
        assert!(r.is_right());
        assert_eq!(r.right(), Some("r"));
    }

    #[test]
    fn test_race_fast_side_wins() {
        let result = slow(1, 200).race(IO::pure("fast")).unsafe_run_sync().unwrap();
        assert_eq!(result, Either::Right("fast"));
    }

    #[test]
    fn test_race_pair_returns_joinable_loser() {
        let pair = IO::pure(1).race_pair(slow(2, 50)).unsafe_run_sync().unwrap();
        match pair {
            Either::Left((a, loser)) => {
                assert_eq!(a, 1);
                assert_eq!(loser.join().unsafe_run_sync().unwrap(), 2);
            }
            Either::Right(_) => panic!("slow side should not win"),
        }
    }

    #[test]
    fn test_race_cancels_loser() {
        let released = Deferred::<()>::new();
        let started = Deferred::<()>::new();
        let r = released.clone();
        let s = started.clone();
        let loser: IO<()> = IO::cancelable(move |_cb| {
            s.try_complete(());
            IO::delay(move || {
                r.try_complete(());
            })
        });

        let winner = started.get().as_(7);
        let result = winner.race(loser).unsafe_run_sync().unwrap();
        assert_eq!(result, Either::Left(7));
        assert!(released.is_set());
    }

    #[test]
    fn test_winner_failure_cancels_loser_first() {
        let released = Deferred::<()>::new();
        let started = Deferred::<()>::new();
        let r = released.clone();
        let s = started.clone();
        let never: IO<()> = IO::cancelable(move |_cb| {
            s.try_complete(());
            IO::delay(move || {
                r.try_complete(());
            })
        });

        let failing: IO<()> = started.get().then(IO::raise_error(Error::msg("left failed")));
        let err = failing.race(never).unsafe_run_sync().unwrap_err();
        assert_eq!(err.to_string(), "left failed");
        assert!(released.is_set());
    }

    #[test]
    fn test_cancel_race_cancels_both() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let started_l = Deferred::<()>::new();
        let started_r = Deferred::<()>::new();
        let side = |count: Arc<std::sync::atomic::AtomicUsize>, started: Deferred<()>| {
            IO::<()>::cancelable(move |_cb| {
                started.try_complete(());
                IO::delay(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            })
        };
        let race = side(count.clone(), started_l.clone()).race(side(count.clone(), started_r.clone()));
        let token = race.run_cancelable(|_| {});
        started_l.get().then(started_r.get()).unsafe_run_sync().unwrap();
        token.unsafe_run_sync().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
