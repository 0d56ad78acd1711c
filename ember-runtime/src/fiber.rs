//! # Fibers
//!
//! A [`Fiber`] is a handle to an evaluation started concurrently with
//! [`IO::start`]. It runs on the scheduler under its own connection, so it
//! can be joined for its outcome or cancelled independently of the code
//! that started it.
//!
//! ## Design
//!
//! - The fiber's outcome is stored once in a shared cell; a [`Deferred`]
//!   signals that the cell is filled.
//! - Joining is single-consumer: the first join takes the outcome, a second
//!   join fails with an illegal state.
//! - A cancelled fiber never fills its cell, so joining it waits forever.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::error::Error;
use crate::io::{unbox, IO};
use crate::run_loop;
use crate::sync::Deferred;

/// Process-unique fiber number, shown in trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        FiberId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The number behind this id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

/// Write-once outcome slot shared between a fiber and its handle.
pub(crate) struct FiberCell<A> {
    done: Deferred<()>,
    slot: Mutex<Option<Result<A, Error>>>,
}

impl<A: Send + 'static> FiberCell<A> {
    pub(crate) fn new() -> Self {
        Self {
            done: Deferred::new(),
            slot: Mutex::new(None),
        }
    }

    /// Store the outcome. Returns false if one was already stored.
    pub(crate) fn complete(&self, result: Result<A, Error>) -> bool {
        {
            let mut slot = self.slot.lock();
            if slot.is_some() || self.done.is_set() {
                return false;
            }
            *slot = Some(result);
        }
        self.done.try_complete(())
    }
}

/// Handle to a concurrently running evaluation.
pub struct Fiber<A> {
    id: FiberId,
    cell: Arc<FiberCell<A>>,
    conn: Connection,
}

impl<A> fmt::Debug for Fiber<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("conn", &self.conn)
            .finish()
    }
}

impl<A: Send + 'static> Fiber<A> {
    pub(crate) fn from_parts(cell: Arc<FiberCell<A>>, conn: Connection) -> Self {
        Self {
            id: FiberId::next(),
            cell,
            conn,
        }
    }

    /// This fiber's identifier.
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Returns true once the fiber produced an outcome.
    pub fn is_completed(&self) -> bool {
        self.cell.done.is_set()
    }

    /// Wait for the fiber's outcome.
    pub fn join(&self) -> IO<A> {
        let cell = Arc::clone(&self.cell);
        let id = self.id;
        self.cell.done.get().flat_map(move |()| {
            let taken = cell.slot.lock().take();
            match taken {
                Some(result) => IO::from_result(result),
                None => IO::raise_error(Error::illegal_state(format!("{id} already joined"))),
            }
        })
    }

    /// Cancel the fiber. Completes once its cancellation tokens have run.
    pub fn cancel(&self) -> IO<()> {
        tracing::trace!(fiber = %self.id, "cancelling fiber");
        self.conn.cancel()
    }
}

impl<A: Send + 'static> IO<A> {
    /// Start this evaluation concurrently on the scheduler.
    ///
    /// The returned fiber runs under a fresh connection; cancelling the
    /// caller does not cancel the fiber.
    pub fn start(self) -> IO<Fiber<A>> {
        IO::async_with_conn(
            move |_conn, cb| {
                let conn = Connection::new();
                let cell = Arc::new(FiberCell::new());
                let fiber = Fiber::from_parts(Arc::clone(&cell), conn.clone());
                tracing::trace!(fiber = %fiber.id(), "fiber started");

                let body = IO::shift().then(self);
                run_loop::start(
                    body.into_node(),
                    conn,
                    Box::new(move |outcome| {
                        cell.complete(outcome.map(unbox::<A>));
                    }),
                );
                cb.complete(fiber);
            },
            true,
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_fiber_ids_are_unique() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert!(b > a);
        assert_eq!(FiberId(7).to_string(), "fiber#7");
    }

    #[test]
    fn test_start_and_join() {
        let io = IO::delay(|| 40).map(|n| n + 2).start().flat_map(|f| f.join());
        assert_eq!(io.unsafe_run_sync().unwrap(), 42);
    }

    #[test]
    fn test_join_failure() {
        let io = IO::<i32>::raise_error(Error::msg("fiber failed"))
            .start()
            .flat_map(|f| f.join());
        assert_eq!(io.unsafe_run_sync().unwrap_err().to_string(), "fiber failed");
    }

    #[test]
    fn test_second_join_is_illegal() {
        let fiber = IO::pure(1).start().unsafe_run_sync().unwrap();
        assert_eq!(fiber.join().unsafe_run_sync().unwrap(), 1);
        assert!(matches!(
            fiber.join().unsafe_run_sync(),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn test_cancel_stops_fiber() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let gate = Deferred::<()>::new();
        let body = gate.get().then(IO::delay(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        let fiber = body.start().unsafe_run_sync().unwrap();
        // Let the fiber reach the gate before cancelling.
        std::thread::sleep(Duration::from_millis(20));
        fiber.cancel().unsafe_run_sync().unwrap();
        gate.try_complete(());
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!fiber.is_completed());
    }
}
