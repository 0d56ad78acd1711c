//! # Timer and Clock
//!
//! Time-based effects: cancelable sleeps, timeouts, and clock readings.
//!
//! ## Design
//!
//! - One background thread (`ember-timer`) owns a min-heap of deadlines and
//!   parks on a condition variable until the earliest one.
//! - Expired entries are handed to the scheduler, so sleeping evaluations
//!   resume on a compute worker, never on the timer thread.
//! - Cancelling a sleep removes its entry; a removed entry never fires.
//!
//! ## Components
//!
//! - [`Timer`]: the deadline queue
//! - [`sleep`], [`real_time`], [`monotonic`]: effects over the global timer
//! - [`IO::timeout`], [`IO::timeout_to`]: racing against a sleep
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use ember_runtime::{timer, IO};
//!
//! let slow = timer::sleep(Duration::from_secs(5)).as_("done");
//! let err = slow.timeout(Duration::from_millis(10)).unsafe_run_sync().unwrap_err();
//! assert!(err.is_timeout());
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::Error;
use crate::io::IO;
use crate::race::Either;
use crate::scheduler::Scheduler;
use crate::trampoline::Task;

/// Handle to a scheduled timer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Default)]
struct TimerState {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Task>,
    next_id: u64,
}

struct TimerInner {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// A deadline queue served by one background thread.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

static GLOBAL_TIMER: OnceLock<Timer> = OnceLock::new();

impl Timer {
    /// Create a timer and start its thread.
    pub fn new() -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
        });
        let thread_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name("ember-timer".to_string())
            .spawn(move || timer_loop(thread_inner))
            .expect("failed to spawn timer thread");
        Self { inner }
    }

    /// The process-wide timer.
    pub fn global() -> &'static Timer {
        GLOBAL_TIMER.get_or_init(Timer::new)
    }

    /// Run `task` on the scheduler once `delay` has elapsed.
    pub fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let deadline = Instant::now() + delay;
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.deadlines.push(Reverse((deadline, id)));
        state.entries.insert(id, task);
        drop(state);
        self.inner.wakeup.notify_one();
        TimerId(id)
    }

    /// Remove a pending entry. Returns false if it already fired.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.inner.state.lock().entries.remove(&id.0).is_some()
    }

    /// Number of pending entries.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().entries.len()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

fn timer_loop(inner: Arc<TimerInner>) {
    let mut state = inner.state.lock();
    loop {
        let now = Instant::now();
        match state.deadlines.peek().copied() {
            None => inner.wakeup.wait(&mut state),
            Some(Reverse((deadline, id))) if deadline <= now => {
                state.deadlines.pop();
                if let Some(task) = state.entries.remove(&id) {
                    MutexGuard::unlocked(&mut state, || Scheduler::global().spawn(task));
                }
            }
            Some(Reverse((deadline, _))) => {
                inner.wakeup.wait_until(&mut state, deadline);
            }
        }
    }
}

/// Granularity for clock readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    /// Nanoseconds.
    Nanoseconds,
    /// Microseconds.
    Microseconds,
    /// Milliseconds.
    Milliseconds,
    /// Seconds.
    Seconds,
}

impl TimeUnit {
    /// Express a duration in this unit, truncating.
    pub fn convert(self, d: Duration) -> u128 {
        match self {
            TimeUnit::Nanoseconds => d.as_nanos(),
            TimeUnit::Microseconds => d.as_micros(),
            TimeUnit::Milliseconds => d.as_millis(),
            TimeUnit::Seconds => u128::from(d.as_secs()),
        }
    }
}

/// Effect that completes after `delay`. Cancelling it removes the entry.
pub fn sleep(delay: Duration) -> IO<()> {
    IO::cancelable(move |cb| {
        let timer = Timer::global();
        let id = timer.schedule(
            delay,
            Box::new(move || {
                cb.complete(());
            }),
        );
        IO::delay(move || {
            timer.cancel(id);
        })
    })
}

/// Wall-clock time since the Unix epoch.
pub fn real_time(unit: TimeUnit) -> IO<u128> {
    IO::try_delay(move || {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| unit.convert(d))
            .map_err(Error::new)
    })
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic time since an arbitrary process-wide origin.
pub fn monotonic(unit: TimeUnit) -> IO<u128> {
    IO::delay(move || unit.convert(EPOCH.get_or_init(Instant::now).elapsed()))
}

impl IO<()> {
    /// Effect that completes after `delay`.
    pub fn sleep(delay: Duration) -> IO<()> {
        sleep(delay)
    }
}

impl<A: Send + 'static> IO<A> {
    /// Fail with [`Error::Timeout`] unless this completes within `limit`.
    ///
    /// On timeout the evaluation is cancelled.
    pub fn timeout(self, limit: Duration) -> IO<A> {
        self.timeout_to(limit, IO::raise_error(Error::Timeout(limit)))
    }

    /// Fall back to `fallback` unless this completes within `limit`.
    pub fn timeout_to(self, limit: Duration, fallback: IO<A>) -> IO<A> {
        self.race(sleep(limit)).flat_map(move |winner| match winner {
            Either::Left(a) => IO::pure(a),
            Either::Right(()) => fallback,
        })
    }

    /// Apply the configured default timeout, if one is set.
    pub fn timeout_default(self) -> IO<A> {
        match crate::runtime_config().and_then(|c| c.timer.default_timeout) {
            Some(limit) => self.timeout(limit),
            None => self,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
