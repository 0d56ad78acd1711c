//! # Work-Stealing Scheduler
//!
//! Thread pool that asynchronous boundaries shift evaluation onto.
//!
//! ## Design
//!
//! - Compute workers each own a FIFO deque, backed by a global injector
//!   queue. Idle workers steal in batches from the injector and then from
//!   their peers.
//! - A worker with nothing to do spins briefly with a backoff, then parks on
//!   a condition variable until new work is injected.
//! - Blocking work goes to a separate, elastic pool of threads fed by a
//!   channel. Threads are added on demand up to a cap and exit after an idle
//!   keep-alive.
//! - Task panics are caught and sent to the failure reporter; a worker never
//!   dies from a task.

use std::iter;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::callback::Callback;
use crate::config::SchedulerConfig;
use crate::io::IO;
use crate::panic::{catch_panic, report_failure};
use crate::trampoline::Task;

/// Longest a parked worker sleeps before rechecking the queues.
const PARK_TIMEOUT: Duration = Duration::from_millis(50);

/// The process-wide scheduler.
static GLOBAL: OnceLock<Scheduler> = OnceLock::new();

/// State shared by the compute workers.
struct Shared {
    /// Global injection queue.
    injector: Injector<Task>,
    /// Stealers for every worker deque.
    stealers: Vec<Stealer<Task>>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Number of parked workers.
    sleeping: AtomicUsize,
    sleep_lock: Mutex<()>,
    wakeup: Condvar,
}

/// Work-stealing thread pool.
pub struct Scheduler {
    config: SchedulerConfig,
    shared: Arc<Shared>,
    blocking: Arc<BlockingPool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler and start its compute workers.
    pub fn new(config: SchedulerConfig) -> Self {
        let num_workers = config.num_workers.max(1);
        let mut deques = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let deque = Deque::new_fifo();
            stealers.push(deque.stealer());
            deques.push(deque);
        }

        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers,
            shutdown: AtomicBool::new(false),
            sleeping: AtomicUsize::new(0),
            sleep_lock: Mutex::new(()),
            wakeup: Condvar::new(),
        });

        let handles = deques
            .into_iter()
            .enumerate()
            .map(|(i, deque)| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("ember-worker-{}", i))
                    .spawn(move || worker_loop(shared, deque))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        let blocking = Arc::new(BlockingPool::new(
            config.max_blocking_threads.max(1),
            config.blocking_keep_alive,
        ));

        tracing::debug!(
            workers = num_workers,
            max_blocking = config.max_blocking_threads,
            "scheduler started"
        );

        Self {
            config,
            shared,
            blocking,
            workers: Mutex::new(handles),
        }
    }

    /// The process-wide scheduler, created on first use from the installed
    /// runtime configuration.
    pub fn global() -> &'static Scheduler {
        GLOBAL.get_or_init(|| {
            let config = crate::runtime_config()
                .map(|c| c.scheduler.clone())
                .unwrap_or_default();
            Scheduler::new(config)
        })
    }

    /// Get the number of compute workers.
    pub fn num_workers(&self) -> usize {
        self.shared.stealers.len()
    }

    /// The configuration this scheduler was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue a task on the compute workers.
    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.injector.push(Box::new(task));
        if self.shared.sleeping.load(Ordering::SeqCst) > 0 {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.wakeup.notify_one();
        }
    }

    /// Queue a task on the blocking pool.
    pub fn spawn_blocking<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.blocking.submit(Box::new(task));
    }

    /// Number of live blocking threads.
    pub fn blocking_threads(&self) -> usize {
        self.blocking.threads.load(Ordering::Acquire)
    }

    /// Request shutdown and wait for the compute workers to exit.
    ///
    /// Queued tasks that have not started are dropped.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.wakeup.notify_all();
        }
        let handles = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        tracing::debug!("scheduler stopped");
    }

    /// Check if the scheduler is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, local: Deque<Task>) {
    let backoff = Backoff::new();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        if let Some(task) = find_task(&local, &shared.injector, &shared.stealers) {
            backoff.reset();
            run_task(task);
            continue;
        }

        if !backoff.is_completed() {
            backoff.snooze();
            continue;
        }

        let mut guard = shared.sleep_lock.lock();
        shared.sleeping.fetch_add(1, Ordering::SeqCst);
        if shared.injector.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
            shared.wakeup.wait_for(&mut guard, PARK_TIMEOUT);
        }
        shared.sleeping.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
        backoff.reset();
    }
}

/// Local deque first, then the injector, then peers.
fn find_task(local: &Deque<Task>, global: &Injector<Task>, stealers: &[Stealer<Task>]) -> Option<Task> {
    local.pop().or_else(|| {
        iter::repeat_with(|| {
            global
                .steal_batch_and_pop(local)
                .or_else(|| stealers.iter().map(|s| s.steal()).collect())
        })
        .find(|s| !s.is_retry())
        .and_then(Steal::success)
    })
}

fn run_task(task: Task) {
    if let Err(e) = catch_panic(task) {
        report_failure(&e);
    }
}

/// Elastic pool for tasks that block their thread.
struct BlockingPool {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    threads: AtomicUsize,
    idle: AtomicUsize,
    next_id: AtomicUsize,
    max_threads: usize,
    keep_alive: Duration,
}

impl BlockingPool {
    fn new(max_threads: usize, keep_alive: Duration) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            threads: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            max_threads,
            keep_alive,
        }
    }

    fn submit(self: &Arc<Self>, task: Task) {
        // The pool holds both channel ends, so the send cannot fail.
        let _ = self.tx.send(task);
        if self.idle.load(Ordering::Acquire) == 0 {
            self.try_grow();
        }
    }

    fn try_grow(self: &Arc<Self>) {
        let max = self.max_threads;
        if self
            .threads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pool = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("ember-blocking-{}", id))
            .spawn(move || pool.thread_loop());
        if let Err(e) = spawned {
            self.threads.fetch_sub(1, Ordering::AcqRel);
            tracing::error!(error = %e, "failed to spawn blocking thread");
        }
    }

    fn thread_loop(&self) {
        loop {
            self.idle.fetch_add(1, Ordering::AcqRel);
            let next = self.rx.recv_timeout(self.keep_alive);
            self.idle.fetch_sub(1, Ordering::AcqRel);

            match next {
                Ok(task) => run_task(task),
                Err(RecvTimeoutError::Timeout) => {
                    self.threads.fetch_sub(1, Ordering::AcqRel);
                    // A task may have slipped in while this thread counted as idle.
                    if !self.rx.is_empty() {
                        self.threads.fetch_add(1, Ordering::AcqRel);
                        continue;
                    }
                    tracing::trace!("blocking thread exiting after keep-alive");
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.threads.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            }
        }
    }
}

impl IO<()> {
    /// Continue evaluation on a compute worker.
    pub fn shift() -> IO<()> {
        IO::async_with_conn(
            |_conn, cb: Callback<()>| {
                Scheduler::global().spawn(move || {
                    cb.complete(());
                });
            },
            false,
        )
    }
}

impl<A: Send + 'static> IO<A> {
    /// Run a blocking function on the blocking pool, then shift back to a
    /// compute worker.
    pub fn blocking<F>(f: F) -> IO<A>
    where
        F: FnOnce() -> A + Send + 'static,
    {
        IO::async_with_conn(
            move |_conn, cb: Callback<A>| {
                Scheduler::global().spawn_blocking(move || {
                    cb.call(catch_panic(f));
                });
            },
            false,
        )
        .flat_map(|a| IO::shift().as_(a))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(workers: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig { num_workers: workers, ..SchedulerConfig::default() })
    }

    fn eventually(done: &AtomicUsize, expected: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while done.load(Ordering::SeqCst) != expected && std::time::Instant::now() < deadline {
            thread::yield_now();
        }
        assert_eq!(done.load(Ordering::SeqCst), expected);
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = pool(3);
        assert_eq!(scheduler.num_workers(), 3);
        scheduler.shutdown();
        assert!(scheduler.is_shutting_down());
    }

    #[test]
    fn test_spawned_tasks_spread_over_workers() {
        let scheduler = pool(4);
        let done = Arc::new(AtomicUsize::new(0));
        (0..100).for_each(|_| {
            let done = Arc::clone(&done);
            scheduler.spawn(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        });
        eventually(&done, 100);
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let scheduler = pool(1);
        let done = Arc::new(AtomicUsize::new(0));
        scheduler.spawn(|| panic!("task failure"));
        let d = Arc::clone(&done);
        scheduler.spawn(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });
        eventually(&done, 1);
    }

    #[test]
    fn test_blocking_pool_runs_tasks() {
        let scheduler = Scheduler::new(SchedulerConfig {
            num_workers: 1,
            max_blocking_threads: 2,
            blocking_keep_alive: Duration::from_millis(50),
        });
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = Arc::clone(&done);
            scheduler.spawn_blocking(move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        eventually(&done, 4);
        assert!(scheduler.blocking_threads() <= 2);
    }

    #[test]
    fn test_shift_moves_to_worker() {
        let name = IO::shift()
            .then(IO::delay(|| thread::current().name().map(str::to_string)))
            .unsafe_run_sync()
            .unwrap();
        assert!(name.unwrap_or_default().starts_with("ember-worker-"));
    }

    #[test]
    fn test_blocking_returns_value() {
        let n = IO::blocking(|| {
            thread::sleep(Duration::from_millis(5));
            21
        })
        .map(|n| n * 2)
        .unsafe_run_sync()
        .unwrap();
        assert_eq!(n, 42);
    }
}
