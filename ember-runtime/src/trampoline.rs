//! Thread-local trampoline.
//!
//! Resuming a suspended run-loop from inside a callback would nest the
//! resumed loop on top of whatever invoked the callback. When a batch is
//! already draining on this thread, new tasks are queued behind it instead,
//! so synchronous callback chains run in constant stack.

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::panic::{catch_panic, report_failure};
use crate::scheduler::Scheduler;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Trampoline {
    running: bool,
    queue: VecDeque<Task>,
}

thread_local! {
    static TRAMPOLINE: RefCell<Trampoline> = RefCell::new(Trampoline::default());
}

/// Run `task` now, or after the batch currently draining on this thread.
pub fn execute(task: Task) {
    let start_batch = TRAMPOLINE.with(|t| {
        let mut t = t.borrow_mut();
        if t.running {
            t.queue.push_back(task);
            None
        } else {
            t.running = true;
            Some(task)
        }
    });

    if let Some(first) = start_batch {
        run_batch(first);
    }
}

/// Returns true while a batch is draining on this thread.
pub fn is_running() -> bool {
    TRAMPOLINE.with(|t| t.borrow().running)
}

/// Run `f` as if no batch were draining on this thread.
///
/// Tasks already queued behind the current batch move to the scheduler, in
/// order, and anything `f` executes runs in a batch of its own. Callers that
/// block on work started in `f` therefore never wait on their own queue.
pub fn detached<R>(f: impl FnOnce() -> R) -> R {
    let pending = TRAMPOLINE.with(|t| {
        let mut t = t.borrow_mut();
        if t.running {
            t.running = false;
            Some(std::mem::take(&mut t.queue))
        } else {
            None
        }
    });

    let Some(pending) = pending else {
        return f();
    };
    if !pending.is_empty() {
        tracing::trace!(tasks = pending.len(), "handing queued tasks to the scheduler");
        Scheduler::global().spawn(move || pending.into_iter().for_each(execute));
    }
    let out = f();
    TRAMPOLINE.with(|t| t.borrow_mut().running = true);
    out
}

fn run_batch(first: Task) {
    let mut next = Some(first);
    while let Some(task) = next {
        if let Err(e) = catch_panic(task) {
            report_failure(&e);
        }
        next = TRAMPOLINE.with(|t| {
            let mut t = t.borrow_mut();
            let task = t.queue.pop_front();
            if task.is_none() {
                t.running = false;
            }
            task
        });
    }
}
