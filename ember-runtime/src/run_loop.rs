//! # Run-Loop
//!
//! Interprets [`Node`] trees with an explicit continuation stack, so deep
//! `flat_map` chains evaluate in constant native stack.
//!
//! ## Design
//!
//! - `Bind` and `Map` push a frame and descend into their source.
//! - A value or failure pops frames until one applies; error handlers are
//!   skipped on success, maps and binds are skipped on failure.
//! - `Async` suspends: the remaining stack is captured by the callback handed
//!   to the registration, and the loop returns. The callback re-enters the
//!   loop, through the trampoline unless the boundary already changed thread.
//! - Cancellation is observed at async boundaries only. A loop whose
//!   connection is cancelled stops silently and never reports an outcome.

use crate::callback::Callback;
use crate::connection::Connection;
use crate::io::{Frame, Node, Outcome, RegisterFn};
use crate::panic::catch_panic;
use crate::trampoline;

/// Receives the final outcome of a run-loop.
pub(crate) type Finish = Box<dyn FnOnce(Outcome) + Send>;

/// Start evaluating `node` under `conn`.
pub(crate) fn start(node: Node, conn: Connection, finish: Finish) {
    run(node, conn, Vec::new(), finish);
}

enum Unwind {
    Continue(Node),
    Done(Outcome),
}

fn run(mut current: Node, mut conn: Connection, mut stack: Vec<Frame>, finish: Finish) {
    loop {
        let outcome: Outcome = match current {
            Node::Pure(value) => Ok(value),
            Node::RaiseError(e) => Err(e),
            Node::Delay(thunk) => catch_panic(thunk).and_then(|r| r),
            Node::Suspend(thunk) => match catch_panic(thunk) {
                Ok(next) => {
                    current = next;
                    continue;
                }
                Err(e) => Err(e),
            },
            Node::Bind(source, frame) => {
                stack.push(frame);
                current = *source;
                continue;
            }
            Node::Map(source, f, _) => {
                stack.push(Frame::Map(f));
                current = *source;
                continue;
            }
            Node::ContextSwitch {
                source,
                modify,
                restore,
            } => {
                let old = conn.clone();
                conn = modify(&old);
                if let Some(restore) = restore {
                    stack.push(Frame::Restore { old, restore });
                }
                current = *source;
                continue;
            }
            Node::Async {
                register,
                trampoline_after,
            } => {
                suspend(register, trampoline_after, conn, stack, finish);
                return;
            }
        };

        match unwind(outcome, &mut stack, &mut conn) {
            Unwind::Continue(next) => current = next,
            Unwind::Done(outcome) => {
                finish(outcome);
                return;
            }
        }
    }
}

/// Pop frames until one produces a new node or the stack is empty.
fn unwind(mut outcome: Outcome, stack: &mut Vec<Frame>, conn: &mut Connection) -> Unwind {
    loop {
        let frame = match stack.pop() {
            Some(frame) => frame,
            None => return Unwind::Done(outcome),
        };

        outcome = match (outcome, frame) {
            (Ok(value), Frame::Map(f)) => catch_panic(move || f(value)),
            (Ok(value), Frame::Bind(f))
            | (
                Ok(value),
                Frame::Handler {
                    success: Some(f), ..
                },
            ) => match catch_panic(move || f(value)) {
                Ok(next) => return Unwind::Continue(next),
                Err(e) => Err(e),
            },
            (Ok(value), Frame::Handler { success: None, .. }) => Ok(value),
            (Err(e), Frame::Handler { failure, .. }) => match catch_panic(move || failure(e)) {
                Ok(next) => return Unwind::Continue(next),
                Err(e) => Err(e),
            },
            (Err(e), Frame::Map(_) | Frame::Bind(_)) => Err(e),
            (outcome, Frame::Restore { old, restore }) => {
                let current = std::mem::replace(conn, Connection::uncancelable());
                *conn = restore(old, current);
                outcome
            }
        };
    }
}

fn suspend(
    register: RegisterFn,
    trampoline_after: bool,
    conn: Connection,
    stack: Vec<Frame>,
    finish: Finish,
) {
    if conn.is_canceled() {
        tracing::trace!("run-loop stopped at async boundary: connection cancelled");
        return;
    }

    let resume_conn = conn.clone();
    let callback = Callback::new(move |outcome: Outcome| {
        let resume = move || {
            if resume_conn.is_canceled() {
                tracing::trace!("run-loop not resumed: connection cancelled");
                return;
            }
            let next = match outcome {
                Ok(value) => Node::Pure(value),
                Err(e) => Node::RaiseError(e),
            };
            run(next, resume_conn, stack, finish);
        };
        if trampoline_after {
            trampoline::execute(Box::new(resume));
        } else {
            resume();
        }
    });

    let cb = callback.clone();
    if let Err(e) = catch_panic(move || register(conn, cb)) {
        callback.fail(e);
    }
}

// ============================================================================
// Tests
// ============================================================================
