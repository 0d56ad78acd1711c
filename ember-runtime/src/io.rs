//! # Effect Descriptions
//!
//! An [`IO<A>`] describes a computation producing an `A`. Building one runs
//! nothing; composition (`map`, `flat_map`, error handlers, brackets) only
//! allocates new description nodes. A description is handed to the run-loop
//! by one of the `run_*` methods.
//!
//! ## Design
//!
//! - `IO<A>` is a typed shell over an erased [`Node`]. Values travel through
//!   the run-loop as `Box<dyn Any + Send>` and are unboxed at the edges.
//! - Descriptions are one-shot: running or composing consumes them. Build a
//!   reusable description from a factory with [`IO::suspend`].
//! - Consecutive `map` calls are fused into one node until the configured
//!   fusion depth is reached, then a fresh node is boxed.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_runtime::IO;
//!
//! let program = IO::delay(|| 20)
//!     .map(|n| n + 1)
//!     .flat_map(|n| IO::pure(n * 2));
//!
//! assert_eq!(program.unsafe_run_sync().unwrap(), 42);
//! ```

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use crate::callback::Callback;
use crate::config::fusion_max_stack_depth;
use crate::connection::{Connection, ForwardCancelable};
use crate::error::Error;
use crate::panic::{catch_panic, report_failure};
use crate::run_loop;
use crate::trampoline;

/// An erased value flowing through the run-loop.
pub(crate) type Value = Box<dyn Any + Send>;

/// The outcome of evaluating a node.
pub(crate) type Outcome = Result<Value, Error>;

pub(crate) type MapFn = Box<dyn FnOnce(Value) -> Value + Send>;
pub(crate) type BindFn = Box<dyn FnOnce(Value) -> Node + Send>;
pub(crate) type RecoverFn = Box<dyn FnOnce(Error) -> Node + Send>;
pub(crate) type RegisterFn = Box<dyn FnOnce(Connection, Callback<Value>) + Send>;
pub(crate) type ModifyFn = Box<dyn FnOnce(&Connection) -> Connection + Send>;
pub(crate) type RestoreFn = Box<dyn FnOnce(Connection, Connection) -> Connection + Send>;

/// The erased description tree interpreted by the run-loop.
pub(crate) enum Node {
    /// An already computed value.
    Pure(Value),
    /// A failure.
    RaiseError(Error),
    /// A side-effecting thunk producing a value.
    Delay(Box<dyn FnOnce() -> Outcome + Send>),
    /// A thunk producing the next description.
    Suspend(Box<dyn FnOnce() -> Node + Send>),
    /// A source followed by a continuation frame.
    Bind(Box<Node>, Frame),
    /// A source followed by a (possibly fused) pure function.
    Map(Box<Node>, MapFn, usize),
    /// A callback registration; the loop suspends until it fires.
    Async {
        register: RegisterFn,
        trampoline_after: bool,
    },
    /// Evaluate `source` under a different connection.
    ContextSwitch {
        source: Box<Node>,
        modify: ModifyFn,
        restore: Option<RestoreFn>,
    },
}

impl Node {
    fn tag(&self) -> &'static str {
        match self {
            Node::Pure(_) => "Pure",
            Node::RaiseError(_) => "RaiseError",
            Node::Delay(_) => "Delay",
            Node::Suspend(_) => "Suspend",
            Node::Bind(..) => "Bind",
            Node::Map(..) => "Map",
            Node::Async { .. } => "Async",
            Node::ContextSwitch { .. } => "ContextSwitch",
        }
    }
}

/// A pending continuation on the run-loop stack.
pub(crate) enum Frame {
    /// Apply a function to a successful value.
    Map(MapFn),
    /// Continue with a new description built from a successful value.
    Bind(BindFn),
    /// Recovers failures; `success` of `None` passes values through.
    Handler {
        success: Option<BindFn>,
        failure: RecoverFn,
    },
    /// Put the previous connection back, on both paths.
    Restore { old: Connection, restore: RestoreFn },
}

/// Unbox a run-loop value into its static type.
pub(crate) fn unbox<A: 'static>(value: Value) -> A {
    *value.downcast::<A>().expect("io value type mismatch")
}

pub(crate) fn boxed<A: Send + 'static>(a: A) -> Value {
    Box::new(a)
}

/// A description of a computation producing an `A`.
#[must_use = "an IO does nothing until it is run"]
pub struct IO<A> {
    node: Node,
    _marker: PhantomData<fn() -> A>,
}

impl<A> fmt::Debug for IO<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IO::{}", self.node.tag())
    }
}

impl<A: Send + 'static> IO<A> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_node(self) -> Node {
        self.node
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Lift a value.
    pub fn pure(a: A) -> Self {
        Self::from_node(Node::Pure(boxed(a)))
    }

    /// A failed description.
    pub fn raise_error(e: Error) -> Self {
        Self::from_node(Node::RaiseError(e))
    }

    /// Lift an already known outcome.
    pub fn from_result(result: Result<A, Error>) -> Self {
        match result {
            Ok(a) => Self::pure(a),
            Err(e) => Self::raise_error(e),
        }
    }

    /// Suspend a side effect. A panic inside `f` becomes a failure.
    pub fn delay<F>(f: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::from_node(Node::Delay(Box::new(move || Ok(boxed(f())))))
    }

    /// Suspend a fallible side effect.
    pub fn try_delay<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<A, Error> + Send + 'static,
    {
        Self::from_node(Node::Delay(Box::new(move || f().map(boxed))))
    }

    /// Defer building a description until it is evaluated.
    pub fn suspend<F>(f: F) -> Self
    where
        F: FnOnce() -> IO<A> + Send + 'static,
    {
        Self::from_node(Node::Suspend(Box::new(move || f().node)))
    }

    /// An asynchronous computation.
    ///
    /// `register` receives a callback to complete; extra invocations are
    /// dropped. The evaluation resumes through the trampoline.
    pub fn async_<F>(register: F) -> Self
    where
        F: FnOnce(Callback<A>) + Send + 'static,
    {
        Self::async_with_conn(move |_conn, cb| register(cb), true)
    }

    /// Asynchronous registration with access to the active connection.
    pub(crate) fn async_with_conn<F>(register: F, trampoline_after: bool) -> Self
    where
        F: FnOnce(Connection, Callback<A>) + Send + 'static,
    {
        Self::from_node(Node::Async {
            register: Box::new(move |conn, cb: Callback<Value>| {
                register(conn, cb.contramap(boxed::<A>))
            }),
            trampoline_after,
        })
    }

    /// An asynchronous computation that can be cancelled.
    ///
    /// `k` registers the callback and returns the token that aborts the
    /// pending work. The token runs only if the evaluation is cancelled
    /// before the callback fires.
    pub fn cancelable<F>(k: F) -> Self
    where
        F: FnOnce(Callback<A>) -> IO<()> + Send + 'static,
    {
        Self::async_with_conn(
            move |conn, cb| {
                let forward = ForwardCancelable::new();
                conn.push(forward.cancel());

                if conn.is_canceled() {
                    let _ = forward.complete(IO::unit());
                    return;
                }

                let popper = conn.clone();
                let cb2 = Callback::new(move |result| {
                    popper.pop();
                    cb.call(result);
                });

                let token = match catch_panic({
                    let cb2 = cb2.clone();
                    move || k(cb2)
                }) {
                    Ok(token) => token,
                    Err(e) => {
                        cb2.fail(e);
                        IO::unit()
                    }
                };
                let _ = forward.complete(token);
            },
            true,
        )
    }

    /// A description that never completes.
    pub fn never() -> Self {
        Self::async_(|_cb| {})
    }

    // ------------------------------------------------------------------
    // Composition
    // ------------------------------------------------------------------

    /// Transform the result.
    pub fn map<B, F>(self, f: F) -> IO<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        let f: MapFn = Box::new(move |v| boxed(f(unbox::<A>(v))));
        let node = match self.node {
            Node::Map(source, g, depth) if depth < fusion_max_stack_depth() => {
                Node::Map(source, Box::new(move |v| f(g(v))), depth + 1)
            }
            node => Node::Map(Box::new(node), f, 0),
        };
        IO::from_node(node)
    }

    /// Sequence a dependent computation.
    pub fn flat_map<B, F>(self, f: F) -> IO<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> IO<B> + Send + 'static,
    {
        IO::from_node(Node::Bind(
            Box::new(self.node),
            Frame::Bind(Box::new(move |v| f(unbox::<A>(v)).node)),
        ))
    }

    /// Run `next` after this one, discarding this result.
    pub fn then<B: Send + 'static>(self, next: IO<B>) -> IO<B> {
        self.flat_map(move |_| next)
    }

    /// Discard the result.
    pub fn void(self) -> IO<()> {
        self.map(|_| ())
    }

    /// Replace the result with `b`.
    pub fn as_<B: Send + 'static>(self, b: B) -> IO<B> {
        self.map(move |_| b)
    }

    // ------------------------------------------------------------------
    // Error handling
    // ------------------------------------------------------------------

    /// Expose failures as values.
    pub fn attempt(self) -> IO<Result<A, Error>> {
        IO::from_node(Node::Bind(
            Box::new(self.node),
            Frame::Handler {
                success: Some(Box::new(|v| Node::Pure(boxed(Ok::<A, Error>(unbox::<A>(v)))))),
                failure: Box::new(|e| Node::Pure(boxed(Err::<A, Error>(e)))),
            },
        ))
    }

    /// Recover from a failure with another description.
    pub fn handle_error_with<F>(self, f: F) -> IO<A>
    where
        F: FnOnce(Error) -> IO<A> + Send + 'static,
    {
        IO::from_node(Node::Bind(
            Box::new(self.node),
            Frame::Handler {
                success: None,
                failure: Box::new(move |e| f(e).node),
            },
        ))
    }

    /// Recover from a failure with a value.
    pub fn handle_error<F>(self, f: F) -> IO<A>
    where
        F: FnOnce(Error) -> A + Send + 'static,
    {
        self.handle_error_with(move |e| IO::pure(f(e)))
    }

    /// Map both outcomes to a value.
    pub fn redeem<B, R, M>(self, recover: R, map: M) -> IO<B>
    where
        B: Send + 'static,
        R: FnOnce(Error) -> B + Send + 'static,
        M: FnOnce(A) -> B + Send + 'static,
    {
        self.redeem_with(move |e| IO::pure(recover(e)), move |a| IO::pure(map(a)))
    }

    /// Continue from either outcome.
    pub fn redeem_with<B, R, M>(self, recover: R, bind: M) -> IO<B>
    where
        B: Send + 'static,
        R: FnOnce(Error) -> IO<B> + Send + 'static,
        M: FnOnce(A) -> IO<B> + Send + 'static,
    {
        IO::from_node(Node::Bind(
            Box::new(self.node),
            Frame::Handler {
                success: Some(Box::new(move |v| bind(unbox::<A>(v)).node)),
                failure: Box::new(move |e| recover(e).node),
            },
        ))
    }

    /// Evaluate without observing cancellation.
    pub fn uncancelable(self) -> IO<A> {
        IO::from_node(Node::ContextSwitch {
            source: Box::new(self.node),
            modify: Box::new(|_| Connection::uncancelable()),
            restore: Some(Box::new(|old, _| old)),
        })
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Start evaluation; `cb` receives the outcome exactly once.
    ///
    /// Runs synchronously on the calling thread until the first
    /// asynchronous boundary.
    pub fn run_async<F>(self, cb: F)
    where
        F: FnOnce(Result<A, Error>) + Send + 'static,
    {
        run_loop::start(
            self.node,
            Connection::uncancelable(),
            Box::new(move |outcome| cb(outcome.map(unbox::<A>))),
        );
    }

    /// Start evaluation and report any failure to the failure reporter.
    pub fn run_async_and_forget(self) {
        self.run_async(|result| {
            if let Err(e) = result {
                report_failure(&e);
            }
        });
    }

    /// Start a cancelable evaluation.
    ///
    /// Returns the token that cancels it. A cancelled evaluation never
    /// invokes `cb`.
    pub fn run_cancelable<F>(self, cb: F) -> IO<()>
    where
        F: FnOnce(Result<A, Error>) + Send + 'static,
    {
        let conn = Connection::new();
        run_loop::start(
            self.node,
            conn.clone(),
            Box::new(move |outcome| cb(outcome.map(unbox::<A>))),
        );
        conn.cancel()
    }

    /// Evaluate and block the calling thread for the outcome.
    ///
    /// If the description drops its last callback without completing
    /// (for example [`IO::never`]), this returns an illegal-state error
    /// instead of blocking forever.
    pub fn unsafe_run_sync(self) -> Result<A, Error> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        trampoline::detached(|| {
            self.run_async(move |result| {
                let _ = tx.send(result);
            })
        });
        rx.recv().unwrap_or_else(|_| {
            Err(Error::illegal_state(
                "effect dropped its callback without completing",
            ))
        })
    }

    /// Evaluate and wait at most `limit` for the outcome.
    ///
    /// Returns `None` on timeout; the evaluation keeps running.
    pub fn unsafe_run_timed(self, limit: Duration) -> Option<Result<A, Error>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        trampoline::detached(|| {
            self.run_async(move |result| {
                let _ = tx.send(result);
            })
        });
        rx.recv_timeout(limit).ok()
    }
}

impl IO<()> {
    /// The unit description.
    pub fn unit() -> Self {
        IO::pure(())
    }
}

impl<A: Send + 'static> IO<Result<A, Error>> {
    /// Turn an exposed failure back into a raised one.
    pub fn rethrow(self) -> IO<A> {
        self.flat_map(IO::from_result)
    }
}

impl<A: Send + 'static> IO<IO<A>> {
    /// Flatten a nested description.
    pub fn flatten(self) -> IO<A> {
        self.flat_map(|inner| inner)
    }
}

// ============================================================================
// Tests
// ============================================================================
