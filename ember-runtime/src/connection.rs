//! # Cancellation Connections
//!
//! A [`Connection`] is the cancellation stack of one running evaluation.
//! Cancelable regions push tokens while they are pending and pop them when
//! they complete; cancelling the connection runs every remaining token in
//! last-in first-out order.
//!
//! ## Components
//!
//! - [`Connection`]: the token stack, or the inert uncancelable connection
//! - [`ForwardCancelable`]: a token that is installed before the real token
//!   is known, forwarding to it once supplied
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_runtime::{Connection, IO};
//!
//! let conn = Connection::new();
//! conn.push(IO::delay(|| println!("released")));
//! conn.cancel().unsafe_run_sync().unwrap();
//! assert!(conn.is_canceled());
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::callback::Callback;
use crate::error::{CompositeFailure, Error};
use crate::io::IO;

/// Token stack; `None` once cancelled.
struct Tokens {
    stack: Mutex<Option<Vec<IO<()>>>>,
}

/// The cancellation stack of a running evaluation.
#[derive(Clone)]
pub struct Connection {
    inner: Option<Arc<Tokens>>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("Connection::Uncancelable"),
            Some(tokens) => match tokens.stack.lock().as_ref() {
                Some(stack) => write!(f, "Connection::Active({} tokens)", stack.len()),
                None => f.write_str("Connection::Canceled"),
            },
        }
    }
}

impl Connection {
    /// A fresh, active connection.
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(Tokens {
                stack: Mutex::new(Some(Vec::new())),
            })),
        }
    }

    /// The connection that ignores pushes and can never be cancelled.
    pub fn uncancelable() -> Self {
        Self { inner: None }
    }

    /// Returns false for the uncancelable connection.
    pub fn is_cancelable(&self) -> bool {
        self.inner.is_some()
    }

    /// Returns true once `cancel` has started.
    pub fn is_canceled(&self) -> bool {
        match &self.inner {
            None => false,
            Some(tokens) => tokens.stack.lock().is_none(),
        }
    }

    /// Number of pending tokens.
    pub fn len(&self) -> usize {
        match &self.inner {
            None => 0,
            Some(tokens) => tokens.stack.lock().as_ref().map_or(0, Vec::len),
        }
    }

    /// Returns true when no tokens are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a cancellation token.
    ///
    /// If the connection is already cancelled the token is run immediately
    /// instead of being stored.
    pub fn push(&self, token: IO<()>) {
        let Some(tokens) = &self.inner else {
            return;
        };
        let rejected = {
            let mut stack = tokens.stack.lock();
            match stack.as_mut() {
                Some(stack) => {
                    stack.push(token);
                    None
                }
                None => Some(token),
            }
        };
        if let Some(token) = rejected {
            token.run_async_and_forget();
        }
    }

    /// Push a single token that cancels both `lh` and `rh`.
    pub fn push_pair(&self, lh: &Connection, rh: &Connection) {
        let (lh, rh) = (lh.clone(), rh.clone());
        self.push(IO::suspend(move || cancel_all(vec![lh.cancel(), rh.cancel()])));
    }

    /// Remove and return the most recently pushed token.
    pub fn pop(&self) -> Option<IO<()>> {
        self.inner
            .as_ref()
            .and_then(|tokens| tokens.stack.lock().as_mut().and_then(Vec::pop))
    }

    /// Re-arm a cancelled connection. Returns true if it was cancelled.
    pub fn try_reactivate(&self) -> bool {
        let Some(tokens) = &self.inner else {
            return false;
        };
        let mut stack = tokens.stack.lock();
        if stack.is_none() {
            *stack = Some(Vec::new());
            true
        } else {
            false
        }
    }

    /// The cancellation effect.
    ///
    /// Running it marks the connection cancelled and runs the pending tokens
    /// last-in first-out. Every token runs even if an earlier one fails; the
    /// failures are composed. Only the first run does anything.
    pub fn cancel(&self) -> IO<()> {
        let Some(tokens) = self.inner.clone() else {
            return IO::unit();
        };
        IO::suspend(move || {
            let taken = tokens.stack.lock().take();
            match taken {
                None => IO::unit(),
                Some(mut stack) => {
                    tracing::trace!(tokens = stack.len(), "cancelling connection");
                    stack.reverse();
                    cancel_all(stack)
                }
            }
        })
    }
}

/// Run every token in order, composing the failures.
pub(crate) fn cancel_all(tokens: Vec<IO<()>>) -> IO<()> {
    cancel_all_loop(tokens.into_iter(), Vec::new())
}

fn cancel_all_loop(mut rest: std::vec::IntoIter<IO<()>>, errors: Vec<Error>) -> IO<()> {
    match rest.next() {
        None => match CompositeFailure::from_list(errors) {
            None => IO::unit(),
            Some(e) => IO::raise_error(e),
        },
        Some(token) => token.attempt().flat_map(move |result| {
            let mut errors = errors;
            if let Err(e) = result {
                errors.push(e);
            }
            cancel_all_loop(rest, errors)
        }),
    }
}

enum ForwardState {
    /// No token yet; cancel requests wait here.
    Pending(Vec<Callback<()>>),
    /// The real token, not yet used.
    Active(IO<()>),
    /// The token has been taken.
    Finished,
}

/// A cancellation token whose target is supplied later.
///
/// Cancelling before [`complete`](Self::complete) parks the request until the
/// real token arrives, which then runs immediately.
#[derive(Clone)]
pub struct ForwardCancelable {
    state: Arc<Mutex<ForwardState>>,
}

impl Default for ForwardCancelable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ForwardCancelable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            ForwardState::Pending(waiters) => format!("Pending({})", waiters.len()),
            ForwardState::Active(_) => "Active".to_string(),
            ForwardState::Finished => "Finished".to_string(),
        };
        write!(f, "ForwardCancelable::{state}")
    }
}

impl ForwardCancelable {
    /// A forwarder with no token yet.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ForwardState::Pending(Vec::new()))),
        }
    }

    /// The effect that cancels through this forwarder.
    pub fn cancel(&self) -> IO<()> {
        let state = Arc::clone(&self.state);
        IO::async_(move |cb| {
            let mut guard = state.lock();
            match std::mem::replace(&mut *guard, ForwardState::Finished) {
                ForwardState::Pending(mut waiters) => {
                    waiters.push(cb);
                    *guard = ForwardState::Pending(waiters);
                }
                ForwardState::Active(token) => {
                    drop(guard);
                    token.run_async(move |result| {
                        cb.call(result);
                    });
                }
                ForwardState::Finished => {
                    drop(guard);
                    cb.complete(());
                }
            }
        })
    }

    /// Supply the real token.
    ///
    /// If a cancel is already waiting the token runs now. Completing twice is
    /// an illegal state; the extra token is run so it is not leaked.
    pub fn complete(&self, token: IO<()>) -> Result<(), Error> {
        let mut guard = self.state.lock();
        match std::mem::replace(&mut *guard, ForwardState::Finished) {
            ForwardState::Pending(waiters) if waiters.is_empty() => {
                *guard = ForwardState::Active(token);
                Ok(())
            }
            ForwardState::Pending(waiters) => {
                drop(guard);
                token.run_async(move |result| {
                    for waiter in waiters {
                        waiter.call(result.clone());
                    }
                });
                Ok(())
            }
            other => {
                *guard = other;
                drop(guard);
                token.run_async_and_forget();
                Err(Error::illegal_state("forward cancelable completed twice"))
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
