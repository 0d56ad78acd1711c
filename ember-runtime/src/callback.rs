//! Exactly-Once Callbacks
//!
//! Asynchronous registrations receive a [`Callback`] they may clone and hand
//! to several sources. Only the first invocation is delivered; later ones are
//! dropped, and a dropped failure goes to the failure reporter instead of
//! vanishing.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::panic::report_failure;

type Handler<A> = Box<dyn FnOnce(Result<A, Error>) + Send>;

/// A one-shot result callback that tolerates duplicate calls.
pub struct Callback<A> {
    slot: Arc<Mutex<Option<Handler<A>>>>,
}

impl<A> Clone for Callback<A> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<A: Send + 'static> fmt::Debug for Callback<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl<A: Send + 'static> Callback<A> {
    /// Wrap a handler.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Result<A, Error>) + Send + 'static,
    {
        Self {
            slot: Arc::new(Mutex::new(Some(Box::new(f)))),
        }
    }

    /// Deliver a result.
    ///
    /// Returns false if the callback had already fired; in that case a
    /// failure is reported and a success is dropped with a warning.
    pub fn call(&self, result: Result<A, Error>) -> bool {
        let handler = self.slot.lock().take();
        match handler {
            Some(f) => {
                f(result);
                true
            }
            None => {
                match result {
                    Err(e) => report_failure(&e),
                    Ok(_) => tracing::warn!("callback invoked more than once, value dropped"),
                }
                false
            }
        }
    }

    /// Deliver a success.
    pub fn complete(&self, value: A) -> bool {
        self.call(Ok(value))
    }

    /// Deliver a failure.
    pub fn fail(&self, error: Error) -> bool {
        self.call(Err(error))
    }

    /// Returns true once a result has been delivered.
    pub fn is_completed(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Adapt this callback to accept another value type.
    pub fn contramap<B, F>(self, f: F) -> Callback<B>
    where
        B: Send + 'static,
        F: FnOnce(B) -> A + Send + 'static,
    {
        Callback::new(move |result: Result<B, Error>| {
            self.call(result.map(f));
        })
    }
}
