//! Panic Capture and Failure Reporting
//!
//! User thunks run inside the run-loop; a panic in one of them must not tear
//! down a worker thread. This module converts panics into [`Error::Panicked`]
//! and owns the process-wide failure reporter that receives errors nobody is
//! listening for (fire-and-forget runs, duplicate callback invocations).
//!
//! # Example
//!
//! ```rust,ignore
//! use ember_runtime::panic::{catch_panic, set_failure_reporter};
//!
//! set_failure_reporter(|err| eprintln!("lost failure: {err}"));
//!
//! let result = catch_panic(|| panic!("oops"));
//! assert!(result.is_err());
//! ```

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::error::Error;

/// Callback that receives failures with no other destination.
pub type FailureReporter = Arc<dyn Fn(&Error) + Send + Sync>;

/// Number of failures routed to the reporter.
static REPORTED: AtomicU64 = AtomicU64::new(0);

/// The installed reporter.
static REPORTER: OnceLock<RwLock<FailureReporter>> = OnceLock::new();

fn reporter() -> &'static RwLock<FailureReporter> {
    REPORTER.get_or_init(|| RwLock::new(default_reporter()))
}

fn default_reporter() -> FailureReporter {
    Arc::new(|err: &Error| {
        tracing::error!(error = %err, "unhandled failure");
    })
}

/// Run a closure, turning a panic into [`Error::Panicked`].
///
/// The closure is wrapped in `AssertUnwindSafe`: the run-loop never reuses
/// state a panicking thunk could have left half-updated.
pub fn catch_panic<F, R>(f: F) -> Result<R, Error>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| Error::Panicked(panic_message(&*payload)))
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Replace the failure reporter.
pub fn set_failure_reporter<F>(f: F)
where
    F: Fn(&Error) + Send + Sync + 'static,
{
    *reporter().write() = Arc::new(f);
}

/// Restore the default reporter, which logs at `error` level.
pub fn reset_failure_reporter() {
    *reporter().write() = default_reporter();
}

/// Hand a failure to the reporter.
///
/// A panicking reporter is contained; the failure is then logged directly.
pub fn report_failure(err: &Error) {
    REPORTED.fetch_add(1, Ordering::Relaxed);
    let current = reporter().read().clone();
    if catch_panic(|| current(err)).is_err() {
        tracing::error!(error = %err, "failure reporter panicked");
    }
}

/// Number of failures reported since process start.
pub fn reported_failure_count() -> u64 {
    REPORTED.load(Ordering::Relaxed)
}

// ============================================================================
// Tests
// ============================================================================
