//! Failures with no listener reach the installed failure reporter.
//!
//! The reporter is process-wide, so everything touching it lives in one test.

use std::sync::Arc;

use ember_runtime::{reset_failure_reporter, set_failure_reporter, Error, IO};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

#[test]
fn test_unobserved_failures_reach_reporter() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    set_failure_reporter(move |err| s.lock().push(err.to_string()));

    // A failure delivered after the callback already fired.
    let io: IO<i32> = IO::async_(|cb| {
        cb.complete(1);
        cb.fail(Error::msg("late failure"));
        cb.complete(3);
    });
    assert_eq!(io.unsafe_run_sync().unwrap(), 1);

    // A fire-and-forget run that fails.
    IO::<()>::raise_error(Error::msg("forgotten")).run_async_and_forget();

    // A fire-and-forget run that succeeds reports nothing.
    IO::delay(|| 5).run_async_and_forget();

    // A panicking reporter is contained.
    set_failure_reporter(|_| panic!("reporter failure"));
    IO::<()>::raise_error(Error::msg("dropped")).run_async_and_forget();

    reset_failure_reporter();
    assert_eq!(*seen.lock(), vec!["late failure", "forgotten"]);
}
