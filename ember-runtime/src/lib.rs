//! # Ember Runtime Library
//!
//! A deferred-execution effect runtime:
//!
//! - **Effect Descriptions**: [`IO<A>`] values that describe work without
//!   doing it
//! - **Run-Loop**: a stack-safe interpreter with an explicit continuation
//!   stack and a per-thread trampoline
//! - **Cancellation**: per-evaluation [`Connection`] token stacks
//! - **Concurrency**: [`Fiber`]s, racing, [`Deferred`] and [`Ref`] cells
//! - **Resources**: `bracket`, `bracket_case` and `guarantee`
//! - **Time**: cancelable sleeps, timeouts and clocks
//!
//! ## Architecture
//!
//! ```text
//!   IO value ──▶ run-loop ──▶ callback
//!      │            │  ▲
//!      │            │  └── async boundary (trampoline / scheduler)
//!      │            ▼
//!      │        Connection ◀── cancel tokens pushed by bracket, race, sleep
//!      ▼
//!   start ──▶ Fiber { join, cancel }
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use ember_runtime::{timer, IO};
//!
//! let program = IO::delay(|| 1)
//!     .flat_map(|n| timer::sleep(Duration::from_millis(5)).as_(n + 1))
//!     .timeout(Duration::from_secs(1));
//!
//! assert_eq!(program.unsafe_run_sync().unwrap(), 2);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bracket;
pub mod callback;
pub mod config;
pub mod connection;
pub mod effect;
pub mod error;
pub mod fiber;
pub mod io;
pub mod log;
pub mod panic;
pub mod race;
mod run_loop;
pub mod scheduler;
pub mod sync;
pub mod timer;
pub mod trampoline;

use std::sync::OnceLock;

// Re-exports
pub use callback::Callback;
pub use config::{ConfigError, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use connection::{Connection, ForwardCancelable};
pub use effect::{Concurrent, Effect, FunctionK, IdentityK, IoEffect};
pub use error::{CompositeFailure, Error, ExitCase, Result};
pub use fiber::{Fiber, FiberId};
pub use io::IO;
pub use panic::{report_failure, reset_failure_reporter, set_failure_reporter};
pub use race::{Either, RacePair};
pub use scheduler::Scheduler;
pub use sync::{Deferred, Ref, WaiterId};
pub use timer::{TimeUnit, Timer};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static RUNTIME_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Install `config`, start logging and return the global scheduler.
///
/// The first installed configuration wins. The scheduler and the run-loop
/// read it lazily, so install it before running anything.
///
/// ```rust,ignore
/// use ember_runtime::{init_with_runtime_config, RuntimeConfig};
///
/// let scheduler = init_with_runtime_config(RuntimeConfig::builder().num_workers(2).build()?);
/// ```
pub fn init_with_runtime_config(config: RuntimeConfig) -> &'static Scheduler {
    if RUNTIME_CONFIG.set(config).is_err() {
        tracing::warn!("runtime configuration already installed, keeping the first one");
    }
    if let Some(config) = runtime_config() {
        log::init_logging(&config.log);
    }
    Scheduler::global()
}

/// [`init_with_runtime_config`] with [`RuntimeConfig::from_env`].
pub fn init_from_env() -> &'static Scheduler {
    init_with_runtime_config(RuntimeConfig::from_env())
}

/// The installed configuration, if any.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}
