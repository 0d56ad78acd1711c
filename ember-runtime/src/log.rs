//! Logging Setup
//!
//! The runtime emits `tracing` events; this module installs a
//! `tracing-subscriber` formatter driven by [`LogConfig`]. `RUST_LOG`, when
//! set, takes precedence over the configured level.
//!
//! # Example
//!
//! ```rust,ignore
//! use ember_runtime::config::LogConfig;
//! use ember_runtime::log::init_logging;
//!
//! init_logging(&LogConfig::default());
//! tracing::info!("runtime up");
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Whether a subscriber has been installed by this module.
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Build the filter for a configuration.
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

/// Install the global subscriber.
///
/// Returns false when a subscriber was already installed, either by an
/// earlier call or by the host application. Later calls are no-ops.
pub fn init_logging(config: &LogConfig) -> bool {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }

    let builder = fmt()
        .with_env_filter(env_filter(config))
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_thread_names(true);

    let result = if config.timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };

    result.is_ok()
}

/// Returns true once [`init_logging`] has run.
pub fn is_initialized() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig {
            level: LogLevel::Warn,
            timestamps: false,
            source_location: false,
        };
        let _ = init_logging(&config);
        assert!(is_initialized());
        assert!(!init_logging(&config));
    }
}
