//! Runtime Configuration
//!
//! Settings for the worker pool, the run-loop, timers and logging, built
//! in code with [`RuntimeConfig::builder`] or read from `EMBER_*`
//! environment variables with [`RuntimeConfig::from_env`].
//!
//! | Variable | Setting | Default |
//! |----------|---------|---------|
//! | `EMBER_NUM_WORKERS` | compute worker threads | CPU count |
//! | `EMBER_MAX_BLOCKING_THREADS` | blocking pool limit | 512 |
//! | `EMBER_BLOCKING_KEEP_ALIVE_MS` | idle blocking thread lifetime | 10000 |
//! | `EMBER_FUSION_MAX_STACK_DEPTH` | `map` fusions per node | 127 |
//! | `EMBER_DEFAULT_TIMEOUT_MS` | default timeout, 0 for none | 0 |
//! | `EMBER_LOG_LEVEL` | `off`, `error`, `warn`, `info`, `debug`, `trace` | `info` |
//!
//! ```rust,ignore
//! use ember_runtime::RuntimeConfig;
//!
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .fusion_max_stack_depth(31)
//!     .build()?;
//! ```

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::level_filters::LevelFilter;

/// Default number of map fusions before a fresh `Map` node is allocated.
pub const DEFAULT_FUSION_MAX_STACK_DEPTH: usize = 127;

const DEFAULT_MAX_BLOCKING_THREADS: usize = 512;
const DEFAULT_BLOCKING_KEEP_ALIVE: Duration = Duration::from_secs(10);

// ============================================================================
// Errors
// ============================================================================

/// A rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A count below its minimum.
    #[error("{field} must be at least {minimum}, got {found}")]
    TooSmall {
        /// Setting name.
        field: &'static str,
        /// Smallest accepted value.
        minimum: usize,
        /// Value supplied.
        found: usize,
    },

    /// A default timeout of zero; no timeout is spelled `None`.
    #[error("default timeout must be positive; use no timeout instead of zero")]
    ZeroTimeout,

    /// A log level name that is not recognised.
    #[error("unknown log level '{0}'")]
    UnknownLogLevel(String),
}

// ============================================================================
// Sections
// ============================================================================

/// Verbosity of runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Nothing.
    Off,
    /// Failures only.
    Error,
    /// Failures and warnings.
    Warn,
    /// Lifecycle events.
    #[default]
    Info,
    /// Scheduling and scope decisions.
    Debug,
    /// Everything, including per-resource events.
    Trace,
}

impl LogLevel {
    const NAMES: [(LogLevel, &'static str); 6] = [
        (LogLevel::Off, "off"),
        (LogLevel::Error, "error"),
        (LogLevel::Warn, "warn"),
        (LogLevel::Info, "info"),
        (LogLevel::Debug, "debug"),
        (LogLevel::Trace, "trace"),
    ];

    /// Parse a level name, ignoring case. Unknown names give `None`.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// The `EnvFilter` directive for this level.
    pub fn as_str(&self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(level, _)| level == self)
            .map_or("info", |(_, name)| *name)
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::NAMES
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(wanted))
            .map(|(level, _)| *level)
            .ok_or_else(|| ConfigError::UnknownLogLevel(wanted.to_string()))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Compute worker threads. Defaults to the available parallelism.
    pub num_workers: usize,
    /// Upper bound on blocking pool threads.
    pub max_blocking_threads: usize,
    /// Idle time after which a blocking thread exits.
    pub blocking_keep_alive: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            max_blocking_threads: DEFAULT_MAX_BLOCKING_THREADS,
            blocking_keep_alive: DEFAULT_BLOCKING_KEEP_ALIVE,
        }
    }
}

/// Run-loop settings.
#[derive(Debug, Clone)]
pub struct RunLoopConfig {
    /// `map` calls fused into one node before a new node is boxed.
    pub fusion_max_stack_depth: usize,
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self { fusion_max_stack_depth: DEFAULT_FUSION_MAX_STACK_DEPTH }
    }
}

/// Timer settings.
#[derive(Debug, Clone, Default)]
pub struct TimerConfig {
    /// Limit used by [`IO::timeout_default`](crate::IO::timeout_default);
    /// `None` disables it.
    pub default_timeout: Option<Duration>,
}

/// Log output settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Verbosity. `RUST_LOG` overrides it when set.
    pub level: LogLevel,
    /// Prefix lines with a timestamp.
    pub timestamps: bool,
    /// Append file and line. On by default in debug builds.
    pub source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            timestamps: true,
            source_location: cfg!(debug_assertions),
        }
    }
}

// ============================================================================
// RuntimeConfig
// ============================================================================

/// Every runtime setting.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Worker pool.
    pub scheduler: SchedulerConfig,
    /// Run-loop.
    pub run_loop: RunLoopConfig,
    /// Timers.
    pub timer: TimerConfig,
    /// Logging.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Start from the defaults.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Read `EMBER_*` variables over the defaults.
    ///
    /// A variable that is unset, unparsable or out of range leaves its
    /// setting at the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<L>(lookup: L) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        let positive = |name: &str| number(name).filter(|&n| n > 0).map(|n| n as usize);

        let mut config = Self::default();
        if let Some(n) = positive("EMBER_NUM_WORKERS") {
            config.scheduler.num_workers = n;
        }
        if let Some(n) = positive("EMBER_MAX_BLOCKING_THREADS") {
            config.scheduler.max_blocking_threads = n;
        }
        if let Some(ms) = number("EMBER_BLOCKING_KEEP_ALIVE_MS") {
            config.scheduler.blocking_keep_alive = Duration::from_millis(ms);
        }
        if let Some(n) = positive("EMBER_FUSION_MAX_STACK_DEPTH") {
            config.run_loop.fusion_max_stack_depth = n;
        }
        if let Some(ms) = number("EMBER_DEFAULT_TIMEOUT_MS") {
            config.timer.default_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        match lookup("EMBER_LOG_LEVEL").map(|v| v.parse::<LogLevel>()) {
            Some(Ok(level)) => config.log.level = level,
            Some(Err(e)) => tracing::warn!(error = %e, "ignoring EMBER_LOG_LEVEL"),
            None => {}
        }
        config
    }

    /// Check every setting, reporting the first one out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("scheduler.num_workers", self.scheduler.num_workers, 1)?;
        at_least("scheduler.max_blocking_threads", self.scheduler.max_blocking_threads, 1)?;
        at_least("run_loop.fusion_max_stack_depth", self.run_loop.fusion_max_stack_depth, 1)?;
        if self.timer.default_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

fn at_least(field: &'static str, found: usize, minimum: usize) -> Result<(), ConfigError> {
    if found < minimum {
        Err(ConfigError::TooSmall { field, minimum, found })
    } else {
        Ok(())
    }
}

/// Fluent construction of a [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Compute worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Blocking pool limit.
    pub fn max_blocking_threads(mut self, n: usize) -> Self {
        self.config.scheduler.max_blocking_threads = n;
        self
    }

    /// Idle blocking thread lifetime.
    pub fn blocking_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.scheduler.blocking_keep_alive = keep_alive;
        self
    }

    /// `map` fusions per node.
    pub fn fusion_max_stack_depth(mut self, depth: usize) -> Self {
        self.config.run_loop.fusion_max_stack_depth = depth;
        self
    }

    /// Default timeout.
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timer.default_timeout = timeout;
        self
    }

    /// Log verbosity.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Timestamps on log lines.
    pub fn log_timestamps(mut self, enabled: bool) -> Self {
        self.config.log.timestamps = enabled;
        self
    }

    /// File and line on log lines.
    pub fn log_source_location(mut self, enabled: bool) -> Self {
        self.config.log.source_location = enabled;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate().map(|()| self.config)
    }

    /// Return the configuration as is.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Fusion depth from the installed configuration, or the default.
pub(crate) fn fusion_max_stack_depth() -> usize {
    crate::runtime_config().map_or(DEFAULT_FUSION_MAX_STACK_DEPTH, |c| c.run_loop.fusion_max_stack_depth)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    fn from_vars(vars: &[(&str, &str)]) -> RuntimeConfig {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        RuntimeConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.scheduler.num_workers >= 1);
        assert_eq!(config.scheduler.max_blocking_threads, 512);
        assert_eq!(config.run_loop.fusion_max_stack_depth, 127);
        assert_eq!(config.timer.default_timeout, None);
        assert_eq!(config.log.level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_sets_every_section() {
        let config = RuntimeConfig::builder()
            .num_workers(4)
            .max_blocking_threads(8)
            .blocking_keep_alive(Duration::from_millis(250))
            .fusion_max_stack_depth(31)
            .default_timeout(Some(Duration::from_secs(30)))
            .log_level(LogLevel::Debug)
            .log_timestamps(false)
            .build()
            .unwrap();

        assert_eq!(config.scheduler.num_workers, 4);
        assert_eq!(config.scheduler.max_blocking_threads, 8);
        assert_eq!(config.scheduler.blocking_keep_alive, Duration::from_millis(250));
        assert_eq!(config.run_loop.fusion_max_stack_depth, 31);
        assert_eq!(config.timer.default_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.log.level, LogLevel::Debug);
        assert!(!config.log.timestamps);
    }

    #[test]
    fn test_build_rejects_out_of_range() {
        assert_eq!(
            RuntimeConfig::builder().num_workers(0).build().unwrap_err(),
            ConfigError::TooSmall { field: "scheduler.num_workers", minimum: 1, found: 0 }
        );
        assert!(RuntimeConfig::builder().fusion_max_stack_depth(0).build().is_err());
        assert_eq!(
            RuntimeConfig::builder().default_timeout(Some(Duration::ZERO)).build().unwrap_err(),
            ConfigError::ZeroTimeout
        );
        assert_eq!(RuntimeConfig::builder().num_workers(0).build_unchecked().scheduler.num_workers, 0);
    }

    #[test]
    fn test_log_level_names() {
        assert_eq!(LogLevel::parse("OFF"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse(" warn "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("Trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!("verbose".parse::<LogLevel>().unwrap_err(), ConfigError::UnknownLogLevel("verbose".into()));
        assert_eq!(LogLevel::Debug.to_string(), "debug");
        assert_eq!(LevelFilter::from(LogLevel::Warn), LevelFilter::WARN);
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let config = from_vars(&[
            ("EMBER_NUM_WORKERS", "3"),
            ("EMBER_MAX_BLOCKING_THREADS", "16"),
            ("EMBER_BLOCKING_KEEP_ALIVE_MS", "1500"),
            ("EMBER_FUSION_MAX_STACK_DEPTH", "63"),
            ("EMBER_DEFAULT_TIMEOUT_MS", "200"),
            ("EMBER_LOG_LEVEL", "error"),
        ]);
        assert_eq!(config.scheduler.num_workers, 3);
        assert_eq!(config.scheduler.max_blocking_threads, 16);
        assert_eq!(config.scheduler.blocking_keep_alive, Duration::from_millis(1500));
        assert_eq!(config.run_loop.fusion_max_stack_depth, 63);
        assert_eq!(config.timer.default_timeout, Some(Duration::from_millis(200)));
        assert_eq!(config.log.level, LogLevel::Error);
    }

    #[test]
    fn test_from_lookup_keeps_defaults_on_bad_values() {
        let config = from_vars(&[
            ("EMBER_NUM_WORKERS", "0"),
            ("EMBER_FUSION_MAX_STACK_DEPTH", "many"),
            ("EMBER_DEFAULT_TIMEOUT_MS", "0"),
            ("EMBER_LOG_LEVEL", "chatty"),
        ]);
        let defaults = RuntimeConfig::default();
        assert_eq!(config.scheduler.num_workers, defaults.scheduler.num_workers);
        assert_eq!(config.run_loop.fusion_max_stack_depth, 127);
        assert_eq!(config.timer.default_timeout, None);
        assert_eq!(config.log.level, LogLevel::Info);
    }

    #[test]
    fn test_error_messages_name_the_setting() {
        let err = ConfigError::TooSmall { field: "scheduler.num_workers", minimum: 1, found: 0 };
        assert_eq!(err.to_string(), "scheduler.num_workers must be at least 1, got 0");
    }
}
