//! hopwire Logging
//!
//! One place to install the tracing subscriber for the panel binary and tests.
//!
//! ```no_run
//! use hopwire_logging::{init, LogLevel};
//!
//! init(LogLevel::from_verbosity(1));
//! ```
//!
//! `RUST_LOG` always wins over the level passed in, so operators can turn on
//! per-module filters such as `hopwire_control=trace` without a rebuild.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// `false` → `Info`, `true` → `Debug`
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            Self::Debug
        } else {
            Self::Info
        }
    }

    /// `-v` count: 0 → `Info`, 1 → `Debug`, 2+ → `Trace`
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => Self::Info,
            1 => Self::Debug,
            _ => Self::Trace,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the subscriber.
///
/// # Panics
///
/// Panics if a global subscriber is already set; use [`try_init`] otherwise.
pub fn init(level: LogLevel) {
    try_init(level).expect("Failed to initialize logging");
}

/// Install the subscriber, reporting an error if one is already set
pub fn try_init(level: LogLevel) -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_target(false)
        .try_init()
        .map_err(|e| e.to_string())
}

/// Install the subscriber with module targets shown (useful with `RUST_LOG` filters)
pub fn init_with_target(level: LogLevel, show_target: bool) -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_target(show_target)
        .try_init()
        .map_err(|e| e.to_string())
}

/// Subscriber for tests; output is captured by the test harness
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
