//! Tracing setup for embedding hosts
//!
//! The engine only emits `tracing` events; installing a subscriber is the
//! host's job. [`init_logger`] is a shortcut for hosts and test binaries
//! that want the engine's output on stderr without wiring
//! `tracing-subscriber` themselves.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Verbosity for [`init_logger`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Install a compact stderr subscriber filtered to this crate's events.
///
/// Returns false when a global subscriber is already installed; the
/// existing one stays in effect, so repeated calls across a test binary
/// are harmless.
pub fn init_logger(level: LogLevel) -> bool {
    let filter = EnvFilter::new(format!("testflow={}", level.as_level()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}
