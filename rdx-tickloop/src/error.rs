//! Error types for the scheduler.

use thiserror::Error;

/// Everything the scheduler can reject.
///
/// Configuration errors are reported at the call site and never clamped. A
/// rejected call leaves the previous valid state untouched.
#[derive(Debug, Error)]
pub enum TickloopError {
    #[error("target FPS must be at least 1, got {0}")]
    InvalidTargetFps(u32),

    #[error("target UPS must be at least 1, got {0}")]
    InvalidTargetUps(u32),

    #[error("max accumulated time must be a positive number of seconds, got {0}")]
    InvalidMaxAccumulated(f64),

    #[error("the scheduler is already running")]
    AlreadyRunning,

    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, TickloopError>;
