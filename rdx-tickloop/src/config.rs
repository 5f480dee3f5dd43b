//! Defines the configuration structures for the scheduler.
//!
//! These structs are designed to be deserialized from a configuration file
//! (e.g., a TOML file) using `serde`, with `TICKLOOP_*` environment variables
//! layered on top. This allows the loop's rates and fault behavior to be
//! tuned without touching application code.

use crate::error::{Result, TickloopError};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;

/// Default target frames per second, used when the embedder does not know
/// the display's refresh rate.
pub const DEFAULT_TARGET_FPS: u32 = 60;

/// Default target fixed updates per second.
pub const DEFAULT_TARGET_UPS: u32 = 60;

/// Prefix for environment overrides, e.g. `TICKLOOP_TARGET_UPS=30`.
pub const ENV_PREFIX: &str = "TICKLOOP";

/// The top-level configuration for a `Scheduler`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Frame rate the sync step paces the loop to.
    pub target_fps: u32,

    /// Fixed update rate. Each fixed step is `1 / target_ups` seconds.
    pub target_ups: u32,

    /// Upper bound on accumulated, not yet simulated time, in seconds.
    ///
    /// `None` keeps catch-up unbounded: after a long stall every owed fixed
    /// step is executed.
    pub max_accumulated: Option<f64>,

    /// What happens when a loop-state action panics.
    pub fault_policy: FaultPolicy,

    /// Whether the bundled binaries pace the loop. Library callers decide
    /// this with their own sync predicate.
    pub sync: bool,
}

/// Defines how the loop reacts to a panicking loop-state action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// The panic unwinds out of `Scheduler::run`. The rest of the iteration
    /// is skipped.
    #[default]
    Propagate,
    /// The panic is caught per state and logged; the loop carries on.
    Isolate,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_TARGET_FPS,
            target_ups: DEFAULT_TARGET_UPS,
            max_accumulated: None,
            fault_policy: FaultPolicy::default(),
            sync: true,
        }
    }
}

impl SchedulerConfig {
    /// Loads a configuration from an optional TOML file, then applies
    /// `TICKLOOP_*` environment overrides. Missing files are not an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?;
        let config: SchedulerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration from a TOML string.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?;
        let config: SchedulerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the rates and the clamp. Called by every constructor that
    /// accepts a config.
    pub fn validate(&self) -> Result<()> {
        validate_fps(self.target_fps)?;
        validate_ups(self.target_ups)?;
        if let Some(max) = self.max_accumulated {
            validate_max_accumulated(max)?;
        }
        Ok(())
    }

    /// Length of one fixed step in seconds.
    pub fn fixed_step(&self) -> f64 {
        1.0 / f64::from(self.target_ups)
    }
}

pub(crate) fn validate_fps(fps: u32) -> Result<()> {
    if fps < 1 {
        return Err(TickloopError::InvalidTargetFps(fps));
    }
    Ok(())
}

pub(crate) fn validate_ups(ups: u32) -> Result<()> {
    if ups < 1 {
        return Err(TickloopError::InvalidTargetUps(ups));
    }
    Ok(())
}

pub(crate) fn validate_max_accumulated(max: f64) -> Result<()> {
    if !(max.is_finite() && max > 0.0) {
        return Err(TickloopError::InvalidMaxAccumulated(max));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.target_fps, DEFAULT_TARGET_FPS);
        assert_eq!(config.target_ups, DEFAULT_TARGET_UPS);
        assert_eq!(config.max_accumulated, None);
        assert_eq!(config.fault_policy, FaultPolicy::Propagate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml_with_partial_fields() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            target_ups = 30
            max_accumulated = 0.25
            fault_policy = "isolate"
            "#,
        )
        .unwrap();
        assert_eq!(config.target_fps, DEFAULT_TARGET_FPS);
        assert_eq!(config.target_ups, 30);
        assert_eq!(config.max_accumulated, Some(0.25));
        assert_eq!(config.fault_policy, FaultPolicy::Isolate);
        assert!((config.fixed_step() - 1.0 / 30.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_rates_are_rejected() {
        let err = SchedulerConfig::from_toml_str("target_fps = 0").unwrap_err();
        assert!(matches!(err, TickloopError::InvalidTargetFps(0)));

        let err = SchedulerConfig::from_toml_str("target_ups = 0").unwrap_err();
        assert!(matches!(err, TickloopError::InvalidTargetUps(0)));
    }

    #[test]
    fn test_non_positive_clamp_is_rejected() {
        let err = SchedulerConfig::from_toml_str("max_accumulated = 0.0").unwrap_err();
        assert!(matches!(err, TickloopError::InvalidMaxAccumulated(_)));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = SchedulerConfig::load("definitely/not/here/tickloop.toml").unwrap();
        assert_eq!(config.target_ups, DEFAULT_TARGET_UPS);
    }
}
