//! Time sources and the sampling clock that drives the loop.
//!
//! The scheduler never reads the wall clock directly. It goes through a
//! [`TimeSource`], so tests can swap in [`ManualTime`] and step time by hand.

use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A monotonic source of time, in seconds, plus a way to wait on it.
pub trait TimeSource: Send + Sync {
    /// Seconds since some fixed origin. Must never go backwards.
    fn now(&self) -> f64;

    /// Blocks for up to `duration`, returning early if anything arrives on
    /// `wake`. Interruptions and disconnects are treated as "wake up now".
    fn sleep(&self, duration: Duration, wake: &Receiver<()>) {
        let _ = wake.recv_timeout(duration);
    }
}

/// The real, monotonic clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// A hand-cranked time source for deterministic tests and replays.
///
/// Time only moves when [`ManualTime::advance`] or [`ManualTime::set`] is
/// called, or when the scheduler sleeps on it (the sleep advances time by the
/// requested duration instead of blocking). Cloning shares the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualTime {
    bits: Arc<AtomicU64>,
}

impl ManualTime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward by `seconds`. Negative values are ignored.
    pub fn advance(&self, seconds: f64) {
        if seconds > 0.0 {
            self.set(self.now() + seconds);
        }
    }

    /// Jumps to an absolute time in seconds.
    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::SeqCst);
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration, _wake: &Receiver<()>) {
        self.advance(duration.as_secs_f64());
    }
}

/// Samples a [`TimeSource`] and reports the time between samples.
pub struct Clock {
    source: Arc<dyn TimeSource>,
    last_sample: Option<f64>,
}

impl Clock {
    pub fn new(source: Arc<dyn TimeSource>) -> Self {
        Self {
            source,
            last_sample: None,
        }
    }

    /// Current time of the underlying source.
    pub fn now(&self) -> f64 {
        self.source.now()
    }

    /// Seconds since the previous call, recording the new sample.
    ///
    /// The first call returns zero. A source that steps backwards also yields
    /// zero rather than a negative delta.
    pub fn sample_delta(&mut self) -> f64 {
        let now = self.source.now();
        let delta = match self.last_sample {
            Some(last) => (now - last).max(0.0),
            None => 0.0,
        };
        self.last_sample = Some(now);
        delta
    }

    /// The timestamp recorded by the last `sample_delta` call, or the current
    /// time if nothing has been sampled yet.
    pub fn last_sample_timestamp(&self) -> f64 {
        self.last_sample.unwrap_or_else(|| self.source.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_is_zero() {
        let time = ManualTime::new();
        time.set(5.0);
        let mut clock = Clock::new(Arc::new(time));
        assert_eq!(clock.sample_delta(), 0.0);
        assert_eq!(clock.last_sample_timestamp(), 5.0);
    }

    #[test]
    fn test_delta_between_samples() {
        let time = ManualTime::new();
        let mut clock = Clock::new(Arc::new(time.clone()));
        clock.sample_delta();
        time.advance(0.5);
        assert_eq!(clock.sample_delta(), 0.5);
        time.advance(0.25);
        assert_eq!(clock.sample_delta(), 0.25);
        assert_eq!(clock.last_sample_timestamp(), 0.75);
    }

    #[test]
    fn test_backwards_source_clamps_to_zero() {
        let time = ManualTime::new();
        time.set(10.0);
        let mut clock = Clock::new(Arc::new(time.clone()));
        clock.sample_delta();
        time.set(9.0);
        assert_eq!(clock.sample_delta(), 0.0);
    }

    #[test]
    fn test_manual_sleep_advances_time() {
        let time = ManualTime::new();
        let (_tx, rx) = crossbeam_channel::unbounded();
        time.sleep(Duration::from_millis(250), &rx);
        assert!((time.now() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_monotonic_sleep_wakes_early_on_signal() {
        let time = MonotonicTime::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(()).unwrap();
        let start = time.now();
        time.sleep(Duration::from_secs(5), &rx);
        assert!(time.now() - start < 1.0);
    }
}
