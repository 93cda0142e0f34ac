#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Types shared by the adaptive throttle and its callers.
//!
//! The degradation arithmetic lives here as pure functions on
//! [`ThrottleConfig`] so it can be reasoned about without a state store.

use std::time::Duration;

use elementa_feed_models::DestinationKey;
use serde::{Deserialize, Serialize};

/// Tuning for the adaptive throttle. Every field has a default, so a TOML
/// file only needs the values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Recovery window applied when a destination first shows distress.
    pub default_recovery_secs: u64,
    /// Upper bound on the recovery window.
    pub max_recovery_secs: u64,
    /// Factor applied to the recovery window on each further failure.
    pub recovery_growth: f64,
    /// How long, as a multiple of the recovery window, a destination's
    /// failure history is remembered. A failure inside this horizon grows
    /// the window; one after it starts over at the default.
    pub recovery_memory_factor: f64,
    /// Batch size used before any degradation.
    pub default_batch_size: u32,
    /// Batch size never shrinks below this.
    pub min_batch_size: u32,
    /// Factor applied to the batch size on each failure.
    pub batch_shrink: f64,
    /// Requests admitted per admission window when no override is set.
    pub admission_limit: u32,
    /// Length of the admission window in milliseconds.
    pub admission_window_ms: u64,
    /// Compare-and-swap attempts before falling back to last-write-wins.
    pub cas_retries: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            default_recovery_secs: 60,
            max_recovery_secs: 300,
            recovery_growth: 1.5,
            recovery_memory_factor: 2.0,
            default_batch_size: 25,
            min_batch_size: 5,
            batch_shrink: 0.5,
            admission_limit: 10,
            admission_window_ms: 1_000,
            cas_retries: 5,
        }
    }
}

impl ThrottleConfig {
    /// Recovery window for a destination entering recovery.
    #[must_use]
    pub const fn default_recovery_time(&self) -> Duration {
        Duration::from_secs(self.default_recovery_secs)
    }

    /// Recovery window cap.
    #[must_use]
    pub const fn max_recovery_time(&self) -> Duration {
        Duration::from_secs(self.max_recovery_secs)
    }

    /// Base admission window.
    #[must_use]
    pub const fn admission_window(&self) -> Duration {
        Duration::from_millis(self.admission_window_ms)
    }

    /// Recovery window after one more failure on top of `current`.
    #[must_use]
    pub fn next_recovery_time(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.recovery_growth.max(1.0))
            .min(self.max_recovery_time())
    }

    /// How long a destination's failure history outlives `recovery_time`.
    #[must_use]
    pub fn recovery_memory(&self, recovery_time: Duration) -> Duration {
        recovery_time.mul_f64(self.recovery_memory_factor.max(1.0))
    }

    /// Batch size after one more failure on top of `current`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn next_batch_size(&self, current: u32) -> u32 {
        let shrunk = (f64::from(current) * self.batch_shrink.clamp(0.0, 1.0)).floor() as u32;
        current.min(shrunk.max(self.min_batch_size))
    }
}

/// Admission parameters written by an operator or monitor, overriding the
/// configured base rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionOverride {
    /// Requests admitted per window.
    pub limit: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl AdmissionOverride {
    /// Window as a [`Duration`].
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Point-in-time view of one destination's throttle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleState {
    /// Destination the state belongs to.
    pub destination: DestinationKey,
    /// Whether calls are currently delayed.
    pub recovering: bool,
    /// Delay applied to each call while recovering.
    pub recovery_time: Duration,
    /// Batch size the chunking layer should use.
    pub batch_size: u32,
    /// Requests admitted per window.
    pub admission_limit: u32,
    /// Admission window.
    pub admission_window: Duration,
}

/// How one outbound call ended, from the throttle's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The call succeeded.
    Success,
    /// The call failed in a way that says nothing about destination health.
    Failure,
    /// The destination is in distress (5xx or timeout).
    Distress,
}

impl CallOutcome {
    /// Classifies a call result.
    #[must_use]
    pub fn of<T, E: DistressSignal>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) if e.is_distress() => Self::Distress,
            Err(_) => Self::Failure,
        }
    }
}

/// Implemented by client errors so the throttle can tell destination
/// distress apart from ordinary failures.
pub trait DistressSignal {
    /// Whether this error indicates the destination is overloaded or
    /// failing (HTTP status >= 500, timeout).
    fn is_distress(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Status(u16);

    impl DistressSignal for Status {
        fn is_distress(&self) -> bool {
            self.0 >= 500
        }
    }

    #[test]
    fn batch_size_halves_down_to_floor() {
        let config = ThrottleConfig::default();
        let mut size = config.default_batch_size;
        let mut seen = vec![size];
        for _ in 0..5 {
            size = config.next_batch_size(size);
            seen.push(size);
        }
        assert_eq!(seen, vec![25, 12, 6, 5, 5, 5]);
    }

    #[test]
    fn batch_size_matches_closed_form() {
        let config = ThrottleConfig::default();
        let mut size = config.default_batch_size;
        for n in 1..10 {
            size = config.next_batch_size(size);
            let expected = (25 >> n).max(5);
            assert_eq!(size, expected, "after {n} failures");
        }
    }

    #[test]
    fn raised_floor_never_grows_batch_size() {
        let config = ThrottleConfig {
            min_batch_size: 10,
            ..ThrottleConfig::default()
        };
        assert_eq!(config.next_batch_size(4), 4);
        assert_eq!(config.next_batch_size(10), 10);
        assert_eq!(config.next_batch_size(16), 10);
    }

    #[test]
    fn recovery_time_grows_to_cap() {
        let config = ThrottleConfig::default();
        let mut time = config.default_recovery_time();
        let mut seen = vec![time.as_millis()];
        for _ in 0..5 {
            time = config.next_recovery_time(time);
            seen.push(time.as_millis());
        }
        assert_eq!(seen, vec![60_000, 90_000, 135_000, 202_500, 300_000, 300_000]);
    }

    #[test]
    fn classifies_results() {
        assert_eq!(CallOutcome::of::<(), Status>(&Ok(())), CallOutcome::Success);
        assert_eq!(CallOutcome::of::<(), _>(&Err(Status(503))), CallOutcome::Distress);
        assert_eq!(CallOutcome::of::<(), _>(&Err(Status(404))), CallOutcome::Failure);
    }

    #[test]
    fn config_fills_defaults_from_partial_toml() {
        let config: ThrottleConfig = toml::from_str("default_batch_size = 50\n").unwrap();
        assert_eq!(config.default_batch_size, 50);
        assert_eq!(config.max_recovery_secs, 300);
        assert_eq!(config.admission_window(), Duration::from_secs(1));
    }
}
