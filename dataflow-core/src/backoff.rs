//! Retry backoff policy.

use std::time::Duration;

use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::expr;

/// A bounded exponential backoff policy for message processing retries.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    /// The duration of the first backoff interval, as a duration literal.
    #[serde(default = "Backoff::default_duration")]
    pub duration: String,
    /// The maximum number of attempts.
    #[serde(default = "Backoff::default_steps")]
    pub steps: u64,
    /// The factor applied to the interval after each attempt, in percent.
    #[serde(default = "Backoff::default_factor_percentage")]
    pub factor_percentage: u32,
    /// The random jitter applied to each interval, in percent.
    #[serde(default = "Backoff::default_jitter_percentage")]
    pub jitter_percentage: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            duration: Self::default_duration(),
            steps: Self::default_steps(),
            factor_percentage: Self::default_factor_percentage(),
            jitter_percentage: Self::default_jitter_percentage(),
        }
    }
}

impl Backoff {
    fn default_duration() -> String {
        "100ms".into()
    }

    fn default_steps() -> u64 {
        20
    }

    fn default_factor_percentage() -> u32 {
        200
    }

    fn default_jitter_percentage() -> u32 {
        10
    }

    /// Build the mutable retry state for a single in-flight message.
    pub fn build(&self) -> BackoffState {
        let duration = expr::parse_duration(&self.duration).unwrap_or_else(|_| Duration::from_millis(100));
        BackoffState {
            duration,
            steps_remaining: self.steps,
            factor: f64::from(self.factor_percentage) / 100.0,
            jitter: f64::from(self.jitter_percentage) / 100.0,
        }
    }
}

/// The mutable state of a backoff sequence for one in-flight message.
#[derive(Clone, Debug)]
pub struct BackoffState {
    duration: Duration,
    steps_remaining: u64,
    factor: f64,
    jitter: f64,
}

/// Backoff intervals are clamped to keep a runaway factor from stalling a partition.
const MAX_INTERVAL: Duration = Duration::from_secs(60);

impl BackoffState {
    /// The number of attempts remaining.
    pub fn steps_remaining(&self) -> u64 {
        self.steps_remaining
    }

    /// Consume one step, returning the interval to sleep before the next attempt.
    ///
    /// The returned interval is the current duration with jitter applied; the stored
    /// duration is then scaled by the configured factor for the following step.
    pub fn step(&mut self) -> Duration {
        self.steps_remaining = self.steps_remaining.saturating_sub(1);
        let jittered = if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            self.duration.mul_f64(1.0 + spread)
        } else {
            self.duration
        };
        self.duration = std::cmp::min(self.duration.mul_f64(self.factor), MAX_INTERVAL);
        std::cmp::min(jittered, MAX_INTERVAL)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let backoff = Backoff::default();
        assert_eq!(backoff.duration, "100ms");
        assert_eq!(backoff.steps, 20);
        assert_eq!(backoff.factor_percentage, 200);
        assert_eq!(backoff.jitter_percentage, 10);
    }

    #[test]
    fn step_consumes_and_scales() {
        let mut state = Backoff {
            duration: "100ms".into(),
            steps: 3,
            factor_percentage: 200,
            jitter_percentage: 0,
        }
        .build();
        assert_eq!(state.steps_remaining(), 3);
        assert_eq!(state.step(), Duration::from_millis(100));
        assert_eq!(state.step(), Duration::from_millis(200));
        assert_eq!(state.step(), Duration::from_millis(400));
        assert_eq!(state.steps_remaining(), 0);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut state = Backoff {
            duration: "100ms".into(),
            steps: 100,
            factor_percentage: 100,
            jitter_percentage: 10,
        }
        .build();
        for _ in 0..100 {
            let interval = state.step();
            assert!(
                interval >= Duration::from_millis(90) && interval <= Duration::from_millis(110),
                "interval {:?} outside of jitter bounds",
                interval
            );
        }
    }

    #[test]
    fn intervals_are_clamped() {
        let mut state = Backoff {
            duration: "50s".into(),
            steps: 5,
            factor_percentage: 1000,
            jitter_percentage: 0,
        }
        .build();
        let _first = state.step();
        assert_eq!(state.step(), MAX_INTERVAL);
    }
}
