//! Error requeue backoff with jitter.
//!
//! Failed passes are not retried in place: the controller requeues the
//! `ClusterSync` and the next pass starts from fresh reads. This module only
//! decides how long to wait, growing the delay exponentially with the number
//! of consecutive failures so a persistently broken remote is not hammered.

use std::time::Duration;

use rand::Rng;

/// Jitter applied around the computed delay (±10%)
const JITTER: f64 = 0.1;

/// Backoff schedule for failed passes
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
    /// Multiplier applied per additional consecutive failure
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Create a doubling backoff between `initial_delay` and `max_delay`
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Delay before the next pass after `failures` consecutive failures, without jitter
    ///
    /// Zero failures yields the initial delay as well, so callers that lost
    /// track of the count still back off.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before the next pass after `failures` consecutive failures
    ///
    /// Jitter spreads requeues of descriptors that failed together (for
    /// example when the master cluster went away).
    pub fn delay(&self, failures: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range((1.0 - JITTER)..(1.0 + JITTER));
        Duration::from_secs_f64(self.base_delay(failures).as_secs_f64() * jitter)
    }
}
