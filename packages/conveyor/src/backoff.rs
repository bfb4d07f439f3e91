//! Retry backoff policies.
//!
//! Transient failures retry on an exponential schedule with jitter so a
//! fleet of workers hitting the same broken dependency does not retry in
//! lockstep. Fan-in re-checks use a short bounded delay instead; the join
//! usually becomes ready quickly and an exponential schedule would starve it.

use std::time::Duration;

// =============================================================================
// BackoffPolicy
// =============================================================================

/// Exponential backoff with jitter, capped.
///
/// The default schedule in seconds is 1, 2, 4, 8, 16, 32, 60, 60, ... with
/// ±10% jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any computed delay.
    pub cap: Duration,
    /// Jitter fraction in [0, 1]; each delay is scaled by a uniform factor
    /// in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying a row that has already failed `attempt` times.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let exponent = attempt.clamp(0, 30) as u32;
        let factor = 2u64.saturating_pow(exponent);
        let raw = self
            .base
            .saturating_mul(factor.min(u32::MAX as u64) as u32)
            .min(self.cap);
        self.jittered(raw)
    }

    /// Delay before re-checking a not-yet-ready join: a short fixed ramp,
    /// `2s × (attempt mod 10)` plus up to one second of jitter.
    pub fn join_retry_delay(&self, attempt: i32) -> Duration {
        let step = attempt.rem_euclid(10) as u64;
        Duration::from_secs(2 * step) + Duration::from_millis(fastrand::u64(0..1000))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = self.jitter.min(1.0);
        let factor = 1.0 - spread + 2.0 * spread * fastrand::f64();
        delay.mul_f64(factor)
    }
}
