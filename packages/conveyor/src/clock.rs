//! Wall-clock and monotonic time abstractions.
//!
//! Two kinds of time flow through the substrate and they must never mix:
//!
//! - **Wall time** (`Clock`) produces `DateTime<Utc>` values for persisted
//!   columns and business scheduling. It is injectable so tests (and
//!   simulated-time harnesses) can control it.
//! - **Monotonic time** ([`Deadline`], over [`tokio::time::Instant`]) drives
//!   timeouts, retry waits, lease renewal, and poll ticks. It is never
//!   persisted.
//!
//! Wall-clock jumps (NTP, DST, VM pause) must not cause retry storms or
//! premature renewal; monotonic values must not leak into database rows.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

// =============================================================================
// Clock
// =============================================================================

/// Source of wall-clock UTC timestamps.
///
/// Server-side stores (PostgreSQL) stamp rows with the database's own clock;
/// this trait covers every place the process itself needs a wall timestamp.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Shared handle to a wall clock.
pub type SharedClock = Arc<dyn Clock>;

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Convenience constructor for the common case.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

// =============================================================================
// Deadline
// =============================================================================

/// A point on the monotonic clock.
///
/// Used for poll ticks, lease renewal schedules, and handler timeouts.
/// Because it wraps [`tokio::time::Instant`], paused-time tests advance it
/// with the rest of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Self {
            at: Instant::now() + duration,
        }
    }

    /// A deadline at a specific monotonic instant.
    pub fn at(instant: Instant) -> Self {
        Self { at: instant }
    }

    /// The underlying instant.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Has the deadline passed?
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left until the deadline (zero if already expired).
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Sleep until the deadline.
    pub async fn wait(&self) {
        tokio::time::sleep_until(self.at).await;
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let remaining = self.remaining();
        if remaining.is_zero() {
            write!(f, "expired")
        } else {
            write!(f, "in {:?}", remaining)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_utc_now() {
        let clock = SystemClock;
        let before = Utc::now();
        let now = clock.now();
        let after = Utc::now();
        assert!(before <= now && now <= after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let deadline = Deadline::after(Duration::from_secs(5));
        assert!(!deadline.is_expired());
        assert!(deadline.remaining() > Duration::from_secs(4));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_wait_resumes_at_instant() {
        let start = Instant::now();
        let deadline = Deadline::after(Duration::from_millis(250));
        deadline.wait().await;
        assert!(Instant::now() - start >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_display() {
        let deadline = Deadline::after(Duration::from_secs(1));
        assert!(format!("{}", deadline).starts_with("in "));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(format!("{}", deadline), "expired");
    }
}
