//! [`CycleBudget`] – per-cycle wall-clock deadline.
//!
//! Started at the top of every cycle. Long-running steps poll
//! [`CycleBudget::expired`] and stop early; at the end of the cycle
//! [`CycleBudget::violation`] reports whether the deadline was missed.

use std::time::{Duration, Instant};

use placerec_types::PlaceError;

/// Deadline for one cycle. `None` means unlimited.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use placerec_kernel::budget::CycleBudget;
///
/// let budget = CycleBudget::start(Some(Duration::from_secs(60)));
/// assert!(!budget.expired());
/// assert!(budget.violation().is_none());
///
/// assert!(!CycleBudget::unlimited().expired());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CycleBudget {
    started: Instant,
    limit: Option<Duration>,
}

impl CycleBudget {
    /// Start the clock now.
    pub fn start(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    /// Start the clock with a limit in milliseconds. `0`, and values too
    /// large for a [`Duration`], mean unlimited.
    pub fn from_millis(limit_ms: f64) -> Self {
        let limit = if limit_ms > 0.0 {
            Duration::try_from_secs_f64(limit_ms / 1000.0).ok()
        } else {
            None
        };
        Self::start(limit)
    }

    pub fn unlimited() -> Self {
        Self::start(None)
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left, or `None` when unlimited.
    pub fn remaining(&self) -> Option<Duration> {
        self.limit.map(|limit| limit.saturating_sub(self.elapsed()))
    }

    pub fn expired(&self) -> bool {
        self.limit.is_some_and(|limit| self.elapsed() > limit)
    }

    /// A [`PlaceError::TimingViolation`] if the deadline has passed.
    pub fn violation(&self) -> Option<PlaceError> {
        let limit = self.limit?;
        let elapsed = self.elapsed();
        (elapsed > limit).then(|| PlaceError::TimingViolation {
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
            budget_ms: limit.as_secs_f64() * 1000.0,
        })
    }
}
