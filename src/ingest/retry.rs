use crate::storage::ErrorClass;
use std::time::Duration;

/// Bounded exponential backoff for bulk writes.
///
/// `decide` is a pure function of (error class, attempt count) so the
/// policy is testable without any storage backend. Jitter is applied by
/// the copier workers, not here.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// `attempt` is the number of attempts already made, starting at 1.
    pub fn decide(&self, class: ErrorClass, attempt: u32) -> RetryDecision {
        match class {
            ErrorClass::Permanent => RetryDecision::GiveUp,
            ErrorClass::Transient => {
                if attempt >= self.max_attempts {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::Retry(self.backoff(attempt))
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff.saturating_mul(1 << exponent);
        delay.min(self.max_backoff)
    }
}
