//! Backoff policy gating `Failed -> Connecting` transitions.

use std::time::Duration;

use tokio::time::Instant;

use super::connection::RetryState;

/// Exponential backoff schedule for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Outcome of asking the policy whether a reconnect may start now.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Proceed,
    /// Too soon; the next attempt is allowed after this long.
    Backoff(Duration),
    /// The retry budget is spent.
    Exhausted,
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based): base * 2^(n-1),
    /// capped at `max_delay`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.max_delay)
    }

    /// Check the gate and, if the attempt may proceed, record it.
    pub(crate) fn check(&self, retry: &mut RetryState) -> RetryDecision {
        if retry.attempts >= self.max_retries {
            return RetryDecision::Exhausted;
        }
        if let Some(next) = retry.next_allowed {
            let now = Instant::now();
            if now < next {
                return RetryDecision::Backoff(next - now);
            }
        }
        retry.attempts += 1;
        retry.next_allowed = Some(Instant::now() + self.backoff_for(retry.attempts));
        RetryDecision::Proceed
    }
}
