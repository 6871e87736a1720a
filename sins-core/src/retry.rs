//! Resend policy for acknowledged requests.

use std::time::Duration;

use rand::Rng;

/// Longest exponent applied to `backoff`; keeps the delay finite.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// How many times an unacknowledged request is resent, and how long to wait
/// between attempts. The default never resends.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first resend; doubled for each later one.
    pub backoff: Duration,
    /// Upper bound of a uniform random delay added to every resend.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(max_retries: u32, backoff: Duration, jitter: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            jitter,
        }
    }

    /// Whether another resend is allowed after `retries` resends so far.
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Wait before resend number `retries + 1`.
    pub fn delay(&self, retries: u32) -> Duration {
        let factor = 1u32 << retries.min(MAX_BACKOFF_SHIFT);
        let base = self.backoff.saturating_mul(factor);
        if self.jitter.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(Duration::ZERO..=self.jitter);
        base.saturating_add(extra)
    }
}
