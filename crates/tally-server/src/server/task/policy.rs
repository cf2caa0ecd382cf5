use core::time::Duration;
use rand::Rng;

/// Bounded exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a task is dead-lettered. At least `1`.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Spread each delay uniformly over `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_backoff
            .checked_mul(1_u32 << exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);

        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let upper = delay.as_micros() as u64;
        let lower = upper / 2;
        Duration::from_micros(rand::rng().random_range(lower..=upper))
    }
}
