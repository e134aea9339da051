use std::time::Duration;

use rand::Rng;

/// Backoff schedule for retrying a failed request.
///
/// The default schedule reproduces doubling whole-second delays
/// (1s, 2s, 4s, ...) but caps them at `max_backoff` so a generous retry
/// count cannot produce unbounded sleeps. Jitter is off unless asked for.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
}

const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter_ratio: 0.0,
        }
    }

    pub fn disabled() -> Self {
        Self::standard().retries(0)
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff.max(Duration::from_millis(1));
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub(crate) fn retries_value(&self) -> u32 {
        self.retries
    }

    /// Delay before the attempt after `attempt` (zero-based) failed.
    pub(crate) fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1_u128 << attempt.min(31);
        let base_ms = self.base_backoff.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let mut rng = rand::rng();
        let sampled_ms = rng.random_range(low..=high).min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
