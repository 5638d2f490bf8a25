use std::time::Duration;

use crate::config::schema::QueueSettings;

/// Job-level retry delay: `base * 2^retry_count`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.backoff_base_ms),
            Duration::from_millis(settings.backoff_max_ms),
        )
    }

    /// Delay before the next attempt of a job that has failed
    /// `retry_count` times so far.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_settings(&QueueSettings::default())
    }
}
