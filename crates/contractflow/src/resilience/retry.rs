//! Per-category retry policies for dependency calls.

use std::time::Duration;

use crate::config::schema::{BackoffCurve, RetryPolicySettings, RetrySettings};

use super::classify::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub curve: BackoffCurve,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            curve: BackoffCurve::Fixed,
        }
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.curve {
            BackoffCurve::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffCurve::Linear => self.base_delay.saturating_mul(attempt),
            BackoffCurve::Fixed => self.base_delay,
        };
        delay.min(self.max_delay)
    }
}

impl From<&RetryPolicySettings> for RetryPolicy {
    fn from(s: &RetryPolicySettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            curve: s.backoff,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicies {
    network: RetryPolicy,
    database: RetryPolicy,
    unknown: RetryPolicy,
}

impl RetryPolicies {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            network: RetryPolicy::from(&settings.network),
            database: RetryPolicy::from(&settings.database),
            unknown: RetryPolicy::from(&settings.unknown),
        }
    }

    pub fn for_category(&self, category: ErrorCategory) -> RetryPolicy {
        match category {
            ErrorCategory::Network => self.network,
            ErrorCategory::Database => self.database,
            ErrorCategory::Unknown => self.unknown,
            ErrorCategory::Validation
            | ErrorCategory::Authentication
            | ErrorCategory::Integrity => RetryPolicy::single_attempt(),
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}
