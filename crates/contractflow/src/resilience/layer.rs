use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::broadcast::Notifier;
use crate::clock::Clock;
use crate::config::schema::ResilienceSettings;
use crate::worker::CancellationToken;

use super::breaker::{BreakerRegistry, BreakerSnapshot};
use super::classify::{classify, ClassifiedError, DependencyError, Severity};
use super::patterns::{ErrorPattern, ErrorPatternTracker};
use super::retry::RetryPolicies;

#[derive(Error, Debug, Clone)]
pub enum ResilienceError {
    #[error("{dependency} is temporarily unavailable")]
    CircuitOpen { dependency: String },

    #[error("{dependency} failed after {attempts} attempt(s): {error}")]
    Failed {
        dependency: String,
        error: ClassifiedError,
        attempts: u32,
    },

    #[error("call to {dependency} cancelled")]
    Cancelled { dependency: String },
}

/// Passed to every attempt of a dependency call.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub dependency: &'a str,
    /// 1-based.
    pub attempt: u32,
    /// Upper bound the provider must apply to its own IO.
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> CallOutcome<T> {
    /// Attempts beyond the first.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Wraps calls to external dependencies with classification, per-category
/// retry and a per-dependency circuit breaker.
pub struct ResilienceLayer {
    breakers: BreakerRegistry,
    patterns: ErrorPatternTracker,
    policies: RetryPolicies,
    call_timeout: Duration,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
}

impl ResilienceLayer {
    pub fn new(settings: &ResilienceSettings, clock: Arc<dyn Clock>, notifier: Notifier) -> Self {
        Self {
            breakers: BreakerRegistry::new(
                settings.failure_threshold,
                settings.cooldown(),
                Arc::clone(&clock),
            ),
            patterns: ErrorPatternTracker::new(
                settings.error_pattern_threshold,
                settings.error_pattern_window(),
                Arc::clone(&clock),
            ),
            policies: RetryPolicies::from_settings(&settings.retry),
            call_timeout: settings.call_timeout(),
            clock,
            notifier,
        }
    }

    /// Calls `op` until it succeeds, the retry policy for the error's
    /// category is exhausted, the breaker opens or `cancel` fires.
    ///
    /// An open breaker fails fast without invoking `op`. Cancellation is
    /// checked before every attempt, never during one.
    pub fn call<T, F>(
        &self,
        dependency: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<CallOutcome<T>, ResilienceError>
    where
        F: FnMut(&CallContext<'_>) -> Result<T, DependencyError>,
    {
        let breaker = self.breakers.get(dependency);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled {
                    dependency: dependency.to_string(),
                });
            }
            let Some(admitted) = breaker.admit() else {
                log::warn!("Call to '{}' rejected, circuit open", dependency);
                return Err(ResilienceError::CircuitOpen {
                    dependency: dependency.to_string(),
                });
            };

            let ctx = CallContext {
                dependency,
                attempt,
                timeout: self.call_timeout,
            };
            let span = tracing::info_span!("dependency_call", dependency, attempt);
            let result = span.in_scope(|| op(&ctx));

            let err = match result {
                Ok(value) => {
                    admitted.succeeded();
                    if attempt > 1 {
                        log::info!("'{}' succeeded on attempt {}", dependency, attempt);
                    }
                    return Ok(CallOutcome {
                        value,
                        attempts: attempt,
                    });
                }
                Err(err) => err,
            };

            let classified = classify(&err);
            if classified.category.counts_against_breaker() {
                admitted.failed();
            } else {
                admitted.succeeded();
            }
            self.patterns.record(&classified);
            log::warn!(
                "'{}' attempt {} failed with {} error ({}): {}",
                dependency,
                attempt,
                classified.category,
                classified.severity,
                classified.message
            );
            if classified.severity == Severity::Critical {
                self.notifier
                    .critical(dependency, &classified, self.clock.now());
            }

            let policy = self.policies.for_category(classified.category);
            if attempt >= policy.max_attempts {
                return Err(ResilienceError::Failed {
                    dependency: dependency.to_string(),
                    error: classified,
                    attempts: attempt,
                });
            }
            self.clock.sleep(policy.delay_after(attempt));
        }
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    pub fn error_patterns(&self) -> Vec<ErrorPattern> {
        self.patterns.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resilience::breaker::BreakerState;
    use crate::resilience::classify::ErrorCategory;

    fn layer() -> (ResilienceLayer, Arc<ManualClock>, Notifier) {
        let clock = Arc::new(ManualClock::default());
        let notifier = Notifier::default();
        let layer = ResilienceLayer::new(
            &ResilienceSettings::default(),
            clock.clone(),
            notifier.clone(),
        );
        (layer, clock, notifier)
    }

    #[test]
    fn test_network_errors_retried_until_success() {
        let (layer, clock, _) = layer();
        let start = clock.now();
        let mut calls = 0;
        let outcome = layer
            .call("ocr-provider", &CancellationToken::new(), |ctx| {
                calls += 1;
                assert_eq!(ctx.attempt, calls);
                if calls < 3 {
                    Err(DependencyError::network("connection reset by peer"))
                } else {
                    Ok("text")
                }
            })
            .unwrap();
        assert_eq!(outcome.value, "text");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retries(), 2);
        // 500ms then 1000ms of exponential backoff.
        assert_eq!(clock.now() - start, chrono::Duration::milliseconds(1500));
    }

    #[test]
    fn test_validation_error_not_retried() {
        let (layer, _, _) = layer();
        let mut calls = 0;
        let err = layer
            .call("ocr-provider", &CancellationToken::new(), |_| -> Result<(), _> {
                calls += 1;
                Err(DependencyError::validation("malformed page header"))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        match err {
            ResilienceError::Failed { error, attempts, .. } => {
                assert_eq!(error.category, ErrorCategory::Validation);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        let snapshot = &layer.breaker_snapshots()[0];
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[test]
    fn test_unknown_error_retried_once() {
        let (layer, _, _) = layer();
        let mut calls = 0;
        let _ = layer.call("rule-extraction-provider", &CancellationToken::new(), |_| -> Result<(), _> {
            calls += 1;
            Err(DependencyError::other("unexpected reply"))
        });
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_open_breaker_fails_fast_without_calling() {
        let (layer, clock, _) = layer();
        for _ in 0..5 {
            let _ = layer.call("ocr-provider", &CancellationToken::new(), |_| -> Result<(), _> {
                Err(DependencyError::authentication("invalid api key"))
            });
        }
        assert_eq!(layer.breaker_snapshots()[0].state, BreakerState::Open);

        let mut invoked = false;
        let err = layer
            .call("ocr-provider", &CancellationToken::new(), |_| {
                invoked = true;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, ResilienceError::CircuitOpen { .. }));
        assert!(!invoked);

        clock.advance(Duration::from_secs(31));
        layer
            .call("ocr-provider", &CancellationToken::new(), |_| Ok(()))
            .unwrap();
        let snapshot = &layer.breaker_snapshots()[0];
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[test]
    fn test_cancelled_before_attempt() {
        let (layer, _, _) = layer();
        let token = CancellationToken::new();
        token.cancel();
        let err = layer
            .call("storage", &token, |_| -> Result<(), _> { panic!("must not run") })
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Cancelled { .. }));
    }

    #[test]
    fn test_critical_error_notifies_operator() {
        let (layer, _, notifier) = layer();
        let mut rx = notifier.subscribe();
        let _ = layer.call("storage", &CancellationToken::new(), |_| -> Result<(), _> {
            Err(DependencyError::other("no space left on device"))
        });
        // One notification per failed attempt.
        assert!(rx.try_recv().is_ok());
        assert_eq!(layer.error_patterns()[0].count, 2);
    }
}
