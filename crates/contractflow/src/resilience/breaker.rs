//! Per-dependency circuit breakers.
//!
//! State lives in atomics so a call site never takes a lock. Transitions out
//! of OPEN go through a compare-and-swap, which is what lets exactly one
//! caller through as the HALF_OPEN probe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

impl BreakerState {
    fn from_u8(v: u8) -> Self {
        match v {
            OPEN => BreakerState::Open,
            HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

/// Permission to call the dependency, handed out by [`CircuitBreaker::try_acquire`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    Probe,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub last_state_change: DateTime<Utc>,
}

pub struct CircuitBreaker {
    dependency: String,
    failure_threshold: u32,
    cooldown: Duration,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Millis since epoch when the breaker last opened.
    opened_at: AtomicI64,
    /// Millis since epoch of the last state change.
    changed_at: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(
        dependency: impl Into<String>,
        failure_threshold: u32,
        cooldown: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now().timestamp_millis();
        Self {
            dependency: dependency.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at: AtomicI64::new(0),
            changed_at: AtomicI64::new(now),
            clock,
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Asks to call the dependency. `None` means fail fast.
    pub fn try_acquire(&self) -> Option<Permit> {
        match self.state.load(Ordering::Acquire) {
            CLOSED => Some(Permit::Normal),
            OPEN => {
                let now = self.clock.now().timestamp_millis();
                let opened = self.opened_at.load(Ordering::Acquire);
                let cooldown = i64::try_from(self.cooldown.as_millis()).unwrap_or(i64::MAX);
                if now.saturating_sub(opened) < cooldown {
                    return None;
                }
                match self.state.compare_exchange(
                    OPEN,
                    HALF_OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.changed_at.store(now, Ordering::Release);
                        log::info!(
                            "Circuit breaker '{}' half-open, letting one probe through",
                            self.dependency
                        );
                        Some(Permit::Probe)
                    }
                    Err(_) => None,
                }
            }
            // A probe is already in flight.
            _ => None,
        }
    }

    /// Like [`try_acquire`](Self::try_acquire), but the permit is held by a
    /// guard that must be settled with the call's outcome.
    pub fn admit(&self) -> Option<AdmittedCall<'_>> {
        self.try_acquire().map(|permit| AdmittedCall {
            breaker: self,
            permit,
            settled: false,
        })
    }

    pub fn on_success(&self, permit: Permit) {
        self.consecutive_failures.store(0, Ordering::Release);
        if permit == Permit::Probe
            && self
                .state
                .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.changed_at
                .store(self.clock.now().timestamp_millis(), Ordering::Release);
            log::info!("Circuit breaker '{}' closed after successful probe", self.dependency);
        }
    }

    pub fn on_failure(&self, permit: Permit) {
        let now = self.clock.now().timestamp_millis();
        let failures = self
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);

        match permit {
            Permit::Probe => {
                self.opened_at.store(now, Ordering::Release);
                if self
                    .state
                    .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.changed_at.store(now, Ordering::Release);
                    log::warn!(
                        "Circuit breaker '{}' probe failed, open for another {:?}",
                        self.dependency,
                        self.cooldown
                    );
                }
            }
            Permit::Normal if failures >= self.failure_threshold => {
                // Stamp first so nobody sees OPEN with a stale open time.
                self.opened_at.store(now, Ordering::Release);
                if self
                    .state
                    .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.changed_at.store(now, Ordering::Release);
                    log::warn!(
                        "Circuit breaker '{}' opened after {} consecutive failures",
                        self.dependency,
                        failures
                    );
                }
            }
            Permit::Normal => {}
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let changed = self.changed_at.load(Ordering::Acquire);
        BreakerSnapshot {
            dependency: self.dependency.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            failure_threshold: self.failure_threshold,
            cooldown_secs: self.cooldown.as_secs(),
            last_state_change: DateTime::<Utc>::from_timestamp_millis(changed)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        }
    }
}

/// A call the breaker let through.
///
/// Dropping it unsettled, for instance while unwinding out of a panicking
/// dependency, records a failure. A HALF_OPEN probe therefore always ends
/// back in CLOSED or OPEN.
#[must_use]
pub struct AdmittedCall<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    settled: bool,
}

impl AdmittedCall<'_> {
    pub fn permit(&self) -> Permit {
        self.permit
    }

    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.on_success(self.permit);
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.permit);
    }
}

impl Drop for AdmittedCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            log::warn!(
                "Call to '{}' ended without an outcome, counting it as failed",
                self.breaker.dependency
            );
            self.breaker.on_failure(self.permit);
        }
    }
}

/// The table of breakers, one per dependency name, created on first use.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    failure_threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            failure_threshold,
            cooldown,
            clock,
        }
    }

    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        {
            let guard = match self.breakers.read() {
                Ok(g) => g,
                Err(poisoned) => {
                    log::warn!("BreakerRegistry read lock was poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            if let Some(breaker) = guard.get(dependency) {
                return Arc::clone(breaker);
            }
        }

        let mut guard = match self.breakers.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("BreakerRegistry write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let breaker = guard.entry(dependency.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                dependency,
                self.failure_threshold,
                self.cooldown,
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(breaker)
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let guard = match self.breakers.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<_> = guard.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        out
    }
}
