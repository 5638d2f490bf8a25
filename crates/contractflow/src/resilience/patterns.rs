//! Rolling counts of error signatures, for observability only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{to_chrono, Clock};

use super::classify::{ClassifiedError, ErrorCategory};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPattern {
    pub signature: String,
    pub category: ErrorCategory,
    /// Occurrences inside the current window.
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

pub struct ErrorPatternTracker {
    patterns: Mutex<HashMap<String, ErrorPattern>>,
    threshold: u64,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl ErrorPatternTracker {
    pub fn new(threshold: u64, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            patterns: Mutex::new(HashMap::new()),
            threshold: threshold.max(1),
            window,
            clock,
        }
    }

    /// Counts one occurrence and returns the count inside the window.
    /// Logs a warning the moment a signature reaches the threshold.
    pub fn record(&self, error: &ClassifiedError) -> u64 {
        let now = self.clock.now();
        let mut guard = match self.patterns.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("ErrorPatternTracker lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };

        let entry = guard
            .entry(error.signature.clone())
            .or_insert_with(|| ErrorPattern {
                signature: error.signature.clone(),
                category: error.category,
                count: 0,
                first_seen: now,
                last_seen: now,
            });

        if now - entry.first_seen > to_chrono(self.window) {
            entry.count = 0;
            entry.first_seen = now;
        }
        entry.count += 1;
        entry.last_seen = now;

        if entry.count == self.threshold {
            log::warn!(
                "Recurring {} error: '{}' seen {} times in {:?}",
                entry.category,
                entry.signature,
                entry.count,
                self.window
            );
        }
        entry.count
    }

    /// Current patterns, most frequent first.
    pub fn snapshot(&self) -> Vec<ErrorPattern> {
        let guard = match self.patterns.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<_> = guard.values().cloned().collect();
        out.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        out
    }
}
