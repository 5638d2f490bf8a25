//! Operator-facing notifications, separate from per-job status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::queue::{Job, JobFailure};
use crate::resilience::{ClassifiedError, ErrorCategory, Severity};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A job ran out of retries or failed with a non-retryable error.
    JobFailed,
    /// A critical-severity error, raised as soon as it is seen.
    CriticalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorNotification {
    pub kind: NotificationKind,
    pub severity: Severity,
    pub category: ErrorCategory,
    /// Sanitized.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Notifier {
    sender: Arc<broadcast::Sender<OperatorNotification>>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperatorNotification> {
        self.sender.subscribe()
    }

    pub fn notify(&self, notification: OperatorNotification) {
        log::error!(
            "[operator] {:?} ({:?}, {}): {}{}",
            notification.kind,
            notification.severity,
            notification.category,
            notification.message,
            notification
                .job_id
                .as_deref()
                .map(|id| format!(" [job {}]", id))
                .unwrap_or_default()
        );
        let _ = self.sender.send(notification);
    }

    pub fn job_failed(&self, job: &Job, failure: &JobFailure, at: DateTime<Utc>) {
        self.notify(OperatorNotification {
            kind: NotificationKind::JobFailed,
            severity: failure.severity,
            category: failure.category,
            message: format!(
                "{} job failed after {} retries: {}",
                job.job_type, job.retry_count, failure.message
            ),
            job_id: Some(job.id.clone()),
            dependency: failure.dependency.clone(),
            at,
        });
    }

    pub fn critical(&self, dependency: &str, error: &ClassifiedError, at: DateTime<Utc>) {
        self.notify(OperatorNotification {
            kind: NotificationKind::CriticalError,
            severity: error.severity,
            category: error.category,
            message: error.sanitized.clone(),
            job_id: None,
            dependency: Some(dependency.to_string()),
            at,
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}
