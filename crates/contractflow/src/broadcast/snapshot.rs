//! Status snapshots shared by the push channel and the status query.
//!
//! A snapshot is the complete current state of one job or document. Applying
//! the same snapshot twice is harmless, so subscribers can treat delivery as
//! at-least-once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::state::{DocumentType, ProcessingStatus, UploadStatus};
use crate::queue::{EntityRef, Job, JobFailure, JobStatus, JobType};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i32,
    pub entity: EntityRef,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<JobFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub cancel_requested: bool,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            status: job.status,
            priority: job.priority,
            entity: job.entity.clone(),
            progress: job.progress,
            current_step: job.current_step.clone(),
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            error: job.error.clone(),
            error_detail: job.error_detail.clone(),
            result: job.result.clone(),
            cancel_requested: job.cancel_requested,
            scheduled_at: job.scheduled_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub filename: String,
    pub document_type: DocumentType,
    pub sequence_order: i32,
    pub upload_status: UploadStatus,
    pub processing_status: ProcessingStatus,
    pub total_chunks: u32,
    pub chunks_uploaded: u32,
    pub page_count: u32,
    pub pages_completed: u32,
    pub pages_failed: u32,
    pub word_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One message on the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StatusEvent {
    Job(JobSnapshot),
    Document(DocumentSnapshot),
}

impl StatusEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            StatusEvent::Job(s) => Some(&s.job_id),
            StatusEvent::Document(_) => None,
        }
    }

    pub fn document_id(&self) -> Option<&str> {
        match self {
            StatusEvent::Job(s) => s.entity.document_id(),
            StatusEvent::Document(s) => Some(&s.document_id),
        }
    }
}

/// Which events a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Job(String),
    /// The document itself plus jobs on it or its pages.
    Document(String),
    JobType(JobType),
}

impl StatusFilter {
    pub fn matches(&self, event: &StatusEvent) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Job(id) => event.job_id() == Some(id.as_str()),
            StatusFilter::Document(id) => event.document_id() == Some(id.as_str()),
            StatusFilter::JobType(t) => {
                matches!(event, StatusEvent::Job(s) if s.job_type == *t)
            }
        }
    }
}
