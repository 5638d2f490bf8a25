//! Job model: types, statuses, target entities and failure records.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{parse_optional_timestamp, parse_timestamp};
use crate::db::job_repo::JobRow;
use crate::resilience::{ClassifiedError, ErrorCategory, Severity};
use crate::sanitize::sanitize_message;

use super::QueueError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ChunkUpload,
    TextExtraction,
    PageAnalysis,
    DocumentMerge,
    Ocr,
    ContentIndexing,
    RuleExtraction,
    DocumentValidation,
}

impl JobType {
    pub const ALL: [JobType; 8] = [
        JobType::ChunkUpload,
        JobType::TextExtraction,
        JobType::PageAnalysis,
        JobType::DocumentMerge,
        JobType::Ocr,
        JobType::ContentIndexing,
        JobType::RuleExtraction,
        JobType::DocumentValidation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ChunkUpload => "chunk_upload",
            JobType::TextExtraction => "text_extraction",
            JobType::PageAnalysis => "page_analysis",
            JobType::DocumentMerge => "document_merge",
            JobType::Ocr => "ocr",
            JobType::ContentIndexing => "content_indexing",
            JobType::RuleExtraction => "rule_extraction",
            JobType::DocumentValidation => "document_validation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retrying => "retrying",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse_status(s: &str, job_id: &str) -> JobStatus {
    match s {
        "pending" => JobStatus::Pending,
        "processing" => JobStatus::Processing,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        "retrying" => JobStatus::Retrying,
        other => {
            log::warn!(
                "Unknown job status '{}' for job {}, treating as failed",
                other,
                job_id
            );
            JobStatus::Failed
        }
    }
}

/// What a job works on. Not a foreign key: targets span several tables and
/// each handler checks the kind it expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Document(String),
    /// `<document id>/<page number>`
    Page(String),
    Contract(String),
}

impl EntityRef {
    pub fn page(document_id: &str, page_number: u32) -> Self {
        EntityRef::Page(format!("{}/{}", document_id, page_number))
    }

    pub fn entity_type(&self) -> &'static str {
        match self {
            EntityRef::Document(_) => "document",
            EntityRef::Page(_) => "page",
            EntityRef::Contract(_) => "contract",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            EntityRef::Document(id) | EntityRef::Page(id) | EntityRef::Contract(id) => id,
        }
    }

    pub fn from_parts(entity_type: &str, id: &str) -> Option<Self> {
        match entity_type {
            "document" => Some(EntityRef::Document(id.to_string())),
            "page" => Some(EntityRef::Page(id.to_string())),
            "contract" => Some(EntityRef::Contract(id.to_string())),
            _ => None,
        }
    }

    /// Splits a page key into document id and page number.
    pub fn as_page(&self) -> Option<(&str, u32)> {
        match self {
            EntityRef::Page(key) => {
                let (doc, page) = key.rsplit_once('/')?;
                if doc.is_empty() {
                    return None;
                }
                let page = page.parse::<u32>().ok().filter(|n| *n > 0)?;
                Some((doc, page))
            }
            _ => None,
        }
    }

    /// The document this entity belongs to, if any.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            EntityRef::Document(id) => Some(id),
            EntityRef::Page(_) => self.as_page().map(|(doc, _)| doc),
            EntityRef::Contract(_) => None,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type(), self.id())
    }
}

/// A failure as recorded on the job, stored as `error_detail`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    /// Sanitized; safe to show to any caller.
    pub message: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    /// Whether the queue may schedule another attempt.
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    /// Unsanitized detail, only kept outside production.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl JobFailure {
    /// The message is sanitized; when that changed it, the original is kept
    /// as `detail`.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let raw = message.into();
        let message = sanitize_message(&raw);
        let detail = (message != raw).then_some(raw);
        Self {
            message,
            category,
            severity: category.default_severity(),
            retryable: category.is_job_retryable(),
            dependency: None,
            attempts: None,
            detail,
        }
    }

    pub fn from_classified(error: &ClassifiedError, dependency: &str, attempts: u32) -> Self {
        Self {
            message: error.sanitized.clone(),
            category: error.category,
            severity: error.severity,
            retryable: error.category.is_job_retryable(),
            dependency: Some(dependency.to_string()),
            attempts: Some(attempts),
            detail: Some(error.message.clone()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    /// Drops the unsanitized detail when it must not leave the server.
    pub fn for_environment(mut self, expose_detail: bool) -> Self {
        if !expose_detail {
            self.detail = None;
        }
        self
    }

    /// Re-applies the redaction to `message`, for failures built field by
    /// field rather than through [`JobFailure::new`].
    pub fn sanitized(mut self) -> Self {
        self.message = sanitize_message(&self.message);
        self
    }
}

/// Builder for jobs to enqueue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub entity: EntityRef,
    pub priority: Option<i32>,
    pub max_retries: Option<u32>,
    pub config: serde_json::Value,
    pub prerequisites: Vec<String>,
    pub delay: Option<Duration>,
}

impl NewJob {
    pub fn new(job_type: JobType, entity: EntityRef) -> Self {
        Self {
            job_type,
            entity,
            priority: None,
            max_retries: None,
            config: serde_json::Value::Object(Default::default()),
            prerequisites: Vec::new(),
            delay: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Jobs that must be terminal before this one may be leased.
    pub fn after(mut self, job_ids: impl IntoIterator<Item = String>) -> Self {
        self.prerequisites.extend(job_ids);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i32,
    pub entity: EntityRef,
    pub config: serde_json::Value,
    pub prerequisites: Vec<String>,
    pub progress: u8,
    pub current_step: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub error_detail: Option<JobFailure>,
    pub result: Option<serde_json::Value>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn from_row(row: &JobRow) -> Result<Self, QueueError> {
        let job_type = JobType::parse(&row.job_type).ok_or_else(|| QueueError::CorruptRow {
            job_id: row.id.clone(),
            reason: format!("unknown job type '{}'", row.job_type),
        })?;
        let entity = EntityRef::from_parts(&row.entity_type, &row.entity_id).ok_or_else(|| {
            QueueError::CorruptRow {
                job_id: row.id.clone(),
                reason: format!("unknown entity type '{}'", row.entity_type),
            }
        })?;

        Ok(Self {
            id: row.id.clone(),
            job_type,
            status: parse_status(&row.status, &row.id),
            priority: i32::try_from(row.priority).unwrap_or(i32::MAX),
            entity,
            config: parse_json_column(&row.config, "config", &row.id)
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            prerequisites: parse_json_column(&row.prerequisites, "prerequisites", &row.id)
                .unwrap_or_default(),
            progress: u8::try_from(row.progress.clamp(0, 100)).unwrap_or(0),
            current_step: row.current_step.clone(),
            scheduled_at: parse_timestamp(&row.scheduled_at),
            started_at: parse_optional_timestamp(row.started_at.as_deref()),
            completed_at: parse_optional_timestamp(row.completed_at.as_deref()),
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            max_retries: u32::try_from(row.max_retries).unwrap_or(0),
            error: row.error.clone(),
            error_detail: row
                .error_detail
                .as_deref()
                .and_then(|s| parse_json_column(s, "error_detail", &row.id)),
            result: row
                .result
                .as_deref()
                .and_then(|s| parse_json_column(s, "result", &row.id)),
            lease_owner: row.lease_owner.clone(),
            lease_expires_at: parse_optional_timestamp(row.lease_expires_at.as_deref()),
            cancel_requested: row.cancel_requested,
            archived: row.archived,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        })
    }

    /// True once the retry budget is spent.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    raw: &str,
    column: &str,
    job_id: &str,
) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!(
                "Ignoring unreadable {} column on job {}: {}",
                column,
                job_id,
                e
            );
            None
        }
    }
}

/// What `fail` did with the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Failed {
        retry_count: u32,
    },
}

impl FailOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailOutcome::Failed { .. })
    }
}

/// What `cancel` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was not running and is now CANCELLED.
    Cancelled,
    /// The job is running; its worker will stop at the next safe point.
    Requested,
    /// The job had already reached this terminal status.
    AlreadyFinished(JobStatus),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub retrying: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub archived: u64,
}
