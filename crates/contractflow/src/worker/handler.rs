use std::collections::HashMap;
use std::sync::Arc;

use crate::error::UploadError;
use crate::pipeline::PipelineError;
use crate::queue::{FailOutcome, Job, JobFailure, JobType, QueueError};
use crate::resilience::{ErrorCategory, ResilienceError};

use super::context::JobContext;

/// Why a handler stopped without a result.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// Stopped at a safe point after a cancel request.
    Cancelled,
    Failed(JobFailure),
}

impl HandlerError {
    pub fn validation(message: impl Into<String>) -> Self {
        HandlerError::Failed(JobFailure::new(ErrorCategory::Validation, message))
    }
}

impl From<ResilienceError> for HandlerError {
    fn from(e: ResilienceError) -> Self {
        match e {
            ResilienceError::Cancelled { .. } => HandlerError::Cancelled,
            // An open breaker is an immediate failed attempt; the job can
            // try again once the cool-down has passed.
            ResilienceError::CircuitOpen { dependency } => HandlerError::Failed(
                JobFailure::new(
                    ErrorCategory::Network,
                    format!("{} is temporarily unavailable", dependency),
                )
                .with_dependency(dependency),
            ),
            ResilienceError::Failed {
                dependency,
                error,
                attempts,
            } => HandlerError::Failed(JobFailure::from_classified(&error, &dependency, attempts)),
        }
    }
}

impl From<PipelineError> for HandlerError {
    fn from(e: PipelineError) -> Self {
        let category = match &e {
            PipelineError::Database(_) | PipelineError::Queue(QueueError::Database(_)) => {
                ErrorCategory::Database
            }
            PipelineError::DocumentNotFound(_)
            | PipelineError::PageNotFound { .. }
            | PipelineError::InvalidTransition { .. }
            | PipelineError::UploadIncomplete(_)
            | PipelineError::Validation(_)
            | PipelineError::RetriesExhausted { .. } => ErrorCategory::Validation,
            _ => ErrorCategory::Unknown,
        };
        HandlerError::Failed(JobFailure::new(category, e.to_string()))
    }
}

impl From<QueueError> for HandlerError {
    fn from(e: QueueError) -> Self {
        PipelineError::Queue(e).into()
    }
}

impl From<UploadError> for HandlerError {
    fn from(e: UploadError) -> Self {
        let category = match &e {
            UploadError::Integrity { .. } | UploadError::SizeMismatch { .. } => {
                ErrorCategory::Integrity
            }
            UploadError::Database(_) => ErrorCategory::Database,
            UploadError::Storage { .. } => ErrorCategory::Unknown,
            _ => ErrorCategory::Validation,
        };
        HandlerError::Failed(JobFailure::new(category, e.to_string()).with_dependency("storage"))
    }
}

/// Executes one job type.
///
/// `handle` runs on a worker thread holding the job's lease. The hooks run
/// after the queue has recorded the outcome and let a handler settle the
/// document or page the job was working on.
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    fn handle(&self, ctx: &JobContext) -> Result<serde_json::Value, HandlerError>;

    fn on_failed(&self, _job: &Job, _failure: &JobFailure, _outcome: &FailOutcome) {}

    fn on_cancelled(&self, _job: &Job) {}
}

/// Job handlers keyed by the job type they execute.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any earlier one for the same type.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type();
        if self.handlers.insert(job_type, handler).is_some() {
            log::debug!("Replaced handler for {}", job_type);
        }
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    /// The job types this registry can execute, in a stable order.
    pub fn job_types(&self) -> Vec<JobType> {
        JobType::ALL
            .iter()
            .copied()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{ClassifiedError, Severity};

    #[test]
    fn test_circuit_open_is_retryable_network_failure() {
        let err: HandlerError = ResilienceError::CircuitOpen {
            dependency: "ocr-provider".to_string(),
        }
        .into();
        match err {
            HandlerError::Failed(f) => {
                assert_eq!(f.category, ErrorCategory::Network);
                assert!(f.retryable);
                assert_eq!(f.dependency.as_deref(), Some("ocr-provider"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failed_call_keeps_sanitized_message() {
        let error = ClassifiedError {
            category: ErrorCategory::Database,
            severity: Severity::High,
            recoverable: true,
            message: "connect to db as bob@example.com failed".to_string(),
            sanitized: "connect to db as [EMAIL] failed".to_string(),
            signature: "database:x".to_string(),
        };
        let err: HandlerError = ResilienceError::Failed {
            dependency: "ocr-provider".to_string(),
            error,
            attempts: 3,
        }
        .into();
        let HandlerError::Failed(f) = err else {
            panic!("expected failure");
        };
        assert_eq!(f.message, "connect to db as [EMAIL] failed");
        assert_eq!(f.attempts, Some(3));
        assert!(f.detail.unwrap().contains("bob@example.com"));
    }

    #[test]
    fn test_pipeline_errors_map_to_categories() {
        let HandlerError::Failed(f) =
            HandlerError::from(PipelineError::DocumentNotFound("d1".to_string()))
        else {
            panic!("expected failure");
        };
        assert_eq!(f.category, ErrorCategory::Validation);
        assert!(!f.retryable);
    }

    struct Noop(JobType);

    impl JobHandler for Noop {
        fn job_type(&self) -> JobType {
            self.0
        }

        fn handle(&self, _ctx: &JobContext) -> Result<serde_json::Value, HandlerError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_registry_lists_types_in_order() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Noop(JobType::PageAnalysis)));
        registry.register(Arc::new(Noop(JobType::TextExtraction)));
        assert_eq!(
            registry.job_types(),
            vec![JobType::TextExtraction, JobType::PageAnalysis]
        );
        assert!(registry.get(JobType::DocumentMerge).is_none());
    }
}
