use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::queue::{FailOutcome, Job, JobFailure, JobQueue, JobType, QueueError};
use crate::resilience::ErrorCategory;

use super::context::JobContext;
use super::handler::{HandlerError, HandlerRegistry};

/// How one execution of a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Retrying {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Failed {
        retry_count: u32,
    },
    Cancelled,
    /// The outcome could not be recorded; the lease reaper will pick the
    /// job up again.
    Unrecorded(String),
}

impl From<FailOutcome> for RunOutcome {
    fn from(outcome: FailOutcome) -> Self {
        match outcome {
            FailOutcome::Retrying {
                retry_count,
                next_attempt_at,
            } => RunOutcome::Retrying {
                retry_count,
                next_attempt_at,
            },
            FailOutcome::Failed { retry_count } => RunOutcome::Failed { retry_count },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    pub job_id: String,
    pub job_type: JobType,
    pub worker_id: String,
    pub outcome: RunOutcome,
}

/// Leases jobs for the registered handlers and records what they return.
pub struct Executor {
    queue: Arc<JobQueue>,
    registry: HandlerRegistry,
    job_types: Vec<JobType>,
    expose_error_detail: bool,
}

impl Executor {
    pub fn new(queue: Arc<JobQueue>, registry: HandlerRegistry, expose_error_detail: bool) -> Self {
        let job_types = registry.job_types();
        Self {
            queue,
            registry,
            job_types,
            expose_error_detail,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn job_types(&self) -> &[JobType] {
        &self.job_types
    }

    /// Leases and runs the next eligible job, if any.
    pub fn run_next(&self, worker_id: &str) -> Result<Option<JobRun>, QueueError> {
        match self.queue.lease(worker_id, &self.job_types)? {
            Some(job) => Ok(Some(self.execute(job, worker_id))),
            None => Ok(None),
        }
    }

    /// Runs jobs until none is eligible right now. Retries scheduled in the
    /// future are left for later.
    pub fn drain(&self, worker_id: &str) -> Result<Vec<JobRun>, QueueError> {
        let mut runs = Vec::new();
        while let Some(run) = self.run_next(worker_id)? {
            runs.push(run);
        }
        Ok(runs)
    }

    /// Runs a job this worker has leased and records the outcome.
    pub fn execute(&self, job: Job, worker_id: &str) -> JobRun {
        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            job_type = %job.job_type,
            worker = worker_id
        );
        let _enter = span.enter();

        let outcome = match self.registry.get(job.job_type) {
            Some(handler) => {
                let ctx = JobContext::new(job.clone(), worker_id, Arc::clone(&self.queue));
                let result = if ctx.is_cancelled() {
                    Err(HandlerError::Cancelled)
                } else {
                    catch_unwind(AssertUnwindSafe(|| handler.handle(&ctx))).unwrap_or_else(|_| {
                        log::error!("Handler for job {} panicked", job.id);
                        Err(HandlerError::Failed(JobFailure::new(
                            ErrorCategory::Unknown,
                            "job handler panicked",
                        )))
                    })
                };

                match result {
                    Ok(value) => self.record_completion(&job, worker_id, value),
                    Err(HandlerError::Cancelled) => match self.queue.acknowledge_cancel(&job.id, worker_id) {
                        Ok(cancelled) => {
                            handler.on_cancelled(&cancelled);
                            RunOutcome::Cancelled
                        }
                        Err(e) => unrecorded(&job, e),
                    },
                    Err(HandlerError::Failed(failure)) => {
                        let failure = failure.for_environment(self.expose_error_detail).sanitized();
                        match self.queue.fail(&job.id, worker_id, failure.clone()) {
                            Ok(outcome) => {
                                handler.on_failed(&job, &failure, &outcome);
                                outcome.into()
                            }
                            Err(e) => unrecorded(&job, e),
                        }
                    }
                }
            }
            None => {
                let failure = JobFailure::new(
                    ErrorCategory::Validation,
                    format!("no handler registered for {}", job.job_type),
                );
                match self.queue.fail(&job.id, worker_id, failure) {
                    Ok(outcome) => outcome.into(),
                    Err(e) => unrecorded(&job, e),
                }
            }
        };

        JobRun {
            job_id: job.id,
            job_type: job.job_type,
            worker_id: worker_id.to_string(),
            outcome,
        }
    }

    fn record_completion(&self, job: &Job, worker_id: &str, value: serde_json::Value) -> RunOutcome {
        match self.queue.complete(&job.id, worker_id, value) {
            Ok(_) => RunOutcome::Completed,
            Err(e) => unrecorded(job, e),
        }
    }
}

fn unrecorded(job: &Job, e: QueueError) -> RunOutcome {
    log::error!("Could not record outcome of job {}: {}", job.id, e);
    RunOutcome::Unrecorded(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Notifier, ProgressBroadcaster};
    use crate::clock::ManualClock;
    use crate::config::schema::QueueSettings;
    use crate::db::Database;
    use crate::queue::{EntityRef, JobStatus, NewJob};
    use crate::worker::handler::JobHandler;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Scripted {
        calls: AtomicU32,
        fail_first: u32,
        category: ErrorCategory,
        message: &'static str,
    }

    impl JobHandler for Scripted {
        fn job_type(&self) -> JobType {
            JobType::ContentIndexing
        }

        fn handle(&self, _ctx: &JobContext) -> Result<serde_json::Value, HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(HandlerError::Failed(JobFailure::new(self.category, self.message)));
            }
            Ok(serde_json::json!({ "calls": n }))
        }
    }

    fn executor(handler: Scripted) -> (Executor, Arc<JobQueue>, Arc<ManualClock>) {
        let db = Database::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::default());
        let queue = Arc::new(JobQueue::new(
            db.clone(),
            clock.clone(),
            ProgressBroadcaster::new(db, 64),
            Notifier::default(),
            &QueueSettings::default(),
            Duration::from_secs(60),
        ));
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(handler));
        (Executor::new(Arc::clone(&queue), registry, false), queue, clock)
    }

    fn enqueue(queue: &JobQueue) -> String {
        queue
            .enqueue(NewJob::new(
                JobType::ContentIndexing,
                EntityRef::Document("d1".to_string()),
            ))
            .unwrap()
    }

    #[test]
    fn test_success_is_recorded() {
        let (executor, queue, _) = executor(Scripted {
            calls: AtomicU32::new(0),
            fail_first: 0,
            category: ErrorCategory::Network,
            message: "boom",
        });
        let id = enqueue(&queue);
        let runs = executor.drain("w1").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Completed);
        let job = queue.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap()["calls"], 1);
    }

    #[test]
    fn test_retry_then_success() {
        let (executor, queue, clock) = executor(Scripted {
            calls: AtomicU32::new(0),
            fail_first: 1,
            category: ErrorCategory::Network,
            message: "boom",
        });
        let id = enqueue(&queue);
        let runs = executor.drain("w1").unwrap();
        assert!(matches!(runs[0].outcome, RunOutcome::Retrying { retry_count: 1, .. }));
        // Backoff keeps the job out of reach until it is due.
        assert!(executor.drain("w1").unwrap().is_empty());

        clock.advance(Duration::from_secs(5));
        let runs = executor.drain("w1").unwrap();
        assert_eq!(runs[0].outcome, RunOutcome::Completed);
        assert_eq!(queue.get(&id).unwrap().retry_count, 1);
    }

    #[test]
    fn test_detail_dropped_in_production() {
        let (executor, queue, _) = executor(Scripted {
            calls: AtomicU32::new(0),
            fail_first: 1,
            category: ErrorCategory::Validation,
            message: "boom",
        });
        let id = enqueue(&queue);
        let runs = executor.drain("w1").unwrap();
        assert_eq!(runs[0].outcome, RunOutcome::Failed { retry_count: 1 });
        let job = queue.get(&id).unwrap();
        assert!(job.error_detail.unwrap().detail.is_none());
    }

    #[test]
    fn test_handler_message_is_redacted() {
        let (executor, queue, _) = executor(Scripted {
            calls: AtomicU32::new(0),
            fail_first: 1,
            category: ErrorCategory::Validation,
            message: "owner jane@corp.example password=hunter2",
        });
        let id = enqueue(&queue);
        executor.drain("w1").unwrap();

        let job = queue.get(&id).unwrap();
        assert_eq!(
            job.error.as_deref(),
            Some("owner [EMAIL] password=[REDACTED]")
        );
        // Production drops the raw text as well.
        assert!(job.error_detail.unwrap().detail.is_none());
    }

    #[test]
    fn test_cancel_before_start() {
        let (executor, queue, _) = executor(Scripted {
            calls: AtomicU32::new(0),
            fail_first: 0,
            category: ErrorCategory::Network,
            message: "boom",
        });
        let id = enqueue(&queue);
        let job = queue.lease("w1", &[JobType::ContentIndexing]).unwrap().unwrap();
        queue.cancel(&id).unwrap();
        let run = executor.execute(job, "w1");
        assert_eq!(run.outcome, RunOutcome::Cancelled);
        assert_eq!(queue.get(&id).unwrap().status, JobStatus::Cancelled);
    }
}
