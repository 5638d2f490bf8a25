use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::broadcast::{Notifier, ProgressBroadcaster};
use crate::clock::{format_timestamp, to_chrono, Clock};
use crate::config::schema::QueueSettings;
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::{to_json, Database};

use super::backoff::Backoff;
use super::job::{
    CancelOutcome, EntityRef, FailOutcome, Job, JobFailure, JobStatus, JobType, NewJob,
    QueueStats,
};
use super::QueueError;

/// Page size for walking due candidates in `lease`.
const LEASE_PAGE_SIZE: u32 = 32;

/// Extra admission check consulted by `lease` for one job type.
///
/// Returning `Ok(false)` leaves the job PENDING; it is looked at again on
/// the next lease.
pub trait LeaseGate: Send + Sync {
    fn may_lease(&self, job: &Job) -> Result<bool, QueueError>;
}

pub struct JobQueue {
    db: Database,
    clock: Arc<dyn Clock>,
    broadcaster: ProgressBroadcaster,
    notifier: Notifier,
    default_priority: i32,
    default_max_retries: u32,
    backoff: Backoff,
    lease_timeout: Duration,
    gates: RwLock<HashMap<JobType, Arc<dyn LeaseGate>>>,
}

impl JobQueue {
    pub fn new(
        db: Database,
        clock: Arc<dyn Clock>,
        broadcaster: ProgressBroadcaster,
        notifier: Notifier,
        settings: &QueueSettings,
        lease_timeout: Duration,
    ) -> Self {
        Self {
            db,
            clock,
            broadcaster,
            notifier,
            default_priority: settings.default_priority,
            default_max_retries: settings.default_max_retries,
            backoff: Backoff::from_settings(settings),
            lease_timeout,
            gates: RwLock::new(HashMap::new()),
        }
    }

    pub fn broadcaster(&self) -> &ProgressBroadcaster {
        &self.broadcaster
    }

    pub fn register_gate(&self, job_type: JobType, gate: Arc<dyn LeaseGate>) {
        let mut gates = match self.gates.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("JobQueue gate lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        gates.insert(job_type, gate);
    }

    fn gate_for(&self, job_type: JobType) -> Option<Arc<dyn LeaseGate>> {
        let gates = match self.gates.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        gates.get(&job_type).cloned()
    }

    /// Persists a new PENDING job and returns its id.
    pub fn enqueue(&self, new_job: NewJob) -> Result<String, QueueError> {
        let now = self.clock.now();
        let scheduled_at = match new_job.delay {
            Some(delay) => now + to_chrono(delay),
            None => now,
        };
        let id = uuid::Uuid::new_v4().to_string();
        let row = JobRow {
            id: id.clone(),
            job_type: new_job.job_type.as_str().to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            priority: i64::from(new_job.priority.unwrap_or(self.default_priority)),
            entity_type: new_job.entity.entity_type().to_string(),
            entity_id: new_job.entity.id().to_string(),
            config: to_json("config", &new_job.config)?,
            prerequisites: to_json("prerequisites", &new_job.prerequisites)?,
            progress: 0,
            current_step: None,
            scheduled_at: format_timestamp(scheduled_at),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: i64::from(new_job.max_retries.unwrap_or(self.default_max_retries)),
            error: None,
            error_detail: None,
            result: None,
            lease_owner: None,
            lease_expires_at: None,
            cancel_requested: false,
            archived: false,
            created_at: format_timestamp(now),
            updated_at: format_timestamp(now),
        };
        job_repo::insert(&self.db, &row)?;
        log::debug!(
            "Enqueued {} job {} for {}",
            new_job.job_type,
            id,
            new_job.entity
        );
        self.publish_current(&id)?;
        Ok(id)
    }

    /// Claims the most urgent eligible job of one of `job_types` for
    /// `worker_id`.
    ///
    /// Candidates are ordered by priority (lower first), then scheduled time.
    /// A candidate is skipped while any prerequisite is non-terminal or its
    /// type's [`LeaseGate`] says no; the scan keeps paging past held-back
    /// jobs until it finds one it can claim or runs out of candidates.
    pub fn lease(&self, worker_id: &str, job_types: &[JobType]) -> Result<Option<Job>, QueueError> {
        self.promote_due_retries()?;

        let now = self.clock.now();
        let now_s = format_timestamp(now);
        let expires = format_timestamp(now + to_chrono(self.lease_timeout));
        let types: Vec<&str> = job_types.iter().map(|t| t.as_str()).collect();

        // Skipped jobs stay PENDING, so they keep their place in the order
        // and the offset only needs to cover them.
        let mut skipped: u32 = 0;
        loop {
            let page =
                job_repo::lease_candidates(&self.db, &types, &now_s, LEASE_PAGE_SIZE, skipped)?;
            let exhausted = page.len() < LEASE_PAGE_SIZE as usize;

            for row in page {
                if let Some(job) = self.admit(row)? {
                    if job_repo::claim(&self.db, &job.id, worker_id, &expires, &now_s)? {
                        log::debug!(
                            "Worker {} leased {} job {}",
                            worker_id,
                            job.job_type,
                            job.id
                        );
                        return self.publish_current(&job.id).map(Some);
                    }
                    // Another worker claimed it first and it left the
                    // PENDING set, so it does not count toward the offset.
                    continue;
                }
                skipped += 1;
            }

            if exhausted {
                return Ok(None);
            }
        }
    }

    /// Returns the job if it may be leased now.
    fn admit(&self, row: JobRow) -> Result<Option<Job>, QueueError> {
        let job = match Job::from_row(&row) {
            Ok(job) => job,
            Err(e) => {
                log::warn!("Skipping unreadable job during lease: {}", e);
                return Ok(None);
            }
        };
        if !self.prerequisites_met(&job)? {
            return Ok(None);
        }
        if let Some(gate) = self.gate_for(job.job_type) {
            if !gate.may_lease(&job)? {
                log::debug!("Lease gate held back {} job {}", job.job_type, job.id);
                return Ok(None);
            }
        }
        Ok(Some(job))
    }

    fn prerequisites_met(&self, job: &Job) -> Result<bool, QueueError> {
        if job.prerequisites.is_empty() {
            return Ok(true);
        }
        let statuses = job_repo::statuses(&self.db, &job.prerequisites)?;
        if statuses.len() < job.prerequisites.len() {
            log::warn!(
                "Job {} lists prerequisites that do not exist; ignoring them",
                job.id
            );
        }
        Ok(statuses.iter().all(|(_, status)| {
            matches!(status.as_str(), "completed" | "failed" | "cancelled")
        }))
    }

    /// Pushes the lease deadline out by another lease timeout.
    pub fn extend_lease(&self, job_id: &str, worker_id: &str) -> Result<DateTime<Utc>, QueueError> {
        let now = self.clock.now();
        let expires = now + to_chrono(self.lease_timeout);
        let extended = job_repo::extend_lease(
            &self.db,
            job_id,
            worker_id,
            &format_timestamp(expires),
            &format_timestamp(now),
        )?;
        if !extended {
            return Err(self.not_lease_holder(job_id, worker_id));
        }
        Ok(expires)
    }

    pub fn update_progress(
        &self,
        job_id: &str,
        worker_id: &str,
        percent: u8,
        step: Option<&str>,
    ) -> Result<(), QueueError> {
        let now = format_timestamp(self.clock.now());
        let updated = job_repo::update_progress(
            &self.db,
            job_id,
            worker_id,
            i64::from(percent.min(100)),
            step,
            &now,
        )?;
        if !updated {
            return Err(self.not_lease_holder(job_id, worker_id));
        }
        self.publish_current(job_id)?;
        Ok(())
    }

    pub fn complete(
        &self,
        job_id: &str,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Job, QueueError> {
        let now = format_timestamp(self.clock.now());
        let result = to_json("result", &result)?;
        if !job_repo::complete(&self.db, job_id, worker_id, &result, &now)? {
            return Err(self.outcome_error(job_id, worker_id, JobStatus::Completed));
        }
        log::info!("Job {} completed", job_id);
        self.publish_current(job_id)
    }

    /// Records a failed attempt.
    ///
    /// The retry count goes up by one and never past `max_retries`. A
    /// retryable failure with budget left moves the job to RETRYING with
    /// exponential backoff; anything else is terminal FAILED and raises an
    /// operator notification. The stored and published message is always
    /// sanitized.
    pub fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        failure: JobFailure,
    ) -> Result<FailOutcome, QueueError> {
        let job = self.get(job_id)?;
        if job.status != JobStatus::Processing {
            return Err(QueueError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Failed,
            });
        }
        if job.lease_owner.as_deref() != Some(worker_id) {
            return Err(QueueError::NotLeaseHolder {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        let failure = failure.sanitized();

        let now = self.clock.now();
        let retry_count = job.retry_count.saturating_add(1).min(job.max_retries);
        let detail = to_json("error_detail", &failure)?;

        if failure.retryable && retry_count < job.max_retries {
            let next_attempt_at = now + to_chrono(self.backoff.delay_for(job.retry_count));
            let recorded = job_repo::record_retry(
                &self.db,
                job_id,
                worker_id,
                i64::from(retry_count),
                &failure.message,
                &detail,
                &format_timestamp(next_attempt_at),
                &format_timestamp(now),
            )?;
            if !recorded {
                return Err(self.outcome_error(job_id, worker_id, JobStatus::Retrying));
            }
            log::warn!(
                "Job {} failed ({}), retry {}/{} at {}",
                job_id,
                failure.category,
                retry_count,
                job.max_retries,
                next_attempt_at
            );
            self.publish_current(job_id)?;
            return Ok(FailOutcome::Retrying {
                retry_count,
                next_attempt_at,
            });
        }

        let recorded = job_repo::record_failure(
            &self.db,
            job_id,
            worker_id,
            i64::from(retry_count),
            &failure.message,
            &detail,
            &format_timestamp(now),
        )?;
        if !recorded {
            return Err(self.outcome_error(job_id, worker_id, JobStatus::Failed));
        }
        log::error!(
            "Job {} failed permanently after {} retries: {}",
            job_id,
            retry_count,
            failure.message
        );
        let failed = self.publish_current(job_id)?;
        self.notifier.job_failed(&failed, &failure, now);
        Ok(FailOutcome::Failed { retry_count })
    }

    /// Cancels a queued job, or flags a running one for its worker.
    pub fn cancel(&self, job_id: &str) -> Result<CancelOutcome, QueueError> {
        loop {
            let job = self.get(job_id)?;
            let now = format_timestamp(self.clock.now());
            match job.status {
                status if status.is_terminal() => {
                    return Ok(CancelOutcome::AlreadyFinished(status));
                }
                JobStatus::Pending | JobStatus::Retrying => {
                    if job_repo::cancel_queued(&self.db, job_id, &now)? {
                        log::info!("Job {} cancelled", job_id);
                        self.publish_current(job_id)?;
                        return Ok(CancelOutcome::Cancelled);
                    }
                }
                _ => {
                    if job_repo::request_cancel(&self.db, job_id, &now)? {
                        log::info!("Cancellation requested for running job {}", job_id);
                        self.publish_current(job_id)?;
                        return Ok(CancelOutcome::Requested);
                    }
                }
            }
            // The job moved between the read and the update; look again.
        }
    }

    pub fn is_cancel_requested(&self, job_id: &str) -> Result<bool, QueueError> {
        Ok(job_repo::is_cancel_requested(&self.db, job_id)?)
    }

    /// Called by the worker once it has stopped at a safe point.
    pub fn acknowledge_cancel(&self, job_id: &str, worker_id: &str) -> Result<Job, QueueError> {
        let now = format_timestamp(self.clock.now());
        if !job_repo::mark_cancelled(&self.db, job_id, worker_id, &now)? {
            return Err(self.outcome_error(job_id, worker_id, JobStatus::Cancelled));
        }
        log::info!("Job {} stopped after cancellation", job_id);
        self.publish_current(job_id)
    }

    pub fn find(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        job_repo::find_by_id(&self.db, job_id)?
            .map(|row| Job::from_row(&row))
            .transpose()
    }

    pub fn get(&self, job_id: &str) -> Result<Job, QueueError> {
        self.find(job_id)?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))
    }

    pub fn jobs_for_entity(&self, entity: &EntityRef) -> Result<Vec<Job>, QueueError> {
        job_repo::for_entity(&self.db, entity.entity_type(), entity.id())?
            .iter()
            .map(Job::from_row)
            .collect()
    }

    /// Jobs on any page of the document.
    pub fn page_jobs_for_document(&self, document_id: &str) -> Result<Vec<Job>, QueueError> {
        let prefix = format!("{}/", document_id);
        job_repo::for_entity_prefix(&self.db, "page", &prefix)?
            .iter()
            .map(Job::from_row)
            .collect()
    }

    pub fn query(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64), QueueError> {
        let (rows, total) = job_repo::query(&self.db, filter)?;
        let jobs = rows.iter().map(Job::from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total))
    }

    /// Returns jobs whose worker stopped renewing its lease to PENDING.
    /// The retry count is not touched.
    pub fn reap_expired_leases(&self) -> Result<Vec<String>, QueueError> {
        let now = format_timestamp(self.clock.now());
        let mut released = Vec::new();
        for row in job_repo::expired_leases(&self.db, &now)? {
            if job_repo::release_expired(&self.db, &row.id, &now)? {
                log::warn!(
                    "Lease on job {} held by {} expired, returning it to the queue",
                    row.id,
                    row.lease_owner.as_deref().unwrap_or("?")
                );
                self.publish_current(&row.id)?;
                released.push(row.id);
            }
        }
        Ok(released)
    }

    /// Moves RETRYING jobs whose backoff has elapsed to PENDING.
    pub fn promote_due_retries(&self) -> Result<Vec<String>, QueueError> {
        let now = format_timestamp(self.clock.now());
        let promoted = job_repo::promote_due_retries(&self.db, &now)?;
        for id in &promoted {
            self.publish_current(id)?;
        }
        Ok(promoted)
    }

    /// Archives terminal jobs that finished more than `older_than` ago.
    /// Jobs are never deleted.
    pub fn archive_finished(&self, older_than: Duration) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let before = format_timestamp(now - to_chrono(older_than));
        let archived = job_repo::archive_finished(&self.db, &before, &format_timestamp(now))?;
        if archived > 0 {
            log::info!("Archived {} finished jobs", archived);
        }
        Ok(archived)
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let (counts, archived) = job_repo::count_by_status(&self.db)?;
        let mut stats = QueueStats {
            archived,
            ..Default::default()
        };
        for (status, count) in counts {
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "retrying" => stats.retrying = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "cancelled" => stats.cancelled = count,
                other => log::warn!("Ignoring unknown job status '{}' in stats", other),
            }
        }
        Ok(stats)
    }

    fn publish_current(&self, job_id: &str) -> Result<Job, QueueError> {
        let job = self.get(job_id)?;
        self.broadcaster.publish_job(&job);
        Ok(job)
    }

    /// Explains why a worker's outcome update matched no row: the lease
    /// moved to someone else, or the job is not in a state to take it.
    fn outcome_error(&self, job_id: &str, worker_id: &str, to: JobStatus) -> QueueError {
        match self.find(job_id) {
            Ok(Some(job))
                if job.status == JobStatus::Processing
                    && job.lease_owner.as_deref() != Some(worker_id) =>
            {
                QueueError::NotLeaseHolder {
                    job_id: job_id.to_string(),
                    worker_id: worker_id.to_string(),
                }
            }
            Ok(Some(job)) => QueueError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to,
            },
            Ok(None) => QueueError::NotFound(job_id.to_string()),
            Err(e) => e,
        }
    }

    fn not_lease_holder(&self, job_id: &str, worker_id: &str) -> QueueError {
        match self.find(job_id) {
            Ok(Some(_)) => QueueError::NotLeaseHolder {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            },
            Ok(None) => QueueError::NotFound(job_id.to_string()),
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{StatusEvent, StatusFilter};
    use crate::clock::ManualClock;
    use crate::resilience::ErrorCategory;

    struct Fixture {
        queue: JobQueue,
        clock: Arc<ManualClock>,
        notifier: Notifier,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::default());
        let broadcaster = ProgressBroadcaster::new(db.clone(), 256);
        let notifier = Notifier::default();
        let queue = JobQueue::new(
            db,
            clock.clone(),
            broadcaster,
            notifier.clone(),
            &QueueSettings::default(),
            Duration::from_secs(60),
        );
        Fixture {
            queue,
            clock,
            notifier,
        }
    }

    fn doc_job(job_type: JobType, doc: &str) -> NewJob {
        NewJob::new(job_type, EntityRef::Document(doc.to_string()))
    }

    #[test]
    fn test_lease_orders_by_priority_then_schedule() {
        let f = fixture();
        let low = f.queue.enqueue(doc_job(JobType::Ocr, "d1").priority(80)).unwrap();
        f.clock.advance(Duration::from_millis(5));
        let urgent_late = f.queue.enqueue(doc_job(JobType::Ocr, "d2").priority(10)).unwrap();
        f.clock.advance(Duration::from_millis(5));
        let urgent_later = f.queue.enqueue(doc_job(JobType::Ocr, "d3").priority(10)).unwrap();

        let order: Vec<String> = (0..3)
            .map(|_| f.queue.lease("w1", &[JobType::Ocr]).unwrap().unwrap().id)
            .collect();
        assert_eq!(order, vec![urgent_late, urgent_later, low]);
        assert!(f.queue.lease("w1", &[JobType::Ocr]).unwrap().is_none());
    }

    #[test]
    fn test_lease_respects_types_and_delay() {
        let f = fixture();
        f.queue
            .enqueue(doc_job(JobType::Ocr, "d1").delay(Duration::from_secs(30)))
            .unwrap();
        assert!(f.queue.lease("w1", &[JobType::TextExtraction]).unwrap().is_none());
        assert!(f.queue.lease("w1", &[JobType::Ocr]).unwrap().is_none());
        f.clock.advance(Duration::from_secs(31));
        let job = f.queue.lease("w1", &[JobType::Ocr]).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.lease_owner.as_deref(), Some("w1"));
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_retry_then_terminal_failure() {
        let f = fixture();
        let mut notes = f.notifier.subscribe();
        let id = f.queue.enqueue(doc_job(JobType::PageAnalysis, "d1")).unwrap();

        for expected in 1..=2u32 {
            let job = f.queue.lease("w1", &[JobType::PageAnalysis]).unwrap().unwrap();
            let outcome = f
                .queue
                .fail(&job.id, "w1", JobFailure::new(ErrorCategory::Database, "database is locked"))
                .unwrap();
            assert!(matches!(outcome, FailOutcome::Retrying { retry_count, .. } if retry_count == expected));
            assert_eq!(f.queue.get(&id).unwrap().status, JobStatus::Retrying);
            // Not leasable until the backoff elapses.
            assert!(f.queue.lease("w1", &[JobType::PageAnalysis]).unwrap().is_none());
            f.clock.advance(Duration::from_secs(600));
        }

        let job = f.queue.lease("w1", &[JobType::PageAnalysis]).unwrap().unwrap();
        let outcome = f
            .queue
            .fail(&job.id, "w1", JobFailure::new(ErrorCategory::Database, "database is locked"))
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed { retry_count: 3 });

        let job = f.queue.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert!(job.error_detail.is_some());

        f.clock.advance(Duration::from_secs(3600));
        assert!(f.queue.lease("w1", &[JobType::PageAnalysis]).unwrap().is_none());
        assert!(notes.try_recv().is_ok());
    }

    #[test]
    fn test_validation_failure_is_terminal_immediately() {
        let f = fixture();
        let id = f.queue.enqueue(doc_job(JobType::Ocr, "d1")).unwrap();
        f.queue.lease("w1", &[JobType::Ocr]).unwrap().unwrap();
        let outcome = f
            .queue
            .fail(&id, "w1", JobFailure::new(ErrorCategory::Validation, "malformed page"))
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed { retry_count: 1 });
    }

    #[test]
    fn test_backoff_grows_with_retry_count() {
        let f = fixture();
        let id = f.queue.enqueue(doc_job(JobType::Ocr, "d1")).unwrap();
        let start = f.clock.now();
        f.queue.lease("w1", &[JobType::Ocr]).unwrap();
        let first = f
            .queue
            .fail(&id, "w1", JobFailure::new(ErrorCategory::Network, "connection reset"))
            .unwrap();
        let FailOutcome::Retrying { next_attempt_at, .. } = first else {
            panic!("expected retry");
        };
        assert_eq!(next_attempt_at - start, chrono::Duration::seconds(1));

        f.clock.advance(Duration::from_secs(1));
        f.queue.lease("w1", &[JobType::Ocr]).unwrap().unwrap();
        let second = f
            .queue
            .fail(&id, "w1", JobFailure::new(ErrorCategory::Network, "connection reset"))
            .unwrap();
        let FailOutcome::Retrying { next_attempt_at, .. } = second else {
            panic!("expected retry");
        };
        assert_eq!(next_attempt_at - f.clock.now(), chrono::Duration::seconds(2));
    }

    #[test]
    fn test_cancel_queued_and_running() {
        let f = fixture();
        let queued = f.queue.enqueue(doc_job(JobType::Ocr, "d1")).unwrap();
        assert_eq!(f.queue.cancel(&queued).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            f.queue.cancel(&queued).unwrap(),
            CancelOutcome::AlreadyFinished(JobStatus::Cancelled)
        );

        let running = f.queue.enqueue(doc_job(JobType::Ocr, "d2")).unwrap();
        f.queue.lease("w1", &[JobType::Ocr]).unwrap().unwrap();
        assert_eq!(f.queue.cancel(&running).unwrap(), CancelOutcome::Requested);
        assert!(f.queue.is_cancel_requested(&running).unwrap());
        assert_eq!(f.queue.get(&running).unwrap().status, JobStatus::Processing);

        let job = f.queue.acknowledge_cancel(&running, "w1").unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_complete_requires_processing() {
        let f = fixture();
        let id = f.queue.enqueue(doc_job(JobType::Ocr, "d1")).unwrap();
        let err = f.queue.complete(&id, "w1", serde_json::json!({})).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition { from: JobStatus::Pending, to: JobStatus::Completed, .. }
        ));
        assert!(matches!(
            f.queue.complete("missing", "w1", serde_json::json!({})),
            Err(QueueError::NotFound(_))
        ));
    }

    #[test]
    fn test_prerequisites_hold_back_lease() {
        let f = fixture();
        let first = f.queue.enqueue(doc_job(JobType::TextExtraction, "d1")).unwrap();
        let second = f
            .queue
            .enqueue(doc_job(JobType::DocumentMerge, "d1").after([first.clone()]))
            .unwrap();

        assert!(f.queue.lease("w1", &[JobType::DocumentMerge]).unwrap().is_none());

        f.queue.lease("w1", &[JobType::TextExtraction]).unwrap().unwrap();
        f.queue.complete(&first, "w1", serde_json::json!({"pages": 1})).unwrap();

        let leased = f.queue.lease("w1", &[JobType::DocumentMerge]).unwrap().unwrap();
        assert_eq!(leased.id, second);
    }

    struct Closed;
    impl LeaseGate for Closed {
        fn may_lease(&self, _job: &Job) -> Result<bool, QueueError> {
            Ok(false)
        }
    }

    #[test]
    fn test_gate_holds_back_lease() {
        let f = fixture();
        f.queue.register_gate(JobType::DocumentMerge, Arc::new(Closed));
        f.queue.enqueue(doc_job(JobType::DocumentMerge, "d1")).unwrap();
        assert!(f.queue.lease("w1", &[JobType::DocumentMerge]).unwrap().is_none());
        assert_eq!(f.queue.stats().unwrap().pending, 1);
    }

    #[test]
    fn test_held_back_jobs_do_not_hide_eligible_ones() {
        let f = fixture();
        f.queue.register_gate(JobType::DocumentMerge, Arc::new(Closed));
        for i in 0..(LEASE_PAGE_SIZE * 2 + 5) {
            f.queue
                .enqueue(doc_job(JobType::DocumentMerge, &format!("m{}", i)).priority(60))
                .unwrap();
        }
        let rules = f
            .queue
            .enqueue(doc_job(JobType::RuleExtraction, "d1").priority(70))
            .unwrap();

        let leased = f
            .queue
            .lease("w1", &[JobType::DocumentMerge, JobType::RuleExtraction])
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, rules);
        assert_eq!(f.queue.stats().unwrap().pending, u64::from(LEASE_PAGE_SIZE * 2 + 5));
    }

    #[test]
    fn test_outcome_rejected_after_lease_moves() {
        let f = fixture();
        let id = f.queue.enqueue(doc_job(JobType::Ocr, "d1")).unwrap();
        f.queue.lease("w1", &[JobType::Ocr]).unwrap().unwrap();

        f.clock.advance(Duration::from_secs(61));
        assert_eq!(f.queue.reap_expired_leases().unwrap(), vec![id.clone()]);
        f.queue.lease("w2", &[JobType::Ocr]).unwrap().unwrap();

        assert!(matches!(
            f.queue.complete(&id, "w1", serde_json::json!({})),
            Err(QueueError::NotLeaseHolder { .. })
        ));
        assert!(matches!(
            f.queue.fail(&id, "w1", JobFailure::new(ErrorCategory::Network, "late")),
            Err(QueueError::NotLeaseHolder { .. })
        ));
        f.queue.cancel(&id).unwrap();
        assert!(matches!(
            f.queue.acknowledge_cancel(&id, "w1"),
            Err(QueueError::NotLeaseHolder { .. })
        ));

        let job = f.queue.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.lease_owner.as_deref(), Some("w2"));
        assert_eq!(job.retry_count, 0);

        f.queue.complete(&id, "w2", serde_json::json!({"ok": true})).unwrap();
        assert_eq!(f.queue.get(&id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_failure_message_is_sanitized_when_published() {
        let f = fixture();
        let id = f.queue.enqueue(doc_job(JobType::Ocr, "d1")).unwrap();
        f.queue.lease("w1", &[JobType::Ocr]).unwrap().unwrap();
        let mut sub = f.queue.broadcaster().subscribe(StatusFilter::Job(id.clone()));

        let mut failure = JobFailure::new(ErrorCategory::Validation, "rejected");
        failure.message = "owner jane@corp.example password=hunter2".to_string();
        f.queue.fail(&id, "w1", failure).unwrap();

        let expected = "owner [EMAIL] password=[REDACTED]";
        let events = sub.drain();
        let StatusEvent::Job(snapshot) = events.last().unwrap() else {
            panic!("expected job event");
        };
        assert_eq!(snapshot.error.as_deref(), Some(expected));
        let job = f.queue.get(&id).unwrap();
        assert_eq!(job.error.as_deref(), Some(expected));
        assert_eq!(job.error_detail.unwrap().message, expected);
    }

    #[test]
    fn test_lease_heartbeat_and_reaping() {
        let f = fixture();
        let id = f.queue.enqueue(doc_job(JobType::Ocr, "d1")).unwrap();
        f.queue.lease("w1", &[JobType::Ocr]).unwrap().unwrap();

        assert!(matches!(
            f.queue.extend_lease(&id, "w2"),
            Err(QueueError::NotLeaseHolder { .. })
        ));
        f.clock.advance(Duration::from_secs(50));
        f.queue.extend_lease(&id, "w1").unwrap();
        f.clock.advance(Duration::from_secs(50));
        assert!(f.queue.reap_expired_leases().unwrap().is_empty());

        f.clock.advance(Duration::from_secs(20));
        assert_eq!(f.queue.reap_expired_leases().unwrap(), vec![id.clone()]);
        let job = f.queue.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.lease_owner.is_none());
    }

    #[test]
    fn test_progress_is_published() {
        let f = fixture();
        let id = f.queue.enqueue(doc_job(JobType::Ocr, "d1")).unwrap();
        f.queue.lease("w1", &[JobType::Ocr]).unwrap().unwrap();
        let mut sub = f.queue.broadcaster().subscribe(StatusFilter::Job(id.clone()));

        f.queue.update_progress(&id, "w1", 40, Some("page 2 of 5")).unwrap();
        let events = sub.drain();
        assert_eq!(events.len(), 1);
        let StatusEvent::Job(snapshot) = &events[0] else {
            panic!("expected job event");
        };
        assert_eq!(snapshot.progress, 40);
        assert_eq!(snapshot.current_step.as_deref(), Some("page 2 of 5"));
        assert_eq!(snapshot, &f.queue.broadcaster().query_status(&id).unwrap());
    }

    #[test]
    fn test_archive_and_stats() {
        let f = fixture();
        let done = f.queue.enqueue(doc_job(JobType::Ocr, "d1")).unwrap();
        f.queue.enqueue(doc_job(JobType::Ocr, "d2").delay(Duration::from_secs(3600))).unwrap();
        f.queue.lease("w1", &[JobType::Ocr]).unwrap().unwrap();
        f.queue.complete(&done, "w1", serde_json::json!({})).unwrap();

        assert_eq!(f.queue.archive_finished(Duration::from_secs(60)).unwrap(), 0);
        f.clock.advance(Duration::from_secs(120));
        assert_eq!(f.queue.archive_finished(Duration::from_secs(60)).unwrap(), 1);

        let stats = f.queue.stats().unwrap();
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 0);
        // Archived, not deleted.
        assert_eq!(f.queue.get(&done).unwrap().status, JobStatus::Completed);
    }
}
