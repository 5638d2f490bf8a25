//! What a handler gets to see while running one job.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::queue::{Job, JobQueue};

type CancelProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Cooperative cancellation flag.
///
/// Handlers poll it at safe points: between pages, between retry attempts.
/// An optional probe is consulted too, so a flag set on the job record by
/// another process is picked up. Once seen, cancellation sticks.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    probe: Option<CancelProbe>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe(probe: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            probe: Some(Arc::new(probe)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::Acquire) {
            return true;
        }
        if let Some(probe) = &self.probe {
            if probe() {
                self.cancel();
                return true;
            }
        }
        false
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.flag.load(Ordering::Acquire))
            .field("has_probe", &self.probe.is_some())
            .finish()
    }
}

pub struct JobContext {
    pub job: Job,
    pub worker_id: String,
    pub cancel: CancellationToken,
    queue: Arc<JobQueue>,
}

impl JobContext {
    /// Builds a context whose token also watches the job's cancel flag.
    pub fn new(job: Job, worker_id: impl Into<String>, queue: Arc<JobQueue>) -> Self {
        let probe_queue = Arc::clone(&queue);
        let job_id = job.id.clone();
        let cancel = CancellationToken::with_probe(move || {
            probe_queue.is_cancel_requested(&job_id).unwrap_or_else(|e| {
                log::warn!("Could not read cancel flag for job {}: {}", job_id, e);
                false
            })
        });
        Self {
            job,
            worker_id: worker_id.into(),
            cancel,
            queue,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reports progress and renews the lease. Failures are logged; losing a
    /// progress update never fails the job.
    pub fn report_progress(&self, percent: u8, step: &str) {
        if let Err(e) = self
            .queue
            .update_progress(&self.job.id, &self.worker_id, percent, Some(step))
        {
            log::warn!("Progress update for job {} dropped: {}", self.job.id, e);
            return;
        }
        if let Err(e) = self.queue.extend_lease(&self.job.id, &self.worker_id) {
            log::warn!("Lease renewal for job {} failed: {}", self.job.id, e);
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_token_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_probe_result_sticks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let token = CancellationToken::with_probe(move || {
            seen.fetch_add(1, Ordering::SeqCst) >= 1
        });
        assert!(!token.is_cancelled());
        assert!(token.is_cancelled());
        assert!(token.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
