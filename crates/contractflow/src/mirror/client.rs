use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::broadcast::{JobSnapshot, ProgressBroadcaster, StatusEvent};
use crate::clock::{to_chrono, Clock};
use crate::queue::{JobStatus, QueueError};

use super::store::{MirrorFile, MirrorState, MirroredJob};

/// Where the mirror polls job status on reconnect.
pub trait StatusSource {
    fn query_status(&self, job_id: &str) -> Result<JobSnapshot, QueueError>;
}

impl StatusSource for ProgressBroadcaster {
    fn query_status(&self, job_id: &str) -> Result<JobSnapshot, QueueError> {
        ProgressBroadcaster::query_status(self, job_id)
    }
}

pub type CompletionCallback = Box<dyn FnOnce(&JobSnapshot) + Send>;

/// Result of a reconnect reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Jobs whose status was re-read.
    pub refreshed: Vec<String>,
    /// Jobs the server no longer knows; dropped from the mirror.
    pub missing: Vec<String>,
    /// Jobs that could not be read this time and keep their old status.
    pub unreachable: Vec<String>,
}

/// Client-side view of active jobs.
///
/// Push events and poll results go through the same idempotent merge. A
/// completion callback fires at most once per job, on the first COMPLETED
/// snapshot carrying a result, whichever path delivers it. Terminal jobs stay
/// visible for a grace period and are then pruned.
pub struct ClientJobMirror {
    state: Mutex<MirrorState>,
    callbacks: Mutex<HashMap<String, CompletionCallback>>,
    file: Option<MirrorFile>,
    clock: Arc<dyn Clock>,
    grace_period: Duration,
}

impl ClientJobMirror {
    /// A mirror that only lives in memory.
    pub fn new(clock: Arc<dyn Clock>, grace_period: Duration) -> Self {
        Self {
            state: Mutex::new(MirrorState::default()),
            callbacks: Mutex::new(HashMap::new()),
            file: None,
            clock,
            grace_period,
        }
    }

    /// A mirror restored from, and saved to, `file`. An unreadable file is
    /// logged and replaced.
    pub fn persistent(clock: Arc<dyn Clock>, grace_period: Duration, file: MirrorFile) -> Self {
        let state = file.load().unwrap_or_else(|e| {
            log::warn!(
                "Discarding unreadable mirror state at {}: {}",
                file.path().display(),
                e
            );
            MirrorState::default()
        });
        Self {
            state: Mutex::new(state),
            callbacks: Mutex::new(HashMap::new()),
            file: Some(file),
            clock,
            grace_period,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MirrorState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Mirror state lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, HashMap<String, CompletionCallback>> {
        match self.callbacks.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Mirror callback lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn persist(&self, state: &MirrorState) {
        if let Some(file) = &self.file {
            if let Err(e) = file.save(state) {
                log::error!("Failed to persist mirror state: {}", e);
            }
        }
    }

    /// Starts tracking a job from its first known snapshot.
    pub fn track(&self, snapshot: JobSnapshot) {
        self.apply(&snapshot);
    }

    /// Starts tracking a job and registers its completion callback. If the
    /// mirror already holds a completed result the callback fires now.
    pub fn track_with_callback(&self, snapshot: JobSnapshot, callback: CompletionCallback) {
        let job_id = snapshot.job_id.clone();
        self.lock_callbacks().insert(job_id.clone(), callback);
        self.apply(&snapshot);

        let current = self.job(&job_id);
        if let Some(job) = current {
            self.fire_if_completed(&job.snapshot);
        }
    }

    /// Merges one snapshot. Returns whether the mirror changed.
    ///
    /// A terminal snapshot is final: later non-terminal snapshots for the
    /// same job are stale and ignored, as are snapshots older than the one
    /// already held.
    pub fn apply(&self, snapshot: &JobSnapshot) -> bool {
        let changed = {
            let mut state = self.lock_state();
            let now = self.clock.now();
            let changed = match state.jobs.get_mut(&snapshot.job_id) {
                Some(existing) => {
                    let stale = (existing.snapshot.is_terminal() && !snapshot.is_terminal())
                        || snapshot.updated_at < existing.snapshot.updated_at;
                    if stale || existing.snapshot == *snapshot {
                        false
                    } else {
                        if snapshot.is_terminal() && existing.terminal_since.is_none() {
                            existing.terminal_since = Some(now);
                        }
                        existing.snapshot = snapshot.clone();
                        true
                    }
                }
                None => {
                    state.jobs.insert(
                        snapshot.job_id.clone(),
                        MirroredJob {
                            snapshot: snapshot.clone(),
                            terminal_since: snapshot.is_terminal().then_some(now),
                        },
                    );
                    true
                }
            };
            if changed {
                self.persist(&state);
            }
            changed
        };

        self.fire_if_completed(snapshot);
        changed
    }

    /// Applies a pushed event if it concerns a tracked job.
    pub fn apply_event(&self, event: &StatusEvent) -> bool {
        let StatusEvent::Job(snapshot) = event else {
            return false;
        };
        if !self.lock_state().jobs.contains_key(&snapshot.job_id) {
            return false;
        }
        self.apply(snapshot)
    }

    fn fire_if_completed(&self, snapshot: &JobSnapshot) {
        if snapshot.status != JobStatus::Completed || snapshot.result.is_none() {
            return;
        }
        // Removing under the lock makes the callback one-shot.
        let callback = self.lock_callbacks().remove(&snapshot.job_id);
        if let Some(callback) = callback {
            log::debug!("Running completion callback for job {}", snapshot.job_id);
            callback(snapshot);
        }
    }

    /// Re-reads every non-terminal job after a disconnect, since pushes
    /// sent meanwhile are lost.
    pub fn reconnect(&self, source: &dyn StatusSource) -> ReconcileReport {
        let pending: Vec<String> = self
            .lock_state()
            .jobs
            .values()
            .filter(|j| !j.snapshot.is_terminal())
            .map(|j| j.snapshot.job_id.clone())
            .collect();

        let mut report = ReconcileReport::default();
        for job_id in pending {
            match source.query_status(&job_id) {
                Ok(snapshot) => {
                    self.apply(&snapshot);
                    report.refreshed.push(job_id);
                }
                Err(QueueError::NotFound(_)) => {
                    self.forget(&job_id);
                    report.missing.push(job_id);
                }
                Err(e) => {
                    log::warn!("Could not reconcile job {}: {}", job_id, e);
                    report.unreachable.push(job_id);
                }
            }
        }
        report
    }

    /// Drops terminal jobs whose grace period has passed. Returns their ids.
    pub fn prune(&self) -> Vec<String> {
        let now = self.clock.now();
        let grace = to_chrono(self.grace_period);
        let mut state = self.lock_state();

        let expired: Vec<String> = state
            .jobs
            .values()
            .filter(|j| matches!(j.terminal_since, Some(since) if now - since >= grace))
            .map(|j| j.snapshot.job_id.clone())
            .collect();
        if expired.is_empty() {
            return expired;
        }
        for id in &expired {
            state.jobs.remove(id);
            state.minimized.remove(id);
        }
        self.persist(&state);
        drop(state);

        let mut callbacks = self.lock_callbacks();
        for id in &expired {
            callbacks.remove(id);
        }
        expired
    }

    fn forget(&self, job_id: &str) {
        let mut state = self.lock_state();
        state.jobs.remove(job_id);
        state.minimized.remove(job_id);
        self.persist(&state);
        drop(state);
        self.lock_callbacks().remove(job_id);
    }

    pub fn minimize(&self, job_id: &str) -> bool {
        let mut state = self.lock_state();
        if !state.jobs.contains_key(job_id) {
            return false;
        }
        let inserted = state.minimized.insert(job_id.to_string());
        if inserted {
            self.persist(&state);
        }
        inserted
    }

    pub fn restore(&self, job_id: &str) -> bool {
        let mut state = self.lock_state();
        let removed = state.minimized.remove(job_id);
        if removed {
            self.persist(&state);
        }
        removed
    }

    pub fn is_minimized(&self, job_id: &str) -> bool {
        self.lock_state().minimized.contains(job_id)
    }

    pub fn job(&self, job_id: &str) -> Option<MirroredJob> {
        self.lock_state().jobs.get(job_id).cloned()
    }

    /// Every tracked job, minimized ones included.
    pub fn jobs(&self) -> Vec<MirroredJob> {
        self.lock_state().jobs.values().cloned().collect()
    }

    /// Tracked jobs that are not minimized.
    pub fn visible(&self) -> Vec<MirroredJob> {
        let state = self.lock_state();
        state
            .jobs
            .values()
            .filter(|j| !state.minimized.contains(&j.snapshot.job_id))
            .cloned()
            .collect()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.lock_callbacks().len()
    }
}
