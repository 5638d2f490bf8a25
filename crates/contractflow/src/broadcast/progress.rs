//! Push channel for job and document status, plus the pull-based query that
//! lets a reconnecting client resynchronise.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::db::{job_repo, Database};
use crate::queue::{Job, QueueError};

use super::snapshot::{DocumentSnapshot, JobSnapshot, StatusEvent, StatusFilter};

/// Broadcasts [`StatusEvent`]s to any number of subscribers.
///
/// Publishing never blocks and never fails; with no subscribers the event
/// is dropped. Slow subscribers lose the oldest events and are told how
/// many they missed, after which they should poll [`Self::query_status`].
#[derive(Clone)]
pub struct ProgressBroadcaster {
    sender: Arc<broadcast::Sender<StatusEvent>>,
    db: Database,
}

impl ProgressBroadcaster {
    pub fn new(db: Database, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
            db,
        }
    }

    pub fn publish(&self, event: StatusEvent) {
        // Ignore send errors (no active receivers)
        let _ = self.sender.send(event);
    }

    pub fn publish_job(&self, job: &Job) {
        self.publish(StatusEvent::Job(JobSnapshot::from(job)));
    }

    pub fn publish_document(&self, snapshot: DocumentSnapshot) {
        self.publish(StatusEvent::Document(snapshot));
    }

    pub fn subscribe(&self, filter: StatusFilter) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Current snapshot of a job, in the same shape as the pushed events.
    pub fn query_status(&self, job_id: &str) -> Result<JobSnapshot, QueueError> {
        let row = job_repo::find_by_id(&self.db, job_id)?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        let job = Job::from_row(&row)?;
        Ok(JobSnapshot::from(&job))
    }
}

/// A filtered view of the push channel.
pub struct Subscription {
    receiver: broadcast::Receiver<StatusEvent>,
    filter: StatusFilter,
    missed: u64,
}

impl Subscription {
    /// Events dropped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn note_lag(&mut self, skipped: u64) {
        self.missed += skipped;
        log::warn!(
            "Status subscriber lagged, {} events dropped; client should resync",
            skipped
        );
    }

    /// Next matching event if one is already queued.
    pub fn try_next(&mut self) -> Option<StatusEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => self.note_lag(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Waits for the next matching event. `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<StatusEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => self.note_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Blocking variant of [`Self::next`] for use outside an async runtime.
    pub fn blocking_next(&mut self) -> Option<StatusEvent> {
        loop {
            match self.receiver.blocking_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => self.note_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Every matching event queued right now.
    pub fn drain(&mut self) -> Vec<StatusEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::snapshot::tests::job_snapshot;
    use crate::queue::JobStatus;

    fn broadcaster(capacity: usize) -> ProgressBroadcaster {
        ProgressBroadcaster::new(Database::open_in_memory().unwrap(), capacity)
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let b = broadcaster(4);
        b.publish(StatusEvent::Job(job_snapshot("j1", JobStatus::Pending)));
        assert_eq!(b.subscriber_count(), 0);
    }

    #[test]
    fn test_subscription_filters_by_job() {
        let b = broadcaster(16);
        let mut sub = b.subscribe(StatusFilter::Job("j2".into()));
        b.publish(StatusEvent::Job(job_snapshot("j1", JobStatus::Pending)));
        b.publish(StatusEvent::Job(job_snapshot("j2", JobStatus::Processing)));
        b.publish(StatusEvent::Job(job_snapshot("j2", JobStatus::Completed)));

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.job_id() == Some("j2")));
    }

    #[test]
    fn test_lagging_subscriber_counts_missed_events() {
        let b = broadcaster(2);
        let mut sub = b.subscribe(StatusFilter::All);
        for i in 0..5 {
            b.publish(StatusEvent::Job(job_snapshot(&format!("j{}", i), JobStatus::Pending)));
        }
        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(sub.missed(), 3);
    }

    #[test]
    fn test_query_status_unknown_job() {
        let b = broadcaster(4);
        assert!(matches!(b.query_status("nope"), Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_async_next() {
        let b = broadcaster(4);
        let mut sub = b.subscribe(StatusFilter::All);
        b.publish(StatusEvent::Job(job_snapshot("j1", JobStatus::Completed)));
        let event = sub.next().await.unwrap();
        assert_eq!(event.job_id(), Some("j1"));
    }
}
