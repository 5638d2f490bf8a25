//! Durable, priority-ordered job queue.
//!
//! Jobs live in the `jobs` table. Workers lease them one at a time; a lease
//! is exclusive and expires, so a crashed worker's job goes back to PENDING.

pub mod backoff;
pub mod job;
mod job_queue;

use thiserror::Error;

use crate::db::DatabaseError;

pub use backoff::Backoff;
pub use job::{
    CancelOutcome, EntityRef, FailOutcome, Job, JobFailure, JobStatus, JobType, NewJob,
    QueueStats,
};
pub use job_queue::{JobQueue, LeaseGate};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} is not leased by {worker_id}")]
    NotLeaseHolder { job_id: String, worker_id: String },

    #[error("Unreadable job {job_id}: {reason}")]
    CorruptRow { job_id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
