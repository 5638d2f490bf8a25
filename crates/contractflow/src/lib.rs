pub mod broadcast;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod mirror;
pub mod pipeline;
pub mod providers;
pub mod queue;
pub mod resilience;
pub mod sanitize;
pub mod service;
pub mod upload;
pub mod worker;

pub use broadcast::{
    DocumentSnapshot, JobSnapshot, Notifier, ProgressBroadcaster, StatusEvent, StatusFilter,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, load_config_from_str, Config};
pub use error::{ConfigError, ContractflowError, Result, UploadError, WorkerError};
pub use mirror::{ClientJobMirror, MirrorError};
pub use pipeline::{DocumentPipeline, NewDocument, PipelineError};
pub use queue::{EntityRef, JobQueue, JobStatus, JobType, NewJob, QueueError};
pub use resilience::{ErrorCategory, ResilienceError, ResilienceLayer};
pub use service::{IngestService, Providers};
pub use upload::{ChunkResult, ChunkStore};
pub use worker::{Executor, WorkerPool};
