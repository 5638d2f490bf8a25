use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContractflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Mirror error: {0}")]
    Mirror(#[from] crate::mirror::MirrorError),

    #[error("Logging setup failed: {0}")]
    Logging(#[from] crate::logging::LoggingError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

/// Errors surfaced to the upload caller. None of these are retried server-side.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid upload request: {0}")]
    Validation(String),

    #[error("Chunk {chunk_number} failed integrity check (expected {expected}, got {actual}); resend this chunk")]
    Integrity {
        chunk_number: u32,
        expected: String,
        actual: String,
    },

    #[error("Upload incomplete: {uploaded} of {total} chunks received")]
    IncompleteUpload { uploaded: u32, total: u32 },

    #[error("Assembled size {actual} does not match declared size {declared}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Chunk storage failed for '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

impl UploadError {
    /// Returns the chunk the caller has to resend, if this is an integrity failure.
    pub fn resend_chunk(&self) -> Option<u32> {
        match self {
            UploadError::Integrity { chunk_number, .. } => Some(*chunk_number),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("No handlers registered")]
    NoHandlers,
}

pub type Result<T> = std::result::Result<T, ContractflowError>;
