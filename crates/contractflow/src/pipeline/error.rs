use thiserror::Error;

use crate::db::DatabaseError;
use crate::queue::QueueError;

use super::state::ProcessingStatus;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Page {page_number} of document {document_id} not found")]
    PageNotFound {
        document_id: String,
        page_number: u32,
    },

    #[error("Document {document_id} cannot move from {from} to {to}")]
    InvalidTransition {
        document_id: String,
        from: ProcessingStatus,
        to: ProcessingStatus,
    },

    #[error("Document {0} has not finished uploading")]
    UploadIncomplete(String),

    #[error("Invalid document: {0}")]
    Validation(String),

    #[error("Document {0} cannot be merged before its lower-sequence siblings finish")]
    MergeNotReady(String),

    #[error("Document {document_id} has used all {retries} retries")]
    RetriesExhausted { document_id: String, retries: u32 },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
