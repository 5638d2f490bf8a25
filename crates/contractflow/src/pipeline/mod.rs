//! Document and page lifecycle.

pub mod document;
pub mod error;
pub mod gate;
mod lifecycle;
pub mod state;

pub use document::{
    Document, MergeArtifact, NewDocument, Page, PageAttempt, PageExtraction, PageFeatures,
};
pub use error::PipelineError;
pub use gate::SiblingOrderGate;
pub use lifecycle::DocumentPipeline;
pub use state::{DocumentType, PageStatus, ProcessingStatus, UploadStatus};
