//! Client-held mirror of in-flight jobs.

mod client;
pub mod store;

use std::path::PathBuf;

use thiserror::Error;

pub use client::{ClientJobMirror, CompletionCallback, ReconcileReport, StatusSource};
pub use store::{MirrorFile, MirrorState, MirroredJob};

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Failed to read mirror state '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write mirror state '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse mirror state: {0}")]
    Parse(#[from] serde_json::Error),
}
