//! Chunked uploads: verification, temp storage, and reassembly.

mod chunk_store;
pub mod storage;

pub use chunk_store::{AssembledFile, ChunkInfo, ChunkResult, ChunkStatus, ChunkStore};
pub use storage::{content_hash, ChunkStorage};
