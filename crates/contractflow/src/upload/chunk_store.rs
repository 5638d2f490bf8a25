use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::clock::{format_timestamp, Clock};
use crate::db::chunk_repo::{self, ChunkRow};
use crate::db::{document_repo, Database};
use crate::error::UploadError;
use crate::sanitize::redact_path;

use super::storage::{content_hash, ChunkStorage};

/// Answer to a single chunk upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    pub document_id: String,
    pub chunk_number: u32,
    pub chunks_uploaded: u32,
    pub total_chunks: u32,
    /// Every expected chunk has arrived and verified.
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFile {
    pub document_id: String,
    pub path: PathBuf,
    pub size: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl ChunkStatus {
    fn parse(s: &str) -> Self {
        match s {
            "pending" => ChunkStatus::Pending,
            "uploading" => ChunkStatus::Uploading,
            "completed" => ChunkStatus::Completed,
            other => {
                if other != "failed" {
                    log::warn!("Unknown chunk status '{}', treating as failed", other);
                }
                ChunkStatus::Failed
            }
        }
    }
}

/// Per-chunk view for upload status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    pub chunk_number: u32,
    pub status: ChunkStatus,
    pub size: Option<u64>,
    pub hash: Option<String>,
    pub retry_count: u32,
    pub error: Option<String>,
}

impl ChunkInfo {
    fn from_row(row: &ChunkRow) -> Self {
        Self {
            chunk_number: u32::try_from(row.chunk_number).unwrap_or(u32::MAX),
            status: ChunkStatus::parse(&row.status),
            size: row.size.and_then(|s| u64::try_from(s).ok()),
            hash: row.hash.clone(),
            retry_count: u32::try_from(row.retry_count).unwrap_or(u32::MAX),
            error: row.error.clone(),
        }
    }
}

/// Receives chunk bytes, verifies them, and reassembles whole documents.
pub struct ChunkStore {
    db: Database,
    storage: ChunkStorage,
    clock: Arc<dyn Clock>,
    /// Serialises assembly so each document is assembled at most once.
    assembly: Mutex<()>,
}

impl ChunkStore {
    pub fn new(db: Database, storage: ChunkStorage, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            storage,
            clock,
            assembly: Mutex::new(()),
        }
    }

    fn now(&self) -> String {
        format_timestamp(self.clock.now())
    }

    fn document(&self, document_id: &str) -> Result<document_repo::DocumentRow, UploadError> {
        document_repo::find_by_id(&self.db, document_id)?
            .ok_or_else(|| UploadError::DocumentNotFound(document_id.to_string()))
    }

    /// Creates the PENDING chunk rows for a registered document.
    pub fn init_upload(&self, document_id: &str, total_chunks: u32) -> Result<(), UploadError> {
        let doc = self.document(document_id)?;
        if total_chunks == 0 {
            return Err(UploadError::Validation(
                "total chunk count must be at least 1".to_string(),
            ));
        }
        if i64::from(total_chunks) != doc.total_chunks {
            return Err(UploadError::Validation(format!(
                "document {} was registered with {} chunks, not {}",
                document_id, doc.total_chunks, total_chunks
            )));
        }
        chunk_repo::insert_pending(&self.db, document_id, i64::from(total_chunks), &self.now())?;
        log::debug!("Upload started for document {} ({} chunks)", document_id, total_chunks);
        Ok(())
    }

    /// Verifies and stores one chunk. A hash mismatch marks only this chunk
    /// FAILED and asks the caller to resend it; resending the same number
    /// replaces the earlier bytes.
    pub fn put_chunk(
        &self,
        document_id: &str,
        chunk_number: u32,
        bytes: &[u8],
        declared_hash: &str,
    ) -> Result<ChunkResult, UploadError> {
        let doc = self.document(document_id)?;
        let total = u32::try_from(doc.total_chunks).unwrap_or(0);
        if chunk_number >= total {
            return Err(UploadError::Validation(format!(
                "chunk {} is out of range for {} chunks",
                chunk_number, total
            )));
        }
        if doc.assembled_path.is_some() {
            return Err(UploadError::Validation(format!(
                "document {} is already assembled",
                document_id
            )));
        }

        let now = self.now();
        let actual = content_hash(bytes);
        let expected = declared_hash.trim().to_ascii_lowercase();
        if actual != expected {
            let retries = chunk_repo::record_failed(
                &self.db,
                document_id,
                i64::from(chunk_number),
                &expected,
                "hash mismatch",
                &now,
            )?;
            log::warn!(
                "Chunk {} of document {} failed integrity check (attempt {})",
                chunk_number,
                document_id,
                retries
            );
            return Err(UploadError::Integrity {
                chunk_number,
                expected,
                actual,
            });
        }

        let path = self.storage.write_chunk(document_id, chunk_number, bytes)?;
        let uploaded = chunk_repo::record_completed(
            &self.db,
            document_id,
            i64::from(chunk_number),
            i64::try_from(bytes.len()).unwrap_or(i64::MAX),
            &actual,
            &path.to_string_lossy(),
            &now,
        )?;
        let chunks_uploaded = u32::try_from(uploaded).unwrap_or(0).min(total);
        log::debug!(
            "Stored chunk {} of document {} ({}/{})",
            chunk_number,
            document_id,
            chunks_uploaded,
            total
        );
        Ok(ChunkResult {
            document_id: document_id.to_string(),
            chunk_number,
            chunks_uploaded,
            total_chunks: total,
            complete: chunks_uploaded == total,
        })
    }

    pub fn is_complete(&self, document_id: &str) -> Result<bool, UploadError> {
        let doc = self.document(document_id)?;
        Ok(doc.assembled_path.is_some() || doc.chunks_uploaded == doc.total_chunks)
    }

    /// Chunk numbers not yet COMPLETED, in order.
    pub fn missing_chunks(&self, document_id: &str) -> Result<Vec<u32>, UploadError> {
        let doc = self.document(document_id)?;
        if doc.assembled_path.is_some() {
            return Ok(Vec::new());
        }
        let received: Vec<u32> = chunk_repo::list(&self.db, document_id)?
            .iter()
            .filter(|row| row.status == "completed")
            .filter_map(|row| u32::try_from(row.chunk_number).ok())
            .collect();
        let total = u32::try_from(doc.total_chunks).unwrap_or(0);
        Ok((0..total).filter(|n| !received.contains(n)).collect())
    }

    pub fn chunks(&self, document_id: &str) -> Result<Vec<ChunkInfo>, UploadError> {
        self.document(document_id)?;
        Ok(chunk_repo::list(&self.db, document_id)?
            .iter()
            .map(ChunkInfo::from_row)
            .collect())
    }

    /// Concatenates the chunks in order, checks the declared size, and
    /// completes the upload. Later calls return the first result.
    pub fn assemble(&self, document_id: &str) -> Result<AssembledFile, UploadError> {
        let _guard = match self.assembly.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("ChunkStore assembly lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };

        let doc = self.document(document_id)?;
        if let (Some(path), Some(size), Some(hash)) = (
            doc.assembled_path.as_ref(),
            doc.assembled_size,
            doc.assembled_hash.as_ref(),
        ) {
            return Ok(AssembledFile {
                document_id: doc.id.clone(),
                path: PathBuf::from(path),
                size: u64::try_from(size).unwrap_or(0),
                hash: hash.clone(),
            });
        }

        let total = u32::try_from(doc.total_chunks).unwrap_or(0);
        let uploaded = u32::try_from(doc.chunks_uploaded).unwrap_or(0);
        if uploaded < total {
            return Err(UploadError::IncompleteUpload { uploaded, total });
        }

        let rows = chunk_repo::list(&self.db, document_id)?;
        let mut parts = Vec::with_capacity(rows.len());
        for row in rows.iter().filter(|r| r.status == "completed") {
            match row.storage_path.as_ref() {
                Some(path) => parts.push(PathBuf::from(path)),
                None => {
                    return Err(UploadError::Validation(format!(
                        "chunk {} of document {} has no stored bytes",
                        row.chunk_number, document_id
                    )))
                }
            }
        }

        let written = self.storage.write_assembled(document_id, &parts)?;
        let declared = u64::try_from(doc.file_size).unwrap_or(0);
        if written.size != declared {
            self.storage.remove_file(&written.path);
            return Err(UploadError::SizeMismatch {
                declared,
                actual: written.size,
            });
        }

        document_repo::mark_assembled(
            &self.db,
            document_id,
            &written.path.to_string_lossy(),
            i64::try_from(written.size).unwrap_or(i64::MAX),
            &written.hash,
            &self.now(),
        )?;
        chunk_repo::delete_for_document(&self.db, document_id)?;
        if let Err(e) = self.storage.remove_chunks(document_id) {
            log::warn!("Leaving chunk parts of {} behind: {}", document_id, e);
        }
        log::info!(
            "Assembled document {} ({} bytes) at {}",
            document_id,
            written.size,
            redact_path(&written.path)
        );

        Ok(AssembledFile {
            document_id: document_id.to_string(),
            path: written.path,
            size: written.size,
            hash: written.hash,
        })
    }

    /// Reads the assembled bytes of a document.
    pub fn read_assembled(&self, document_id: &str) -> Result<Vec<u8>, UploadError> {
        let doc = self.document(document_id)?;
        match doc.assembled_path {
            Some(path) => self.storage.read(&PathBuf::from(path)),
            None => Err(UploadError::IncompleteUpload {
                uploaded: u32::try_from(doc.chunks_uploaded).unwrap_or(0),
                total: u32::try_from(doc.total_chunks).unwrap_or(0),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::document_repo::tests::sample_document;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Database, ChunkStore) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        document_repo::insert(&db, &sample_document("d1")).unwrap();
        let store = ChunkStore::new(
            db.clone(),
            ChunkStorage::new(temp_dir.path()),
            Arc::new(ManualClock::default()),
        );
        store.init_upload("d1", 3).unwrap();
        (temp_dir, db, store)
    }

    fn put(store: &ChunkStore, n: u32, bytes: &[u8]) -> ChunkResult {
        store.put_chunk("d1", n, bytes, &content_hash(bytes)).unwrap()
    }

    #[test]
    fn test_init_rejects_wrong_chunk_count() {
        let (_dir, _db, store) = setup();
        assert!(matches!(
            store.init_upload("d1", 4),
            Err(UploadError::Validation(_))
        ));
        assert!(matches!(
            store.init_upload("missing", 3),
            Err(UploadError::DocumentNotFound(_))
        ));
    }

    #[test]
    fn test_assemble_waits_for_every_chunk() {
        let (_dir, _db, store) = setup();
        let a = vec![b'a'; 1024];
        let b = vec![b'b'; 1024];
        let c = vec![b'c'; 512];

        put(&store, 0, &a);
        let result = put(&store, 2, &c);
        assert_eq!(result.chunks_uploaded, 2);
        assert!(!result.complete);
        assert!(matches!(
            store.assemble("d1"),
            Err(UploadError::IncompleteUpload { uploaded: 2, total: 3 })
        ));
        assert_eq!(store.missing_chunks("d1").unwrap(), vec![1]);

        assert!(put(&store, 1, &b).complete);
        let assembled = store.assemble("d1").unwrap();
        assert_eq!(assembled.size, 2560);
        assert!(store.is_complete("d1").unwrap());

        let bytes = store.read_assembled("d1").unwrap();
        assert_eq!(&bytes[..1024], &a[..]);
        assert_eq!(&bytes[1024..2048], &b[..]);
        assert_eq!(&bytes[2048..], &c[..]);
    }

    #[test]
    fn test_assemble_is_idempotent_and_cleans_chunks() {
        let (dir, db, store) = setup();
        put(&store, 0, &[1u8; 1024]);
        put(&store, 1, &[2u8; 1024]);
        put(&store, 2, &[3u8; 512]);

        let first = store.assemble("d1").unwrap();
        let second = store.assemble("d1").unwrap();
        assert_eq!(first, second);
        assert!(chunk_repo::list(&db, "d1").unwrap().is_empty());
        assert!(!dir.path().join("chunks/d1").exists());

        let doc = document_repo::find_by_id(&db, "d1").unwrap().unwrap();
        assert_eq!(doc.upload_status, "completed");
        assert_eq!(doc.assembled_hash.as_deref(), Some(first.hash.as_str()));
    }

    #[test]
    fn test_hash_mismatch_then_resend() {
        let (_dir, _db, store) = setup();
        put(&store, 0, &[1u8; 1024]);

        let good = vec![2u8; 1024];
        let err = store
            .put_chunk("d1", 1, &[9u8; 1024], &content_hash(&good))
            .unwrap_err();
        assert_eq!(err.resend_chunk(), Some(1));

        let chunks = store.chunks("d1").unwrap();
        assert_eq!(chunks[0].status, ChunkStatus::Completed);
        assert_eq!(chunks[1].status, ChunkStatus::Failed);
        assert_eq!(chunks[1].retry_count, 1);
        assert_eq!(chunks[2].status, ChunkStatus::Pending);

        let result = put(&store, 1, &good);
        assert_eq!(result.chunks_uploaded, 2);
        let chunks = store.chunks("d1").unwrap();
        assert_eq!(chunks[1].status, ChunkStatus::Completed);
        assert_eq!(chunks[0].status, ChunkStatus::Completed);
        assert_eq!(chunks[2].status, ChunkStatus::Pending);
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let (_dir, db, store) = setup();
        put(&store, 0, &[1u8; 10]);
        put(&store, 1, &[1u8; 10]);
        put(&store, 2, &[1u8; 10]);
        assert!(matches!(
            store.assemble("d1"),
            Err(UploadError::SizeMismatch { declared: 2560, actual: 30 })
        ));
        let doc = document_repo::find_by_id(&db, "d1").unwrap().unwrap();
        assert!(doc.assembled_path.is_none());
    }

    #[test]
    fn test_out_of_range_chunk() {
        let (_dir, _db, store) = setup();
        assert!(matches!(
            store.put_chunk("d1", 3, b"x", &content_hash(b"x")),
            Err(UploadError::Validation(_))
        ));
    }
}
