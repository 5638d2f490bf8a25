//! Chunk repository: the `chunks` table and the document chunk counter.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
    pub document_id: String,
    pub chunk_number: i64,
    pub size: Option<i64>,
    pub hash: Option<String>,
    pub storage_path: Option<String>,
    pub status: String,
    pub retry_count: i64,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ChunkRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            document_id: row.get("document_id")?,
            chunk_number: row.get("chunk_number")?,
            size: row.get("size")?,
            hash: row.get("hash")?,
            storage_path: row.get("storage_path")?,
            status: row.get("status")?,
            retry_count: row.get("retry_count")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Creates one PENDING row per expected chunk. Existing rows are kept.
pub fn insert_pending(
    db: &Database,
    document_id: &str,
    total_chunks: i64,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_transaction(|conn| {
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO chunks (document_id, chunk_number, status, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?3)",
        )?;
        for chunk_number in 0..total_chunks {
            stmt.execute(params![document_id, chunk_number, now])?;
        }
        conn.execute(
            "UPDATE documents SET upload_status = 'uploading', updated_at = ?2
             WHERE id = ?1 AND upload_status = 'pending'",
            params![document_id, now],
        )?;
        Ok(())
    })
}

pub fn find(
    db: &Database,
    document_id: &str,
    chunk_number: i64,
) -> Result<Option<ChunkRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM chunks WHERE document_id = ?1 AND chunk_number = ?2",
                params![document_id, chunk_number],
                ChunkRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn list(db: &Database, document_id: &str) -> Result<Vec<ChunkRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn
            .prepare("SELECT * FROM chunks WHERE document_id = ?1 ORDER BY chunk_number ASC")?;
        let rows = stmt
            .query_map(params![document_id], ChunkRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Marks a chunk COMPLETED and recounts the document's received chunks.
///
/// The counter is recomputed rather than incremented so a resent chunk is
/// never counted twice. Returns the new `chunks_uploaded`.
pub fn record_completed(
    db: &Database,
    document_id: &str,
    chunk_number: i64,
    size: i64,
    hash: &str,
    storage_path: &str,
    now: &str,
) -> Result<i64, DatabaseError> {
    db.with_transaction(|conn| {
        conn.execute(
            "INSERT INTO chunks (document_id, chunk_number, size, hash, storage_path, status,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'completed', ?6, ?6)
             ON CONFLICT (document_id, chunk_number) DO UPDATE SET
               size = excluded.size, hash = excluded.hash,
               storage_path = excluded.storage_path, status = 'completed', error = NULL,
               updated_at = excluded.updated_at",
            params![document_id, chunk_number, size, hash, storage_path, now],
        )?;
        conn.execute(
            "UPDATE documents SET
               chunks_uploaded = (SELECT COUNT(*) FROM chunks
                                  WHERE document_id = ?1 AND status = 'completed'),
               updated_at = ?2
             WHERE id = ?1",
            params![document_id, now],
        )?;
        let uploaded: i64 = conn.query_row(
            "SELECT chunks_uploaded FROM documents WHERE id = ?1",
            params![document_id],
            |r| r.get(0),
        )?;
        Ok(uploaded)
    })
}

/// Marks a chunk FAILED after an integrity mismatch and bumps its retry count.
/// Returns the new retry count.
pub fn record_failed(
    db: &Database,
    document_id: &str,
    chunk_number: i64,
    declared_hash: &str,
    error: &str,
    now: &str,
) -> Result<i64, DatabaseError> {
    db.with_transaction(|conn| {
        conn.execute(
            "INSERT INTO chunks (document_id, chunk_number, hash, status, retry_count, error,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, 'failed', 1, ?4, ?5, ?5)
             ON CONFLICT (document_id, chunk_number) DO UPDATE SET
               hash = excluded.hash, status = 'failed', retry_count = retry_count + 1,
               error = excluded.error, updated_at = excluded.updated_at",
            params![document_id, chunk_number, declared_hash, error, now],
        )?;
        // A failed resend of a previously good chunk must not stay counted.
        conn.execute(
            "UPDATE documents SET
               chunks_uploaded = (SELECT COUNT(*) FROM chunks
                                  WHERE document_id = ?1 AND status = 'completed'),
               updated_at = ?2
             WHERE id = ?1",
            params![document_id, now],
        )?;
        let retries: i64 = conn.query_row(
            "SELECT retry_count FROM chunks WHERE document_id = ?1 AND chunk_number = ?2",
            params![document_id, chunk_number],
            |r| r.get(0),
        )?;
        Ok(retries)
    })
}

pub fn delete_for_document(db: &Database, document_id: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "DELETE FROM chunks WHERE document_id = ?1",
            params![document_id],
        )?;
        Ok(n)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::document_repo;

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        document_repo::insert(&db, &document_repo::tests::sample_document("d1")).unwrap();
        insert_pending(&db, "d1", 3, "t0").unwrap();
        db
    }

    #[test]
    fn test_insert_pending_creates_rows_and_starts_upload() {
        let db = setup();
        let rows = list(&db, "d1").unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.status == "pending"));
        let doc = document_repo::find_by_id(&db, "d1").unwrap().unwrap();
        assert_eq!(doc.upload_status, "uploading");
    }

    #[test]
    fn test_resend_does_not_double_count() {
        let db = setup();
        assert_eq!(record_completed(&db, "d1", 0, 1024, "aa", "/c0", "t1").unwrap(), 1);
        assert_eq!(record_completed(&db, "d1", 0, 1024, "aa", "/c0", "t2").unwrap(), 1);
        assert_eq!(record_completed(&db, "d1", 2, 512, "bb", "/c2", "t3").unwrap(), 2);
    }

    #[test]
    fn test_failed_chunk_counts_retries() {
        let db = setup();
        assert_eq!(record_failed(&db, "d1", 1, "ff", "mismatch", "t1").unwrap(), 1);
        assert_eq!(record_failed(&db, "d1", 1, "ff", "mismatch", "t2").unwrap(), 2);
        let row = find(&db, "d1", 1).unwrap().unwrap();
        assert_eq!(row.status, "failed");

        record_completed(&db, "d1", 1, 1024, "ee", "/c1", "t3").unwrap();
        let row = find(&db, "d1", 1).unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.retry_count, 2);
        assert!(row.error.is_none());
    }

    #[test]
    fn test_delete_for_document() {
        let db = setup();
        assert_eq!(delete_for_document(&db, "d1").unwrap(), 3);
        assert!(list(&db, "d1").unwrap().is_empty());
    }
}
