//! Document repository: the `documents` table.
//!
//! Rows whose `deleted_at` is set are invisible to every lookup here.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRow {
    pub id: String,
    pub contract_id: Option<String>,
    pub parent_id: Option<String>,
    pub temp_id: Option<String>,
    pub filename: String,
    pub mime_type: Option<String>,
    pub document_type: String,
    pub sequence_order: i64,
    pub file_size: i64,
    pub upload_status: String,
    pub processing_status: String,
    pub retry_count: i64,
    pub total_pages: Option<i64>,
    pub total_words: Option<i64>,
    pub total_chunks: i64,
    pub chunks_uploaded: i64,
    pub assembled_path: Option<String>,
    pub assembled_size: Option<i64>,
    pub assembled_hash: Option<String>,
    pub upload_started_at: String,
    pub upload_completed_at: Option<String>,
    pub extraction_started_at: Option<String>,
    pub extraction_completed_at: Option<String>,
    pub error: Option<String>,
    pub metadata: String,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl DocumentRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            contract_id: row.get("contract_id")?,
            parent_id: row.get("parent_id")?,
            temp_id: row.get("temp_id")?,
            filename: row.get("filename")?,
            mime_type: row.get("mime_type")?,
            document_type: row.get("document_type")?,
            sequence_order: row.get("sequence_order")?,
            file_size: row.get("file_size")?,
            upload_status: row.get("upload_status")?,
            processing_status: row.get("processing_status")?,
            retry_count: row.get("retry_count")?,
            total_pages: row.get("total_pages")?,
            total_words: row.get("total_words")?,
            total_chunks: row.get("total_chunks")?,
            chunks_uploaded: row.get("chunks_uploaded")?,
            assembled_path: row.get("assembled_path")?,
            assembled_size: row.get("assembled_size")?,
            assembled_hash: row.get("assembled_hash")?,
            upload_started_at: row.get("upload_started_at")?,
            upload_completed_at: row.get("upload_completed_at")?,
            extraction_started_at: row.get("extraction_started_at")?,
            extraction_completed_at: row.get("extraction_completed_at")?,
            error: row.get("error")?,
            metadata: row.get("metadata")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            deleted_at: row.get("deleted_at")?,
        })
    }
}

pub fn insert(db: &Database, doc: &DocumentRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO documents (id, contract_id, parent_id, temp_id, filename, mime_type,
             document_type, sequence_order, file_size, upload_status, processing_status,
             retry_count, total_pages, total_words, total_chunks, chunks_uploaded,
             assembled_path, assembled_size, assembled_hash, upload_started_at,
             upload_completed_at, extraction_started_at, extraction_completed_at, error,
             metadata, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)",
            params![
                doc.id,
                doc.contract_id,
                doc.parent_id,
                doc.temp_id,
                doc.filename,
                doc.mime_type,
                doc.document_type,
                doc.sequence_order,
                doc.file_size,
                doc.upload_status,
                doc.processing_status,
                doc.retry_count,
                doc.total_pages,
                doc.total_words,
                doc.total_chunks,
                doc.chunks_uploaded,
                doc.assembled_path,
                doc.assembled_size,
                doc.assembled_hash,
                doc.upload_started_at,
                doc.upload_completed_at,
                doc.extraction_started_at,
                doc.extraction_completed_at,
                doc.error,
                doc.metadata,
                doc.created_at,
                doc.updated_at,
                doc.deleted_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a live document by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<DocumentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM documents WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                DocumentRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Resolves a caller-supplied correlation id. The newest match wins.
pub fn find_by_temp_id(db: &Database, temp_id: &str) -> Result<Option<DocumentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM documents WHERE temp_id = ?1 AND deleted_at IS NULL
                 ORDER BY created_at DESC LIMIT 1",
                params![temp_id],
                DocumentRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// All live documents of a contract in sequence order.
pub fn list_for_contract(db: &Database, contract_id: &str) -> Result<Vec<DocumentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM documents WHERE contract_id = ?1 AND deleted_at IS NULL
             ORDER BY sequence_order ASC, created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![contract_id], DocumentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Overwrites the processing fields of a document.
///
/// Upload fields (`upload_status`, chunk counters, assembled file) are owned
/// by the chunk repository and are left untouched.
pub fn update_processing(db: &Database, doc: &DocumentRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE documents SET processing_status=?2, retry_count=?3, total_pages=?4,
             total_words=?5, extraction_started_at=?6, extraction_completed_at=?7, error=?8,
             metadata=?9, updated_at=?10
             WHERE id=?1",
            params![
                doc.id,
                doc.processing_status,
                doc.retry_count,
                doc.total_pages,
                doc.total_words,
                doc.extraction_started_at,
                doc.extraction_completed_at,
                doc.error,
                doc.metadata,
                doc.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Moves the processing status only if it currently equals `expected`.
/// Returns whether the row changed.
pub fn compare_and_set_status(
    db: &Database,
    id: &str,
    expected: &str,
    status: &str,
    error: Option<&str>,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE documents SET processing_status = ?3, error = COALESCE(?4, error),
             updated_at = ?5
             WHERE id = ?1 AND processing_status = ?2 AND deleted_at IS NULL",
            params![id, expected, status, error, updated_at],
        )?;
        Ok(changed > 0)
    })
}

pub fn set_upload_status(
    db: &Database,
    id: &str,
    upload_status: &str,
    error: Option<&str>,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE documents SET upload_status = ?2, error = COALESCE(?3, error), updated_at = ?4
             WHERE id = ?1",
            params![id, upload_status, error, updated_at],
        )?;
        Ok(())
    })
}

/// Records the assembled file and completes the upload.
pub fn mark_assembled(
    db: &Database,
    id: &str,
    path: &str,
    size: i64,
    hash: &str,
    completed_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE documents SET upload_status = 'completed', assembled_path = ?2,
             assembled_size = ?3, assembled_hash = ?4, upload_completed_at = ?5,
             updated_at = ?5
             WHERE id = ?1",
            params![id, path, size, hash, completed_at],
        )?;
        Ok(())
    })
}

/// Logically deletes every live document of a contract. Returns the ids.
pub fn mark_deleted_for_contract(
    db: &Database,
    contract_id: &str,
    deleted_at: &str,
) -> Result<Vec<String>, DatabaseError> {
    db.with_transaction(|conn| {
        let mut stmt = conn
            .prepare("SELECT id FROM documents WHERE contract_id = ?1 AND deleted_at IS NULL")?;
        let ids = stmt
            .query_map(params![contract_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        conn.execute(
            "UPDATE documents SET deleted_at = ?2, updated_at = ?2
             WHERE contract_id = ?1 AND deleted_at IS NULL",
            params![contract_id, deleted_at],
        )?;
        Ok(ids)
    })
}
