//! Merge artifact repository.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeArtifactRow {
    pub id: String,
    pub contract_id: String,
    pub document_id: String,
    pub sequence_order: i64,
    /// JSON array of document ids in merge order.
    pub source_documents: String,
    pub page_count: i64,
    pub text: String,
    pub created_at: String,
}

impl MergeArtifactRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            contract_id: row.get("contract_id")?,
            document_id: row.get("document_id")?,
            sequence_order: row.get("sequence_order")?,
            source_documents: row.get("source_documents")?,
            page_count: row.get("page_count")?,
            text: row.get("text")?,
            created_at: row.get("created_at")?,
        })
    }
}

pub fn insert(db: &Database, artifact: &MergeArtifactRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO merge_artifacts (id, contract_id, document_id, sequence_order,
             source_documents, page_count, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                artifact.id,
                artifact.contract_id,
                artifact.document_id,
                artifact.sequence_order,
                artifact.source_documents,
                artifact.page_count,
                artifact.text,
                artifact.created_at,
            ],
        )?;
        Ok(())
    })
}

/// The most recent merge produced for a document.
pub fn latest_for_document(
    db: &Database,
    document_id: &str,
) -> Result<Option<MergeArtifactRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM merge_artifacts WHERE document_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![document_id],
                MergeArtifactRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::document_repo;

    #[test]
    fn test_latest_wins() {
        let db = Database::open_in_memory().unwrap();
        document_repo::insert(&db, &document_repo::tests::sample_document("d1")).unwrap();
        for (id, text) in [("m1", "old"), ("m2", "new")] {
            insert(
                &db,
                &MergeArtifactRow {
                    id: id.to_string(),
                    contract_id: "c1".to_string(),
                    document_id: "d1".to_string(),
                    sequence_order: 0,
                    source_documents: "[\"d1\"]".to_string(),
                    page_count: 1,
                    text: text.to_string(),
                    created_at: "2026-01-01T00:00:00.000000Z".to_string(),
                },
            )
            .unwrap();
        }
        let latest = latest_for_document(&db, "d1").unwrap().unwrap();
        assert_eq!(latest.text, "new");
        assert!(latest_for_document(&db, "d2").unwrap().is_none());
    }
}
