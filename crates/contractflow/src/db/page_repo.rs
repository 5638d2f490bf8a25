//! Page repository: the `pages` and `page_history` tables.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct PageRow {
    pub id: String,
    pub document_id: String,
    pub page_number: i64,
    pub attempt: i64,
    pub status: String,
    pub text: Option<String>,
    pub confidence: Option<f64>,
    pub word_count: i64,
    pub char_count: i64,
    pub has_table: bool,
    pub has_image: bool,
    pub has_signature: bool,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl PageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            document_id: row.get("document_id")?,
            page_number: row.get("page_number")?,
            attempt: row.get("attempt")?,
            status: row.get("status")?,
            text: row.get("text")?,
            confidence: row.get("confidence")?,
            word_count: row.get("word_count")?,
            char_count: row.get("char_count")?,
            has_table: row.get("has_table")?,
            has_image: row.get("has_image")?,
            has_signature: row.get("has_signature")?,
            error: row.get("error")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// A superseded page attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PageHistoryRow {
    pub page_id: String,
    pub document_id: String,
    pub page_number: i64,
    pub attempt: i64,
    pub status: String,
    pub text: Option<String>,
    pub confidence: Option<f64>,
    pub word_count: i64,
    pub char_count: i64,
    pub error: Option<String>,
    pub completed_at: Option<String>,
    pub superseded_at: String,
}

impl PageHistoryRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            page_id: row.get("page_id")?,
            document_id: row.get("document_id")?,
            page_number: row.get("page_number")?,
            attempt: row.get("attempt")?,
            status: row.get("status")?,
            text: row.get("text")?,
            confidence: row.get("confidence")?,
            word_count: row.get("word_count")?,
            char_count: row.get("char_count")?,
            error: row.get("error")?,
            completed_at: row.get("completed_at")?,
            superseded_at: row.get("superseded_at")?,
        })
    }
}

/// Page counts by terminal outcome for one document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageTally {
    pub completed: u32,
    pub failed: u32,
    pub words: i64,
}

fn find_on(
    conn: &Connection,
    document_id: &str,
    page_number: i64,
) -> Result<Option<PageRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM pages WHERE document_id = ?1 AND page_number = ?2",
            params![document_id, page_number],
            PageRow::from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn find(
    db: &Database,
    document_id: &str,
    page_number: i64,
) -> Result<Option<PageRow>, DatabaseError> {
    db.with_conn(|conn| find_on(conn, document_id, page_number))
}

pub fn list_for_document(db: &Database, document_id: &str) -> Result<Vec<PageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM pages WHERE document_id = ?1 ORDER BY page_number ASC")?;
        let rows = stmt
            .query_map(params![document_id], PageRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Starts processing a page and returns the row now in `processing`.
///
/// A missing row is created as attempt 1. A COMPLETED row is copied into
/// `page_history` first and its attempt number bumped, so a corrective
/// re-analysis never overwrites the earlier result in place. Rows in any
/// other status are resumed under their current attempt.
pub fn begin_attempt(
    db: &Database,
    new_id: &str,
    document_id: &str,
    page_number: i64,
    now: &str,
) -> Result<PageRow, DatabaseError> {
    db.with_transaction(|conn| {
        match find_on(conn, document_id, page_number)? {
            None => {
                conn.execute(
                    "INSERT INTO pages (id, document_id, page_number, attempt, status,
                     started_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 1, 'processing', ?4, ?4, ?4)",
                    params![new_id, document_id, page_number, now],
                )?;
            }
            Some(existing) if existing.status == "completed" => {
                conn.execute(
                    "INSERT INTO page_history (page_id, document_id, page_number, attempt,
                     status, text, confidence, word_count, char_count, has_table, has_image,
                     has_signature, error, completed_at, superseded_at)
                     SELECT id, document_id, page_number, attempt, status, text, confidence,
                     word_count, char_count, has_table, has_image, has_signature, error,
                     completed_at, ?2
                     FROM pages WHERE id = ?1",
                    params![existing.id, now],
                )?;
                conn.execute(
                    "UPDATE pages SET attempt = attempt + 1, status = 'processing', text = NULL,
                     confidence = NULL, word_count = 0, char_count = 0, has_table = 0,
                     has_image = 0, has_signature = 0, error = NULL, started_at = ?2,
                     completed_at = NULL, updated_at = ?2
                     WHERE id = ?1",
                    params![existing.id, now],
                )?;
            }
            Some(existing) => {
                conn.execute(
                    "UPDATE pages SET status = 'processing', started_at = ?2, updated_at = ?2
                     WHERE id = ?1",
                    params![existing.id, now],
                )?;
            }
        }

        find_on(conn, document_id, page_number)?.ok_or(DatabaseError::Sqlite(
            rusqlite::Error::QueryReturnedNoRows,
        ))
    })
}

/// Stores a finished extraction on a page that is being processed.
pub fn complete(db: &Database, page: &PageRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE pages SET status = 'completed', text = ?2, confidence = ?3,
             word_count = ?4, char_count = ?5, has_table = ?6, has_image = ?7,
             has_signature = ?8, error = NULL, completed_at = ?9, updated_at = ?9
             WHERE id = ?1",
            params![
                page.id,
                page.text,
                page.confidence,
                page.word_count,
                page.char_count,
                page.has_table,
                page.has_image,
                page.has_signature,
                page.completed_at,
            ],
        )?;
        Ok(())
    })
}

/// Sets status and error of a page that is not COMPLETED.
/// Returns false if the page is missing or already completed.
pub fn set_status(
    db: &Database,
    document_id: &str,
    page_number: i64,
    status: &str,
    error: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE pages SET status = ?3, error = ?4, updated_at = ?5,
             completed_at = CASE WHEN ?3 IN ('failed', 'cancelled') THEN ?5 ELSE completed_at END
             WHERE document_id = ?1 AND page_number = ?2 AND status != 'completed'",
            params![document_id, page_number, status, error, now],
        )?;
        Ok(changed > 0)
    })
}

/// Creates placeholder rows so that pages not yet leased show up as pending.
pub fn insert_pending(
    db: &Database,
    document_id: &str,
    pages: &[(String, i64)],
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_transaction(|conn| {
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO pages (id, document_id, page_number, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
        )?;
        for (id, page_number) in pages {
            stmt.execute(params![id, document_id, page_number, now])?;
        }
        Ok(())
    })
}

pub fn tally(db: &Database, document_id: &str) -> Result<PageTally, DatabaseError> {
    db.with_conn(|conn| {
        let tally = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'completed' THEN word_count ELSE 0 END), 0)
             FROM pages WHERE document_id = ?1",
            params![document_id],
            |r| {
                Ok(PageTally {
                    completed: r.get(0)?,
                    failed: r.get(1)?,
                    words: r.get(2)?,
                })
            },
        )?;
        Ok(tally)
    })
}

pub fn history(
    db: &Database,
    document_id: &str,
    page_number: i64,
) -> Result<Vec<PageHistoryRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM page_history WHERE document_id = ?1 AND page_number = ?2
             ORDER BY attempt ASC",
        )?;
        let rows = stmt
            .query_map(params![document_id, page_number], PageHistoryRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::document_repo;

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        document_repo::insert(&db, &document_repo::tests::sample_document("d1")).unwrap();
        db
    }

    #[test]
    fn test_begin_attempt_creates_page() {
        let db = setup();
        let page = begin_attempt(&db, "p1", "d1", 1, "t1").unwrap();
        assert_eq!(page.attempt, 1);
        assert_eq!(page.status, "processing");
        assert_eq!(page.started_at.as_deref(), Some("t1"));
    }

    #[test]
    fn test_reprocessing_completed_page_keeps_history() {
        let db = setup();
        let mut page = begin_attempt(&db, "p1", "d1", 1, "t1").unwrap();
        page.text = Some("first pass".to_string());
        page.word_count = 2;
        page.completed_at = Some("t2".to_string());
        complete(&db, &page).unwrap();

        let again = begin_attempt(&db, "ignored", "d1", 1, "t3").unwrap();
        assert_eq!(again.id, "p1");
        assert_eq!(again.attempt, 2);
        assert!(again.text.is_none());

        let history = history(&db, "d1", 1).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].attempt, 1);
        assert_eq!(history[0].text.as_deref(), Some("first pass"));
        assert_eq!(history[0].superseded_at, "t3");
    }

    #[test]
    fn test_retrying_page_keeps_attempt() {
        let db = setup();
        begin_attempt(&db, "p1", "d1", 2, "t1").unwrap();
        assert!(set_status(&db, "d1", 2, "retrying", Some("db locked"), "t2").unwrap());
        let resumed = begin_attempt(&db, "p-other", "d1", 2, "t3").unwrap();
        assert_eq!(resumed.attempt, 1);
        assert!(history(&db, "d1", 2).unwrap().is_empty());
    }

    #[test]
    fn test_completed_page_is_not_overwritten_by_status() {
        let db = setup();
        let mut page = begin_attempt(&db, "p1", "d1", 1, "t1").unwrap();
        page.completed_at = Some("t2".to_string());
        complete(&db, &page).unwrap();
        assert!(!set_status(&db, "d1", 1, "failed", Some("late"), "t3").unwrap());
    }

    #[test]
    fn test_tally_counts_terminal_pages() {
        let db = setup();
        insert_pending(
            &db,
            "d1",
            &[("p1".into(), 1), ("p2".into(), 2), ("p3".into(), 3)],
            "t0",
        )
        .unwrap();
        let mut page = begin_attempt(&db, "x", "d1", 1, "t1").unwrap();
        page.word_count = 7;
        page.completed_at = Some("t2".to_string());
        complete(&db, &page).unwrap();
        set_status(&db, "d1", 2, "failed", Some("boom"), "t2").unwrap();

        let tally = tally(&db, "d1").unwrap();
        assert_eq!(
            tally,
            PageTally {
                completed: 1,
                failed: 1,
                words: 7
            }
        );
    }
}
