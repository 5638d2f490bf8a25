//! Job repository: the `jobs` table.
//!
//! Every state-changing statement is conditional on the status it expects to
//! move away from, so two callers racing on the same job cannot both win.
//! Callers learn the outcome from the returned `bool`.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub job_type: String,
    pub status: String,
    pub priority: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub config: String,
    pub prerequisites: String,
    pub progress: i64,
    pub current_step: Option<String>,
    pub scheduled_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error: Option<String>,
    pub error_detail: Option<String>,
    pub result: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<String>,
    pub cancel_requested: bool,
    pub archived: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_type: row.get("job_type")?,
            status: row.get("status")?,
            priority: row.get("priority")?,
            entity_type: row.get("entity_type")?,
            entity_id: row.get("entity_id")?,
            config: row.get("config")?,
            prerequisites: row.get("prerequisites")?,
            progress: row.get("progress")?,
            current_step: row.get("current_step")?,
            scheduled_at: row.get("scheduled_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            error: row.get("error")?,
            error_detail: row.get("error_detail")?,
            result: row.get("result")?,
            lease_owner: row.get("lease_owner")?,
            lease_expires_at: row.get("lease_expires_at")?,
            cancel_requested: row.get("cancel_requested")?,
            archived: row.get("archived")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub job_type: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub include_archived: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, job_type, status, priority, entity_type, entity_id, config,
             prerequisites, progress, current_step, scheduled_at, started_at, completed_at,
             retry_count, max_retries, error, error_detail, result, lease_owner,
             lease_expires_at, cancel_requested, archived, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                job.id,
                job.job_type,
                job.status,
                job.priority,
                job.entity_type,
                job.entity_id,
                job.config,
                job.prerequisites,
                job.progress,
                job.current_step,
                job.scheduled_at,
                job.started_at,
                job.completed_at,
                job.retry_count,
                job.max_retries,
                job.error,
                job.error_detail,
                job.result,
                job.lease_owner,
                job.lease_expires_at,
                job.cancel_requested,
                job.archived,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// One page of the PENDING jobs of the given types that are due, most
/// urgent first.
pub fn lease_candidates(
    db: &Database,
    job_types: &[&str],
    now: &str,
    limit: u32,
    offset: u32,
) -> Result<Vec<JobRow>, DatabaseError> {
    if job_types.is_empty() {
        return Ok(Vec::new());
    }
    db.with_conn(|conn| {
        let placeholders: Vec<String> = (0..job_types.len()).map(|i| format!("?{}", i + 4)).collect();
        let sql = format!(
            "SELECT * FROM jobs
             WHERE status = 'pending' AND archived = 0 AND scheduled_at <= ?1
               AND job_type IN ({})
             ORDER BY priority ASC, scheduled_at ASC, created_at ASC, id ASC
             LIMIT ?2 OFFSET ?3",
            placeholders.join(", ")
        );
        let mut param_values: Vec<&dyn rusqlite::types::ToSql> = vec![&now, &limit, &offset];
        for job_type in job_types {
            param_values.push(job_type);
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(param_values.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Moves RETRYING jobs whose backoff has elapsed back to PENDING.
/// Returns the promoted ids.
pub fn promote_due_retries(db: &Database, now: &str) -> Result<Vec<String>, DatabaseError> {
    db.with_transaction(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id FROM jobs WHERE status = 'retrying' AND scheduled_at <= ?1 AND archived = 0",
        )?;
        let ids = stmt
            .query_map(params![now], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for id in &ids {
            conn.execute(
                "UPDATE jobs SET status = 'pending', updated_at = ?2
                 WHERE id = ?1 AND status = 'retrying'",
                params![id, now],
            )?;
        }
        Ok(ids)
    })
}

/// Atomically claims a PENDING job for `owner`.
pub fn claim(
    db: &Database,
    id: &str,
    owner: &str,
    lease_expires_at: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'processing', lease_owner = ?2, lease_expires_at = ?3,
             started_at = ?4, updated_at = ?4, progress = 0, current_step = NULL
             WHERE id = ?1 AND status = 'pending'",
            params![id, owner, lease_expires_at, now],
        )?;
        Ok(changed > 0)
    })
}

pub fn extend_lease(
    db: &Database,
    id: &str,
    owner: &str,
    lease_expires_at: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET lease_expires_at = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'processing' AND lease_owner = ?2",
            params![id, owner, lease_expires_at, now],
        )?;
        Ok(changed > 0)
    })
}

pub fn update_progress(
    db: &Database,
    id: &str,
    owner: &str,
    progress: i64,
    step: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET progress = ?3, current_step = COALESCE(?4, current_step),
             updated_at = ?5
             WHERE id = ?1 AND status = 'processing' AND lease_owner = ?2",
            params![id, owner, progress, step, now],
        )?;
        Ok(changed > 0)
    })
}

pub fn complete(
    db: &Database,
    id: &str,
    owner: &str,
    result: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'completed', result = ?3, progress = 100,
             completed_at = ?4, updated_at = ?4, lease_owner = NULL, lease_expires_at = NULL
             WHERE id = ?1 AND status = 'processing' AND lease_owner = ?2",
            params![id, owner, result, now],
        )?;
        Ok(changed > 0)
    })
}

/// Failure of an attempt that will be retried after `scheduled_at`.
pub fn record_retry(
    db: &Database,
    id: &str,
    owner: &str,
    retry_count: i64,
    error: &str,
    error_detail: &str,
    scheduled_at: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'retrying', retry_count = ?2, error = ?3,
             error_detail = ?4, scheduled_at = ?5, updated_at = ?6,
             lease_owner = NULL, lease_expires_at = NULL
             WHERE id = ?1 AND status = 'processing' AND retry_count <= ?2
               AND lease_owner = ?7",
            params![id, retry_count, error, error_detail, scheduled_at, now, owner],
        )?;
        Ok(changed > 0)
    })
}

/// Terminal failure.
pub fn record_failure(
    db: &Database,
    id: &str,
    owner: &str,
    retry_count: i64,
    error: &str,
    error_detail: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'failed', retry_count = ?2, error = ?3,
             error_detail = ?4, completed_at = ?5, updated_at = ?5,
             lease_owner = NULL, lease_expires_at = NULL
             WHERE id = ?1 AND status = 'processing' AND retry_count <= ?2
               AND lease_owner = ?6",
            params![id, retry_count, error, error_detail, now, owner],
        )?;
        Ok(changed > 0)
    })
}

/// Cancels a job that no worker holds.
pub fn cancel_queued(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'cancelled', completed_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'retrying')",
            params![id, now],
        )?;
        Ok(changed > 0)
    })
}

/// Flags a PROCESSING job for cooperative cancellation.
pub fn request_cancel(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET cancel_requested = 1, updated_at = ?2
             WHERE id = ?1 AND status = 'processing'",
            params![id, now],
        )?;
        Ok(changed > 0)
    })
}

pub fn is_cancel_requested(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let flag: Option<bool> = conn
            .query_row(
                "SELECT cancel_requested FROM jobs WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(false))
    })
}

/// Finishes a PROCESSING job whose worker observed the cancel flag.
pub fn mark_cancelled(
    db: &Database,
    id: &str,
    owner: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'cancelled', completed_at = ?3, updated_at = ?3,
             lease_owner = NULL, lease_expires_at = NULL
             WHERE id = ?1 AND status = 'processing' AND cancel_requested = 1
               AND lease_owner = ?2",
            params![id, owner, now],
        )?;
        Ok(changed > 0)
    })
}

/// PROCESSING jobs whose lease ran out before `now`.
pub fn expired_leases(db: &Database, now: &str) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status = 'processing' AND lease_expires_at < ?1",
        )?;
        let rows = stmt
            .query_map(params![now], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Returns an expired lease to the queue. The retry count is left alone;
/// a lost worker is not a failed attempt.
pub fn release_expired(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL,
             updated_at = ?2
             WHERE id = ?1 AND status = 'processing' AND lease_expires_at < ?2",
            params![id, now],
        )?;
        Ok(changed > 0)
    })
}

/// Current statuses of the given jobs. Unknown ids are omitted.
pub fn statuses(db: &Database, ids: &[String]) -> Result<Vec<(String, String)>, DatabaseError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT id, status FROM jobs WHERE id = ?1")?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let found = stmt
                .query_row(params![id], |r| Ok((r.get(0)?, r.get(1)?)))
                .optional()?;
            if let Some(pair) = found {
                out.push(pair);
            }
        }
        Ok(out)
    })
}

pub fn for_entity(
    db: &Database,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![entity_type, entity_id], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Jobs whose entity id starts with `prefix`, e.g. every page of a document.
pub fn for_entity_prefix(
    db: &Database,
    entity_type: &str,
    prefix: &str,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE entity_type = ?1 AND substr(entity_id, 1, ?3) = ?2
             ORDER BY created_at ASC",
        )?;
        let prefix_len = prefix.chars().count() as i64;
        let rows = stmt
            .query_map(params![entity_type, prefix, prefix_len], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Flags terminal jobs finished before `before` as archived.
pub fn archive_finished(db: &Database, before: &str, now: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET archived = 1, updated_at = ?2
             WHERE archived = 0 AND status IN ('completed', 'failed', 'cancelled')
               AND completed_at < ?1",
            params![before, now],
        )?;
        Ok(changed)
    })
}

/// Job counts per status for unarchived jobs, plus the archived total.
pub fn count_by_status(db: &Database) -> Result<(Vec<(String, u64)>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM jobs WHERE archived = 0 GROUP BY status ORDER BY status",
        )?;
        let counts = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let archived: u64 =
            conn.query_row("SELECT COUNT(*) FROM jobs WHERE archived = 1", [], |r| r.get(0))?;
        Ok((counts, archived))
    })
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }
        if let Some(ref job_type) = filter.job_type {
            conditions.push(format!("job_type = ?{}", param_values.len() + 1));
            param_values.push(Box::new(job_type.clone()));
        }
        if let Some(ref entity_type) = filter.entity_type {
            conditions.push(format!("entity_type = ?{}", param_values.len() + 1));
            param_values.push(Box::new(entity_type.clone()));
        }
        if let Some(ref entity_id) = filter.entity_id {
            conditions.push(format!("entity_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(entity_id.clone()));
        }
        if !filter.include_archived {
            conditions.push("archived = 0".to_string());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str, priority: i64, scheduled_at: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            job_type: "page_analysis".to_string(),
            status: "pending".to_string(),
            priority,
            entity_type: "page".to_string(),
            entity_id: format!("d1/{}", id),
            config: "{}".to_string(),
            prerequisites: "[]".to_string(),
            progress: 0,
            current_step: None,
            scheduled_at: scheduled_at.to_string(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            error: None,
            error_detail: None,
            result: None,
            lease_owner: None,
            lease_expires_at: None,
            cancel_requested: false,
            archived: false,
            created_at: scheduled_at.to_string(),
            updated_at: scheduled_at.to_string(),
        }
    }

    #[test]
    fn test_candidates_ordered_by_priority_then_age() {
        let db = test_db();
        insert(&db, &sample_job("late-urgent", 10, "2026-01-01T00:00:05Z")).unwrap();
        insert(&db, &sample_job("early-normal", 50, "2026-01-01T00:00:01Z")).unwrap();
        insert(&db, &sample_job("early-urgent", 10, "2026-01-01T00:00:02Z")).unwrap();
        insert(&db, &sample_job("future", 1, "2026-01-01T01:00:00Z")).unwrap();

        let rows =
            lease_candidates(&db, &["page_analysis"], "2026-01-01T00:10:00Z", 10, 0).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["early-urgent", "late-urgent", "early-normal"]);

        let second_page =
            lease_candidates(&db, &["page_analysis"], "2026-01-01T00:10:00Z", 2, 2).unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].id, "early-normal");

        assert!(lease_candidates(&db, &["ocr"], "2026-01-01T00:10:00Z", 10, 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let db = test_db();
        insert(&db, &sample_job("j1", 50, "t0")).unwrap();
        assert!(claim(&db, "j1", "w1", "t9", "t1").unwrap());
        assert!(!claim(&db, "j1", "w2", "t9", "t1").unwrap());
        let row = find_by_id(&db, "j1").unwrap().unwrap();
        assert_eq!(row.lease_owner.as_deref(), Some("w1"));
        assert_eq!(row.status, "processing");
    }

    #[test]
    fn test_progress_requires_lease_owner() {
        let db = test_db();
        insert(&db, &sample_job("j1", 50, "t0")).unwrap();
        claim(&db, "j1", "w1", "t9", "t1").unwrap();
        assert!(!update_progress(&db, "j1", "w2", 50, Some("halfway"), "t2").unwrap());
        assert!(update_progress(&db, "j1", "w1", 50, Some("halfway"), "t2").unwrap());
        let row = find_by_id(&db, "j1").unwrap().unwrap();
        assert_eq!(row.progress, 50);
        assert_eq!(row.current_step.as_deref(), Some("halfway"));
    }

    #[test]
    fn test_cancel_paths() {
        let db = test_db();
        insert(&db, &sample_job("queued", 50, "t0")).unwrap();
        insert(&db, &sample_job("running", 50, "t0")).unwrap();
        claim(&db, "running", "w1", "t9", "t1").unwrap();

        assert!(cancel_queued(&db, "queued", "t2").unwrap());
        assert!(!cancel_queued(&db, "running", "t2").unwrap());
        assert!(request_cancel(&db, "running", "t2").unwrap());
        assert!(is_cancel_requested(&db, "running").unwrap());
        assert!(!mark_cancelled(&db, "running", "w2", "t3").unwrap());
        assert!(mark_cancelled(&db, "running", "w1", "t3").unwrap());
        assert_eq!(find_by_id(&db, "running").unwrap().unwrap().status, "cancelled");
    }

    #[test]
    fn test_retry_count_cannot_exceed_max() {
        let db = test_db();
        insert(&db, &sample_job("j1", 50, "t0")).unwrap();
        claim(&db, "j1", "w1", "t9", "t1").unwrap();
        let err = record_failure(&db, "j1", "w1", 4, "boom", "{}", "t2");
        assert!(err.is_err());
    }

    #[test]
    fn test_outcomes_require_lease_owner() {
        let db = test_db();
        insert(&db, &sample_job("j1", 50, "t0")).unwrap();
        claim(&db, "j1", "w2", "t9", "t1").unwrap();

        assert!(!complete(&db, "j1", "w1", "{}", "t2").unwrap());
        assert!(!record_retry(&db, "j1", "w1", 1, "boom", "{}", "t5", "t2").unwrap());
        assert!(!record_failure(&db, "j1", "w1", 1, "boom", "{}", "t2").unwrap());
        let row = find_by_id(&db, "j1").unwrap().unwrap();
        assert_eq!(row.status, "processing");
        assert_eq!(row.lease_owner.as_deref(), Some("w2"));

        assert!(complete(&db, "j1", "w2", "{}", "t2").unwrap());
    }

    #[test]
    fn test_expired_lease_released_without_retry() {
        let db = test_db();
        insert(&db, &sample_job("j1", 50, "t0")).unwrap();
        claim(&db, "j1", "w1", "t5", "t1").unwrap();
        assert!(expired_leases(&db, "t4").unwrap().is_empty());
        assert_eq!(expired_leases(&db, "t6").unwrap().len(), 1);
        assert!(release_expired(&db, "j1", "t6").unwrap());
        let row = find_by_id(&db, "j1").unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.retry_count, 0);
        assert!(row.lease_owner.is_none());
    }

    #[test]
    fn test_entity_prefix_lookup() {
        let db = test_db();
        insert(&db, &sample_job("1", 50, "t0")).unwrap();
        insert(&db, &sample_job("2", 50, "t0")).unwrap();
        let mut other = sample_job("3", 50, "t0");
        other.entity_id = "d10/3".to_string();
        insert(&db, &other).unwrap();

        assert_eq!(for_entity_prefix(&db, "page", "d1/").unwrap().len(), 2);
        assert_eq!(for_entity(&db, "page", "d1/1").unwrap().len(), 1);
    }

    #[test]
    fn test_query_and_counts() {
        let db = test_db();
        insert(&db, &sample_job("a", 50, "t0")).unwrap();
        insert(&db, &sample_job("b", 50, "t0")).unwrap();
        claim(&db, "b", "w", "t9", "t1").unwrap();
        complete(&db, "b", "w", "{}", "t2").unwrap();

        let (rows, total) = query(
            &db,
            &JobFilter {
                status: Some("completed".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, "b");

        assert_eq!(archive_finished(&db, "t3", "t4").unwrap(), 1);
        let (counts, archived) = count_by_status(&db).unwrap();
        assert_eq!(counts, vec![("pending".to_string(), 1)]);
        assert_eq!(archived, 1);
    }
}
