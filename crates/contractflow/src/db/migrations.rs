//! Versioned schema migrations.
//!
//! Applied versions are recorded in `_migrations`; each migration runs at
//! most once. Column additions are skipped when the column already exists so
//! databases created by hand-patched builds still open.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    Standard,
    /// ALTER TABLE ADD COLUMN, skipped if the column exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_documents_table",
        sql: include_str!("sql/001_create_documents.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_pages_and_page_history_tables",
        sql: include_str!("sql/002_create_pages.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "create_chunks_table",
        sql: include_str!("sql/003_create_chunks.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 4,
        description: "create_jobs_table",
        sql: include_str!("sql/004_create_jobs.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 5,
        description: "create_merge_artifacts_table",
        sql: include_str!("sql/005_create_merge_artifacts.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 6,
        description: "add_deleted_at_to_documents",
        sql: include_str!("sql/006_add_deleted_at_to_documents.sql"),
        kind: MigrationKind::AddColumn {
            table: "documents",
            column: "deleted_at",
        },
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let should_run = match &migration.kind {
            MigrationKind::Standard => true,
            MigrationKind::AddColumn { table, column } => !column_exists(conn, table, column)?,
        };

        if should_run {
            conn.execute_batch(migration.sql)
                .map_err(|e| DatabaseError::Migration {
                    version: migration.version,
                    reason: e.to_string(),
                })?;
        } else {
            log::info!(
                "Skipping migration v{} (column already present)",
                migration.version
            );
        }

        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::Migration {
            version: 0,
            reason: format!("Invalid table name: {}", table),
        });
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .any(|r| r.map(|name| name == column).unwrap_or(false));
    Ok(exists)
}
