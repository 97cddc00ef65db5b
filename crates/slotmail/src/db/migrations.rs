//! Schema migrations for the slot and queue tables.
//!
//! The highest version recorded in `_migrations` is the schema version.

use chrono::Utc;
use rusqlite::{params, Connection};

use super::error::DatabaseError;
use super::format_ts;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Ordered by version.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_smtp_slots_table",
        sql: include_str!("sql/001_create_smtp_slots.sql"),
    },
    Migration {
        version: 2,
        description: "create_scheduled_emails_table",
        sql: include_str!("sql/002_create_scheduled_emails.sql"),
    },
];

/// Applies every migration newer than the recorded schema version.
///
/// Each migration and its `_migrations` row commit together, so a failing
/// script leaves the schema at the previous version.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  TEXT NOT NULL
        );",
    )?;

    let schema_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > schema_version) {
        log::info!(
            "Applying schema v{} ({})",
            migration.version,
            migration.description
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.description,
                format_ts(&Utc::now())
            ],
        )?;
        tx.commit()?;
    }

    Ok(())
}
