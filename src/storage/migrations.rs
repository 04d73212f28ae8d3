//! Database migrations for offsync

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < SCHEMA_VERSION {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Operation log (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- seq preserves insertion order; id is the public identifier
        CREATE TABLE IF NOT EXISTS sync_operations (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            type TEXT NOT NULL,
            entity TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT 'null',
            local_timestamp TEXT NOT NULL,
            priority TEXT NOT NULL DEFAULT 'normal',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            conflict_data TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_operations_retry ON sync_operations(retry_count);
        CREATE INDEX IF NOT EXISTS idx_sync_operations_entity ON sync_operations(entity);

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;
    Ok(())
}

/// Key/value metadata, holds the persisted sync state snapshot (v2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        INSERT INTO schema_version (version) VALUES (2);
        "#,
    )?;
    Ok(())
}
