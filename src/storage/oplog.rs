//! Durable operation log
//!
//! Append-only table of pending mutations. Rows are created by `enqueue`,
//! updated in place by the scheduler and removed on confirmed success. A row
//! at the retry ceiling, or one parked on a manual conflict, is retained but
//! no longer pending.
//!
//! Delivery is at-least-once: a crash between the remote call and
//! `mark_succeeded` replays the operation after restart. Executors should use
//! the operation id as an idempotency key where the remote side supports one.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::Storage;
use crate::error::{Result, SyncError};
use crate::sync::clock::{Clock, SystemClock};
use crate::types::{LogCounts, OperationId, OperationType, Priority, SyncOperation};

const SELECT_COLUMNS: &str = "id, type, entity, payload, local_timestamp, priority, \
                              retry_count, last_error, conflict_data";

/// Generate an operation id: zero-padded epoch millis plus a random suffix,
/// so ids sort roughly by creation time.
pub fn new_operation_id(now: DateTime<Utc>) -> OperationId {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{:013}-{}", now.timestamp_millis().max(0), &suffix[..12])
}

/// Durable, restart-surviving store of queued operations
#[derive(Clone)]
pub struct OperationLog {
    storage: Storage,
    max_retries: u32,
    clock: Arc<dyn Clock>,
}

impl OperationLog {
    /// Create a log over an opened storage
    pub fn new(storage: Storage, max_retries: u32) -> Self {
        Self::with_clock(storage, max_retries, Arc::new(SystemClock))
    }

    /// Create a log that stamps operations with the given clock
    pub fn with_clock(storage: Storage, max_retries: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            max_retries,
            clock,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Insert a new operation with `retry_count = 0` and `local_timestamp = now`.
    /// Never touches the network.
    pub fn enqueue(
        &self,
        op_type: OperationType,
        entity: &str,
        payload: &serde_json::Value,
        priority: Priority,
    ) -> Result<OperationId> {
        let entity = entity.trim();
        if entity.is_empty() {
            return Err(SyncError::InvalidInput(
                "entity name must not be empty".to_string(),
            ));
        }

        let now = self.clock.now();
        let id = new_operation_id(now);
        let payload_json = serde_json::to_string(payload)?;

        self.storage.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sync_operations (id, type, entity, payload, local_timestamp, priority)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    id,
                    op_type.as_str(),
                    entity,
                    payload_json,
                    format_timestamp(now),
                    priority.as_str()
                ],
            )?;
            Ok(())
        })?;

        tracing::debug!(op_id = %id, entity, op_type = %op_type, priority = %priority, "operation enqueued");
        Ok(id)
    }

    /// Get a single operation
    pub fn get(&self, id: &str) -> Result<Option<SyncOperation>> {
        self.storage.with_connection(|conn| get_operation(conn, id))
    }

    /// All operations that are neither exhausted nor parked, in insertion order.
    /// Callers sort by priority.
    pub fn list_pending(&self) -> Result<Vec<SyncOperation>> {
        self.query(
            "WHERE retry_count < ? AND conflict_data IS NULL ORDER BY seq",
            params![self.max_retries],
        )
    }

    /// Operations at or above the retry ceiling
    pub fn list_failed(&self) -> Result<Vec<SyncOperation>> {
        self.query(
            "WHERE retry_count >= ? ORDER BY seq",
            params![self.max_retries],
        )
    }

    /// Operations parked on a manual conflict
    pub fn list_conflicts(&self) -> Result<Vec<SyncOperation>> {
        self.query("WHERE conflict_data IS NOT NULL ORDER BY seq", [])
    }

    /// Every row, whatever its status
    pub fn list_all(&self) -> Result<Vec<SyncOperation>> {
        self.query("ORDER BY seq", [])
    }

    fn query<P: rusqlite::Params>(&self, clause: &str, params: P) -> Result<Vec<SyncOperation>> {
        self.storage.with_connection(|conn| {
            let sql = format!("SELECT {} FROM sync_operations {}", SELECT_COLUMNS, clause);
            let mut stmt = conn.prepare(&sql)?;
            let ops = stmt
                .query_map(params, row_to_operation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ops)
        })
    }

    /// Remove the row. Removing an absent id is a no-op; returns whether a row
    /// was deleted.
    pub fn mark_succeeded(&self, id: &str) -> Result<bool> {
        let removed = self.storage.with_connection(|conn| {
            Ok(conn.execute("DELETE FROM sync_operations WHERE id = ?", params![id])?)
        })?;
        Ok(removed > 0)
    }

    /// Increment the retry count and record the error. Returns the new count.
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<u32> {
        self.storage.with_transaction(|conn| {
            let updated = conn.execute(
                "UPDATE sync_operations SET retry_count = retry_count + 1, last_error = ?
                 WHERE id = ?",
                params![error, id],
            )?;
            if updated == 0 {
                return Err(SyncError::NotFound(id.to_string()));
            }
            let count: u32 = conn.query_row(
                "SELECT retry_count FROM sync_operations WHERE id = ?",
                params![id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Park the operation with the server's competing version. The retry count
    /// is left alone: a conflict is not a transport failure.
    pub fn mark_conflict(&self, id: &str, server_snapshot: &serde_json::Value) -> Result<()> {
        let snapshot = serde_json::to_string(server_snapshot)?;
        self.update_one(
            "UPDATE sync_operations SET conflict_data = ? WHERE id = ?",
            params![snapshot, id],
            id,
        )
    }

    /// Store an automatically resolved payload for re-dispatch
    pub fn replace_payload(&self, id: &str, payload: &serde_json::Value) -> Result<()> {
        let payload = serde_json::to_string(payload)?;
        self.update_one(
            "UPDATE sync_operations SET payload = ?, conflict_data = NULL WHERE id = ?",
            params![payload, id],
            id,
        )
    }

    /// Apply an external decision to a parked conflict: the reconciled value
    /// replaces the payload and the operation re-enters the pipeline with a
    /// fresh retry budget.
    pub fn resolve_conflict(&self, id: &str, payload: &serde_json::Value) -> Result<()> {
        let op = self
            .get(id)?
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        if !op.is_parked() {
            return Err(SyncError::InvalidInput(format!(
                "operation {} has no pending conflict",
                id
            )));
        }
        self.rewrite_payload(id, payload)
    }

    /// Manual fix-up of an operation's payload. Also resets its retry budget.
    pub fn update_payload(&self, id: &str, payload: &serde_json::Value) -> Result<()> {
        self.rewrite_payload(id, payload)
    }

    fn rewrite_payload(&self, id: &str, payload: &serde_json::Value) -> Result<()> {
        let payload = serde_json::to_string(payload)?;
        self.update_one(
            "UPDATE sync_operations
             SET payload = ?, conflict_data = NULL, retry_count = 0, last_error = NULL
             WHERE id = ?",
            params![payload, id],
            id,
        )
    }

    /// Reset every exhausted operation to `retry_count = 0`. Returns how many
    /// rows were reset.
    pub fn reset_failed(&self) -> Result<usize> {
        self.storage.with_connection(|conn| {
            Ok(conn.execute(
                "UPDATE sync_operations SET retry_count = 0 WHERE retry_count >= ?",
                params![self.max_retries],
            )?)
        })
    }

    /// Reset a single operation's retry count
    pub fn reset_operation(&self, id: &str) -> Result<()> {
        self.update_one(
            "UPDATE sync_operations SET retry_count = 0 WHERE id = ?",
            params![id],
            id,
        )
    }

    /// Remove an operation at the caller's explicit request
    pub fn discard(&self, id: &str) -> Result<bool> {
        let removed = self.mark_succeeded(id)?;
        if removed {
            tracing::info!(op_id = %id, "operation discarded");
        }
        Ok(removed)
    }

    /// Row counts by status
    pub fn counts(&self) -> Result<LogCounts> {
        self.storage.with_connection(|conn| {
            let counts = conn.query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN retry_count < ?1 AND conflict_data IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN retry_count >= ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN conflict_data IS NOT NULL THEN 1 ELSE 0 END), 0),
                    COUNT(*)
                 FROM sync_operations",
                params![self.max_retries],
                |row| {
                    Ok(LogCounts {
                        pending: row.get::<_, i64>(0)? as u64,
                        failed: row.get::<_, i64>(1)? as u64,
                        conflicts: row.get::<_, i64>(2)? as u64,
                        total: row.get::<_, i64>(3)? as u64,
                    })
                },
            )?;
            Ok(counts)
        })
    }

    fn update_one<P: rusqlite::Params>(&self, sql: &str, params: P, id: &str) -> Result<()> {
        let updated = self
            .storage
            .with_connection(|conn| Ok(conn.execute(sql, params)?))?;
        if updated == 0 {
            return Err(SyncError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

fn get_operation(conn: &Connection, id: &str) -> Result<Option<SyncOperation>> {
    let sql = format!(
        "SELECT {} FROM sync_operations WHERE id = ?",
        SELECT_COLUMNS
    );
    let op = conn
        .query_row(&sql, params![id], row_to_operation)
        .optional()?;
    Ok(op)
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_json(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| conversion_error(idx, e))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse()
        .map_err(|e: String| conversion_error(idx, SyncError::InvalidInput(e)))
}

fn row_to_operation(row: &Row) -> rusqlite::Result<SyncOperation> {
    let op_type: String = row.get(1)?;
    let payload: String = row.get(3)?;
    let local_timestamp: String = row.get(4)?;
    let priority: String = row.get(5)?;
    let conflict_data: Option<String> = row.get(8)?;

    Ok(SyncOperation {
        id: row.get(0)?,
        op_type: parse_enum(1, &op_type)?,
        entity: row.get(2)?,
        payload: parse_json(3, &payload)?,
        local_timestamp: DateTime::parse_from_rfc3339(&local_timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(4, e))?,
        priority: parse_enum(5, &priority)?,
        retry_count: row.get(6)?,
        last_error: row.get(7)?,
        conflict_data: conflict_data
            .as_deref()
            .map(|raw| parse_json(8, raw))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::ManualClock;
    use serde_json::json;

    fn log() -> OperationLog {
        OperationLog::new(Storage::open_in_memory().unwrap(), 3)
    }

    #[test]
    fn test_enqueue_then_list_pending() {
        let log = log();
        let id = log
            .enqueue(OperationType::Create, "member", &json!({"name": "Ada"}), Priority::High)
            .unwrap();

        let pending = log.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].retry_count, 0);
        assert_eq!(pending[0].payload, json!({"name": "Ada"}));
        assert_eq!(pending[0].priority, Priority::High);
        assert!(pending[0].last_error.is_none());
    }

    #[test]
    fn test_list_pending_in_insertion_order() {
        let log = log();
        let a = log
            .enqueue(OperationType::Create, "member", &json!(1), Priority::Low)
            .unwrap();
        let b = log
            .enqueue(OperationType::Update, "note", &json!(2), Priority::Critical)
            .unwrap();
        let ids: Vec<_> = log.list_pending().unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_enqueue_rejects_blank_entity() {
        let log = log();
        let err = log
            .enqueue(OperationType::Create, "  ", &json!({}), Priority::Normal)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }

    #[test]
    fn test_uses_injected_clock() {
        let clock = Arc::new(ManualClock::from_millis(1_700_000_000_000));
        let log = OperationLog::with_clock(Storage::open_in_memory().unwrap(), 3, clock.clone());
        let id = log
            .enqueue(OperationType::Delete, "relationship", &json!({"id": 4}), Priority::Normal)
            .unwrap();
        assert!(id.starts_with("1700000000000-"));
        let op = log.get(&id).unwrap().unwrap();
        assert_eq!(op.local_timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_mark_succeeded_is_idempotent() {
        let log = log();
        let id = log
            .enqueue(OperationType::Create, "member", &json!({}), Priority::Normal)
            .unwrap();
        assert!(log.mark_succeeded(&id).unwrap());
        assert!(!log.mark_succeeded(&id).unwrap());
        assert!(log.get(&id).unwrap().is_none());
    }

    #[test]
    fn test_mark_failed_until_exhausted() {
        let log = log();
        let id = log
            .enqueue(OperationType::Update, "member", &json!({}), Priority::Normal)
            .unwrap();

        assert_eq!(log.mark_failed(&id, "timeout").unwrap(), 1);
        assert_eq!(log.mark_failed(&id, "timeout").unwrap(), 2);
        assert_eq!(log.mark_failed(&id, "refused").unwrap(), 3);

        assert!(log.list_pending().unwrap().is_empty());
        let failed = log.list_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("refused"));

        let counts = log.counts().unwrap();
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total, 1);
    }

    #[test]
    fn test_mark_failed_unknown_id() {
        let log = log();
        assert!(matches!(
            log.mark_failed("missing", "x"),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_mark_conflict_keeps_retry_count() {
        let log = log();
        let id = log
            .enqueue(OperationType::Update, "member", &json!({"a": 1}), Priority::Normal)
            .unwrap();
        log.mark_failed(&id, "timeout").unwrap();
        log.mark_conflict(&id, &json!({"a": 2})).unwrap();

        let op = log.get(&id).unwrap().unwrap();
        assert_eq!(op.retry_count, 1);
        assert_eq!(op.conflict_data, Some(json!({"a": 2})));
        assert!(log.list_pending().unwrap().is_empty());
        assert_eq!(log.list_conflicts().unwrap().len(), 1);
        assert_eq!(log.counts().unwrap().conflicts, 1);
    }

    #[test]
    fn test_resolve_conflict_resets_operation() {
        let log = log();
        let id = log
            .enqueue(OperationType::Update, "member", &json!({"a": 1}), Priority::Normal)
            .unwrap();
        log.mark_failed(&id, "stale").unwrap();
        log.mark_conflict(&id, &json!({"a": 2})).unwrap();
        log.resolve_conflict(&id, &json!({"a": 3})).unwrap();

        let op = log.get(&id).unwrap().unwrap();
        assert_eq!(op.payload, json!({"a": 3}));
        assert_eq!(op.retry_count, 0);
        assert!(op.conflict_data.is_none());
        assert!(op.last_error.is_none());
        assert_eq!(log.list_pending().unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_conflict_requires_parked_operation() {
        let log = log();
        let id = log
            .enqueue(OperationType::Update, "member", &json!({}), Priority::Normal)
            .unwrap();
        assert!(matches!(
            log.resolve_conflict(&id, &json!({})),
            Err(SyncError::InvalidInput(_))
        ));
        assert!(matches!(
            log.resolve_conflict("missing", &json!({})),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_reset_failed_only_touches_exhausted() {
        let log = log();
        let exhausted = log
            .enqueue(OperationType::Create, "member", &json!({}), Priority::Normal)
            .unwrap();
        let retrying = log
            .enqueue(OperationType::Create, "member", &json!({}), Priority::Normal)
            .unwrap();
        for _ in 0..3 {
            log.mark_failed(&exhausted, "down").unwrap();
        }
        log.mark_failed(&retrying, "down").unwrap();

        assert_eq!(log.reset_failed().unwrap(), 1);
        assert_eq!(log.get(&exhausted).unwrap().unwrap().retry_count, 0);
        assert_eq!(log.get(&retrying).unwrap().unwrap().retry_count, 1);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::types::StorageConfig {
            db_path: dir.path().join("oplog.db").to_string_lossy().to_string(),
            storage_mode: crate::types::StorageMode::Durable,
        };

        let id = {
            let log = OperationLog::new(Storage::open(config.clone()).unwrap(), 5);
            let id = log
                .enqueue(OperationType::Create, "note", &json!({"t": "x"}), Priority::Low)
                .unwrap();
            log.mark_failed(&id, "offline").unwrap();
            id
        };

        let log = OperationLog::new(Storage::open(config).unwrap(), 5);
        let op = log.get(&id).unwrap().unwrap();
        assert_eq!(op.retry_count, 1);
        assert_eq!(op.last_error.as_deref(), Some("offline"));
        assert_eq!(op.payload, json!({"t": "x"}));
    }
}
