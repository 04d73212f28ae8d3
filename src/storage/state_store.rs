//! Persisted sync state snapshot
//!
//! A cache of the engine's health, not a source of truth. The scheduler is the
//! only writer; reads never trigger a drain. Persisting is fire-and-forget: a
//! failed write is logged and the in-memory snapshot stays authoritative for
//! readers.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use tokio::sync::broadcast;

use super::Storage;
use crate::error::Result;
use crate::types::{LogCounts, SyncState};

/// Key the snapshot is stored under in `sync_meta`
pub const SYNC_STATE_KEY: &str = "sync_state";

/// Read-mostly snapshot of the engine's health
pub struct SyncStateStore {
    storage: Storage,
    state: RwLock<SyncState>,
    tx: broadcast::Sender<SyncState>,
}

impl SyncStateStore {
    /// Load the last persisted snapshot so a cold start shows consistent
    /// counts before the first drain completes.
    pub fn load(storage: Storage) -> Self {
        let mut state = match read_snapshot(&storage) {
            Ok(Some(state)) => state,
            Ok(None) => SyncState::default(),
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable sync state snapshot");
                SyncState::default()
            }
        };
        // No drain survives a restart
        state.is_running = false;

        let (tx, _) = broadcast::channel(64);
        Self {
            storage,
            state: RwLock::new(state),
            tx,
        }
    }

    /// Current snapshot
    pub fn get(&self) -> SyncState {
        self.state.read().clone()
    }

    /// Receive every state change
    pub fn subscribe(&self) -> broadcast::Receiver<SyncState> {
        self.tx.subscribe()
    }

    /// Apply a change, persist it and notify subscribers
    pub fn update<F>(&self, f: F) -> SyncState
    where
        F: FnOnce(&mut SyncState),
    {
        let snapshot = {
            let mut state = self.state.write();
            f(&mut state);
            state.clone()
        };

        if let Err(e) = write_snapshot(&self.storage, &snapshot) {
            tracing::warn!(error = %e, "failed to persist sync state");
        }
        let _ = self.tx.send(snapshot.clone());
        snapshot
    }

    /// Drain start: `is_running = true`
    pub fn mark_running(&self) -> SyncState {
        self.update(|state| state.is_running = true)
    }

    /// Drain end: counts recomputed from the log, `is_running = false`.
    /// `completed_at` is only set when the drain finished without a
    /// drain-level error.
    pub fn mark_finished(
        &self,
        counts: Option<LogCounts>,
        completed_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> SyncState {
        self.update(|state| {
            state.is_running = false;
            if let Some(counts) = counts {
                apply_counts(state, counts);
            }
            if let Some(at) = completed_at {
                state.last_sync_timestamp = Some(at);
            }
            state.last_error = error;
        })
    }

    /// Drain abandoned before it finished (its future was dropped).
    /// Clears `is_running` and leaves the last result untouched.
    pub fn mark_interrupted(&self, counts: Option<LogCounts>) -> SyncState {
        self.update(|state| {
            state.is_running = false;
            if let Some(counts) = counts {
                apply_counts(state, counts);
            }
        })
    }

    /// Refresh counts outside of a drain (after enqueue or a manual reset)
    pub fn refresh_counts(&self, counts: LogCounts) -> SyncState {
        self.update(|state| apply_counts(state, counts))
    }
}

fn apply_counts(state: &mut SyncState, counts: LogCounts) {
    state.pending_count = counts.pending;
    state.failed_count = counts.failed;
    state.conflict_count = counts.conflicts;
}

fn read_snapshot(storage: &Storage) -> Result<Option<SyncState>> {
    storage.with_connection(|conn| {
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?",
                params![SYNC_STATE_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    })
}

fn write_snapshot(storage: &Storage, state: &SyncState) -> Result<()> {
    let value = serde_json::to_string(state)?;
    storage.with_connection(|conn| {
        conn.execute(
            "INSERT INTO sync_meta (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![SYNC_STATE_KEY, value],
        )?;
        Ok(())
    })
}
