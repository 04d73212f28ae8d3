//! Storage engine for offsync
//!
//! Handles SQLite connection setup, schema management, the durable operation
//! log and the persisted state snapshot.

mod connection;
mod migrations;
pub mod oplog;
pub mod state_store;

pub use connection::Storage;
pub use migrations::SCHEMA_VERSION;
pub use oplog::{new_operation_id, OperationLog};
pub use state_store::{SyncStateStore, SYNC_STATE_KEY};
