//! Offsync - offline-first sync engine
//!
//! Local mutations are written to a durable operation log and replayed
//! against the remote side when connectivity allows, with bounded retries,
//! exponential backoff and pluggable conflict resolution.

pub mod error;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{Result, SyncError};
pub use storage::{OperationLog, Storage, SyncStateStore};
pub use sync::{
    executor_fn, ConflictStrategy, DrainOutcome, DrainReport, EntityExecutor, ExecutionOutcome,
    NetworkMonitor, SyncEngine, SyncWorker,
};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
