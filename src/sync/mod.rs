//! Sync scheduling, conflict resolution and connectivity
//!
//! The [`SyncEngine`] replays the durable operation log against the remote
//! side whenever the [`NetworkMonitor`] reports usable connectivity. The
//! [`SyncWorker`] owns the background triggers (reconnect and periodic wake).

pub mod backoff;
pub mod clock;
pub mod conflict;
pub mod engine;
pub mod events;
pub mod executor;
pub mod network;
mod worker;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::{
    ConflictEnvelope, ConflictResolver, ConflictStrategy, CustomMerge, FieldMerge, MergeResult,
    MergeStats, Resolution, MERGED_AT_KEY, UPDATED_AT_KEY,
};
pub use engine::{sort_for_dispatch, DrainOutcome, DrainReport, SyncEngine};
pub use events::{EventFilter, SyncEvent, SyncEventType};
pub use executor::{executor_fn, EntityExecutor, ExecutionOutcome, ExecutorRegistry, FnExecutor};
pub use network::{ConnectivityProbe, ManualProbe, NetworkEvent, NetworkMonitor, TcpProbe};
pub use worker::{SyncCommand, SyncWorker};
