//! Conflict resolution between local and server records
//!
//! Provides:
//! - Resolution strategies (local-wins, server-wins, merge, manual)
//! - Field-level merge keyed on `updatedAt`
//! - Per-entity strategy overrides and custom merges

mod merge;
mod resolver;

pub use merge::{FieldMerge, MergeResult, MergeStats, MERGED_AT_KEY, UPDATED_AT_KEY};
pub use resolver::{ConflictResolver, ConflictStrategy, CustomMerge, Resolution};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Both sides of an unresolved conflict, as handed to whoever makes the
/// manual decision. Serializes as `{"conflict": true, "local": .., "server": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEnvelope {
    pub conflict: bool,
    pub local: Value,
    pub server: Value,
}

impl ConflictEnvelope {
    pub fn new(local: Value, server: Value) -> Self {
        Self {
            conflict: true,
            local,
            server,
        }
    }
}
