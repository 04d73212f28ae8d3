//! Core types for offsync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::sync::conflict::ConflictStrategy;

/// Unique identifier for a queued operation
pub type OperationId = String;

/// Kind of mutation a queued operation replays remotely
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            _ => Err(format!("Unknown operation type: {}", s)),
        }
    }
}

/// Dispatch priority tier. Declared in dispatch order so the derived `Ord`
/// sorts `Critical` first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// A single pending mutation in the operation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Unique identifier, assigned at enqueue time
    pub id: OperationId,
    /// Mutation kind
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Logical entity the operation targets (e.g. "member")
    pub entity: String,
    /// Entity-specific data needed to replay the mutation
    pub payload: serde_json::Value,
    /// When the operation was created locally
    pub local_timestamp: DateTime<Utc>,
    pub priority: Priority,
    /// Number of prior failed attempts
    #[serde(default)]
    pub retry_count: u32,
    /// Most recent failure message
    pub last_error: Option<String>,
    /// Server version awaiting manual resolution
    pub conflict_data: Option<serde_json::Value>,
}

impl SyncOperation {
    /// Whether this operation has exhausted its retries
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    /// Whether this operation is parked on a manual conflict
    pub fn is_parked(&self) -> bool {
        self.conflict_data.is_some()
    }
}

/// Process-wide sync summary. Derived from the log and cached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub pending_count: u64,
    pub failed_count: u64,
    /// Operations parked on a manual conflict
    #[serde(default)]
    pub conflict_count: u64,
    pub is_running: bool,
    pub last_error: Option<String>,
}

/// Row counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCounts {
    pub pending: u64,
    pub failed: u64,
    pub conflicts: u64,
    pub total: u64,
}

/// Connectivity snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Link-layer connectivity
    pub is_connected: bool,
    /// Actual reachability of the internet
    pub is_internet_reachable: bool,
}

impl NetworkStatus {
    pub fn online() -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: true,
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }

    /// Only a link that is both up and reachable may trigger a drain
    pub fn is_usable(&self) -> bool {
        self.is_connected && self.is_internet_reachable
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    pub db_path: String,
    /// Durability mode
    #[serde(default)]
    pub storage_mode: StorageMode,
}

impl StorageConfig {
    pub fn in_memory() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            storage_mode: StorageMode::Local,
        }
    }
}

/// How hard the log fsyncs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// WAL with synchronous=NORMAL
    #[default]
    Local,
    /// WAL with synchronous=FULL: a committed enqueue survives power loss
    Durable,
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(StorageMode::Local),
            "durable" => Ok(StorageMode::Durable),
            _ => Err(format!("Unknown storage mode: {}", s)),
        }
    }
}

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Operations dispatched concurrently per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Failed attempts before an operation is considered permanently failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff base delay in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Default conflict strategy
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    /// Connectivity poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Periodic background wake interval in seconds
    #[serde(default = "default_wake_interval")]
    pub wake_interval_secs: u64,
    /// Start a drain right after `queue` when online
    #[serde(default = "default_true")]
    pub drain_on_enqueue: bool,
    /// Schedule backoff re-drains after failures
    #[serde(default = "default_true")]
    pub auto_retry: bool,
}

fn default_batch_size() -> usize {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_poll_interval() -> u64 {
    5_000
}

fn default_wake_interval() -> u64 {
    15 * 60
}

fn default_true() -> bool {
    true
}

/// Accepted connectivity poll interval range in milliseconds
pub const POLL_INTERVAL_RANGE_MS: std::ops::RangeInclusive<u64> = 2_000..=15_000;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            conflict_strategy: ConflictStrategy::default(),
            poll_interval_ms: default_poll_interval(),
            wake_interval_secs: default_wake_interval(),
            drain_on_enqueue: true,
            auto_retry: true,
        }
    }
}

impl EngineConfig {
    /// Reject configurations the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(SyncError::Config("max_retries must be at least 1".into()));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(SyncError::Config(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !POLL_INTERVAL_RANGE_MS.contains(&self.poll_interval_ms) {
            return Err(SyncError::Config(format!(
                "poll_interval_ms must be between {} and {}, got {}",
                POLL_INTERVAL_RANGE_MS.start(),
                POLL_INTERVAL_RANGE_MS.end(),
                self.poll_interval_ms
            )));
        }
        if self.wake_interval_secs == 0 {
            return Err(SyncError::Config(
                "wake_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let mut tiers = vec![Priority::Low, Priority::Critical, Priority::Normal, Priority::High];
        tiers.sort();
        assert_eq!(
            tiers,
            vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
        );
    }

    #[test]
    fn test_operation_serializes_camel_case() {
        let op = SyncOperation {
            id: "1".into(),
            op_type: OperationType::Update,
            entity: "member".into(),
            payload: serde_json::json!({"name": "Ada"}),
            local_timestamp: Utc::now(),
            priority: Priority::High,
            retry_count: 2,
            last_error: None,
            conflict_data: None,
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["priority"], "high");
        assert_eq!(value["retryCount"], 2);
        assert!(value.get("localTimestamp").is_some());
    }

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay_ms, 1_000);
        assert_eq!(config.max_delay_ms, 60_000);
        assert_eq!(config.conflict_strategy, ConflictStrategy::Merge);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = EngineConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let config = EngineConfig {
            poll_interval_ms: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            base_delay_ms: 90_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_network_usable_requires_both() {
        let captive = NetworkStatus {
            is_connected: true,
            is_internet_reachable: false,
        };
        assert!(!captive.is_usable());
        assert!(NetworkStatus::online().is_usable());
        assert!(!NetworkStatus::offline().is_usable());
    }
}
