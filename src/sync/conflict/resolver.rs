//! Conflict resolution strategies

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ConflictEnvelope, FieldMerge};

/// Resolution strategy for conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Keep local changes verbatim.
    ///
    /// The operation is re-sent unchanged, so a server that keeps rejecting
    /// it with a conflict gets it again every base delay. It never counts
    /// against `max_retries`; pick `Merge` or `Manual` for entities whose
    /// server can refuse a record indefinitely.
    LocalWins,
    /// Adopt the server version
    ServerWins,
    /// Field-level merge by `updatedAt`
    #[default]
    Merge,
    /// Park the operation until an external decision
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LocalWins => "local-wins",
            ConflictStrategy::ServerWins => "server-wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "local-wins" => Ok(ConflictStrategy::LocalWins),
            "server-wins" => Ok(ConflictStrategy::ServerWins),
            "merge" => Ok(ConflictStrategy::Merge),
            "manual" => Ok(ConflictStrategy::Manual),
            _ => Err(format!("Unknown conflict strategy: {}", s)),
        }
    }
}

/// Caller-supplied merge for one entity type: `(local, server, now) -> merged`
pub type CustomMerge = Arc<dyn Fn(&Value, &Value, DateTime<Utc>) -> Value + Send + Sync>;

/// Outcome of resolving a conflict
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The record to treat as current
    Resolved {
        strategy: ConflictStrategy,
        record: Value,
    },
    /// Needs an external decision
    Manual(ConflictEnvelope),
}

impl Resolution {
    pub fn is_manual(&self) -> bool {
        matches!(self, Resolution::Manual(_))
    }

    /// The resolved record, if one was produced
    pub fn record(&self) -> Option<&Value> {
        match self {
            Resolution::Resolved { record, .. } => Some(record),
            Resolution::Manual(_) => None,
        }
    }
}

/// Conflict resolver with a default strategy, per-entity overrides and
/// per-entity custom merges.
///
/// Resolution is a pure function of its inputs: the only notion of time is
/// the `now` the caller passes in.
#[derive(Clone, Default)]
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
    entity_strategies: HashMap<String, ConflictStrategy>,
    custom_merges: HashMap<String, CustomMerge>,
    merger: FieldMerge,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("default_strategy", &self.default_strategy)
            .field("entity_strategies", &self.entity_strategies)
            .field(
                "custom_merges",
                &self.custom_merges.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ConflictResolver {
    /// Create a resolver with the given default strategy
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self {
            default_strategy,
            ..Default::default()
        }
    }

    pub fn default_strategy(&self) -> ConflictStrategy {
        self.default_strategy
    }

    /// Override the strategy for one entity type
    pub fn set_entity_strategy(&mut self, entity: impl Into<String>, strategy: ConflictStrategy) {
        self.entity_strategies.insert(entity.into(), strategy);
    }

    /// Replace the default field merge for one entity type
    pub fn set_custom_merge<F>(&mut self, entity: impl Into<String>, merge: F)
    where
        F: Fn(&Value, &Value, DateTime<Utc>) -> Value + Send + Sync + 'static,
    {
        self.custom_merges.insert(entity.into(), Arc::new(merge));
    }

    /// Strategy in effect for an entity
    pub fn strategy_for(&self, entity: &str) -> ConflictStrategy {
        self.entity_strategies
            .get(entity)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Resolve a conflict between the local record and the server's current one
    pub fn resolve(
        &self,
        entity: &str,
        local: &Value,
        server: &Value,
        now: DateTime<Utc>,
    ) -> Resolution {
        self.resolve_with_local_time(entity, local, None, server, now)
    }

    /// Like [`resolve`](Self::resolve), with the time the local change was
    /// made. The field merge uses it when `local` carries no `updatedAt`.
    pub fn resolve_with_local_time(
        &self,
        entity: &str,
        local: &Value,
        local_modified: Option<DateTime<Utc>>,
        server: &Value,
        now: DateTime<Utc>,
    ) -> Resolution {
        let strategy = self.strategy_for(entity);
        let record = match strategy {
            ConflictStrategy::LocalWins => local.clone(),
            ConflictStrategy::ServerWins => server.clone(),
            ConflictStrategy::Merge => match self.custom_merges.get(entity) {
                Some(custom) => custom(local, server, now),
                None => {
                    self.merger
                        .merge_with_local_time(local, server, local_modified, now)
                        .record
                }
            },
            ConflictStrategy::Manual => {
                return Resolution::Manual(ConflictEnvelope::new(local.clone(), server.clone()))
            }
        };
        Resolution::Resolved { strategy, record }
    }
}
