//! Per-entity executors
//!
//! The engine knows nothing about remote endpoint shapes. Each entity type
//! registers an executor that turns a [`SyncOperation`] into a concrete remote
//! call and reports how it went. Executors own their timeouts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::SyncOperation;

/// What happened when an operation was replayed remotely
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The server accepted the mutation
    Success,
    /// The server rejected the mutation because its copy differs
    Conflict {
        #[serde(rename = "serverSnapshot")]
        server_snapshot: serde_json::Value,
    },
    /// Transport or server failure; retried with backoff
    Failure { error: String },
}

impl ExecutionOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        ExecutionOutcome::Failure {
            error: error.into(),
        }
    }

    pub fn conflict(server_snapshot: serde_json::Value) -> Self {
        ExecutionOutcome::Conflict { server_snapshot }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success)
    }
}

/// Replays operations for one entity type against the remote side.
///
/// Delivery is at-least-once, so implementations should pass `operation.id`
/// as an idempotency key when the remote protocol has one.
#[async_trait]
pub trait EntityExecutor: Send + Sync {
    async fn execute(&self, operation: &SyncOperation) -> ExecutionOutcome;
}

/// Adapter turning an async closure into an [`EntityExecutor`]
pub struct FnExecutor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EntityExecutor for FnExecutor<F>
where
    F: Fn(SyncOperation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecutionOutcome> + Send + 'static,
{
    async fn execute(&self, operation: &SyncOperation) -> ExecutionOutcome {
        (self.f)(operation.clone()).await
    }
}

/// Wrap an async closure as an executor
///
/// ```rust,ignore
/// engine.register_executor("member", executor_fn(|op| async move {
///     client.put_member(&op.id, &op.payload).await
/// }));
/// ```
pub fn executor_fn<F, Fut>(f: F) -> Arc<dyn EntityExecutor>
where
    F: Fn(SyncOperation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecutionOutcome> + Send + 'static,
{
    Arc::new(FnExecutor { f })
}

/// Executors keyed by entity name
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn EntityExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for an entity type
    pub fn register(&self, entity: impl Into<String>, executor: Arc<dyn EntityExecutor>) {
        let entity = entity.into();
        if self
            .executors
            .write()
            .insert(entity.clone(), executor)
            .is_some()
        {
            tracing::debug!(entity = %entity, "replaced entity executor");
        }
    }

    /// Remove an entity's executor
    pub fn unregister(&self, entity: &str) -> bool {
        self.executors.write().remove(entity).is_some()
    }

    pub fn get(&self, entity: &str) -> Option<Arc<dyn EntityExecutor>> {
        self.executors.read().get(entity).cloned()
    }

    pub fn entities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.executors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationType, Priority};
    use chrono::Utc;
    use serde_json::json;

    fn op(entity: &str) -> SyncOperation {
        SyncOperation {
            id: "op-1".into(),
            op_type: OperationType::Create,
            entity: entity.into(),
            payload: json!({"n": 1}),
            local_timestamp: Utc::now(),
            priority: Priority::Normal,
            retry_count: 0,
            last_error: None,
            conflict_data: None,
        }
    }

    #[tokio::test]
    async fn test_registry_routes_by_entity() {
        let registry = ExecutorRegistry::new();
        registry.register("member", executor_fn(|_| async { ExecutionOutcome::Success }));
        registry.register(
            "note",
            executor_fn(|op| async move { ExecutionOutcome::failure(format!("no route for {}", op.id)) }),
        );

        let member = registry.get("member").unwrap();
        assert!(member.execute(&op("member")).await.is_success());

        let note = registry.get("note").unwrap();
        assert_eq!(
            note.execute(&op("note")).await,
            ExecutionOutcome::failure("no route for op-1")
        );

        assert!(registry.get("relationship").is_none());
        assert_eq!(registry.entities(), vec!["member", "note"]);
    }

    #[test]
    fn test_unregister() {
        let registry = ExecutorRegistry::new();
        registry.register("member", executor_fn(|_| async { ExecutionOutcome::Success }));
        assert!(registry.unregister("member"));
        assert!(!registry.unregister("member"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_outcome_wire_shape() {
        let conflict = ExecutionOutcome::conflict(json!({"v": 2}));
        assert_eq!(
            serde_json::to_value(&conflict).unwrap(),
            json!({"outcome": "conflict", "serverSnapshot": {"v": 2}})
        );
    }
}
