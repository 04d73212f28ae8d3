//! Engine event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::OperationId;

/// Types of engine events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    DrainStarted,
    DrainCompleted,
    DrainSkipped,
    OperationSucceeded,
    OperationFailed,
    OperationExhausted,
    ConflictResolved,
    ConflictParked,
    ExecutorMissing,
}

/// An engine event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Event type
    #[serde(rename = "type")]
    pub event_type: SyncEventType,
    pub timestamp: DateTime<Utc>,
    /// Related operation (if applicable)
    pub operation_id: Option<OperationId>,
    /// Entity of the related operation
    pub entity: Option<String>,
    /// Additional data
    pub data: Option<serde_json::Value>,
}

impl SyncEvent {
    fn new(event_type: SyncEventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type,
            timestamp,
            operation_id: None,
            entity: None,
            data: None,
        }
    }

    fn for_operation(
        event_type: SyncEventType,
        timestamp: DateTime<Utc>,
        id: &str,
        entity: &str,
    ) -> Self {
        Self {
            operation_id: Some(id.to_string()),
            entity: Some(entity.to_string()),
            ..Self::new(event_type, timestamp)
        }
    }

    pub fn drain_started(timestamp: DateTime<Utc>, pending: usize) -> Self {
        Self {
            data: Some(serde_json::json!({ "pending": pending })),
            ..Self::new(SyncEventType::DrainStarted, timestamp)
        }
    }

    pub fn drain_completed(timestamp: DateTime<Utc>, dispatched: usize, succeeded: usize) -> Self {
        Self {
            data: Some(serde_json::json!({
                "dispatched": dispatched,
                "succeeded": succeeded,
            })),
            ..Self::new(SyncEventType::DrainCompleted, timestamp)
        }
    }

    pub fn drain_skipped(timestamp: DateTime<Utc>, reason: &str) -> Self {
        Self {
            data: Some(serde_json::json!({ "reason": reason })),
            ..Self::new(SyncEventType::DrainSkipped, timestamp)
        }
    }

    pub fn operation_succeeded(timestamp: DateTime<Utc>, id: &str, entity: &str) -> Self {
        Self::for_operation(SyncEventType::OperationSucceeded, timestamp, id, entity)
    }

    pub fn operation_failed(
        timestamp: DateTime<Utc>,
        id: &str,
        entity: &str,
        retry_count: u32,
        error: &str,
    ) -> Self {
        Self {
            data: Some(serde_json::json!({
                "retryCount": retry_count,
                "error": error,
            })),
            ..Self::for_operation(SyncEventType::OperationFailed, timestamp, id, entity)
        }
    }

    pub fn operation_exhausted(timestamp: DateTime<Utc>, id: &str, entity: &str) -> Self {
        Self::for_operation(SyncEventType::OperationExhausted, timestamp, id, entity)
    }

    pub fn conflict_resolved(
        timestamp: DateTime<Utc>,
        id: &str,
        entity: &str,
        strategy: &str,
    ) -> Self {
        Self {
            data: Some(serde_json::json!({ "strategy": strategy })),
            ..Self::for_operation(SyncEventType::ConflictResolved, timestamp, id, entity)
        }
    }

    pub fn conflict_parked(timestamp: DateTime<Utc>, id: &str, entity: &str) -> Self {
        Self::for_operation(SyncEventType::ConflictParked, timestamp, id, entity)
    }

    pub fn executor_missing(timestamp: DateTime<Utc>, id: &str, entity: &str) -> Self {
        Self::for_operation(SyncEventType::ExecutorMissing, timestamp, id, entity)
    }
}

/// Subscription filter for events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Only events for these entities
    pub entities: Option<Vec<String>>,
    /// Only these event types
    pub event_types: Option<Vec<SyncEventType>>,
}

impl EventFilter {
    /// Check if an event matches this filter
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }

        if let Some(ref entities) = self.entities {
            match event.entity {
                Some(ref entity) if entities.contains(entity) => {}
                // Drain-level events carry no entity and pass an entity filter
                None => {}
                Some(_) => return false,
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = SyncEvent::operation_failed(Utc::now(), "op-1", "member", 2, "timeout");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "operation_failed");
        assert_eq!(value["operation_id"], "op-1");
        assert_eq!(value["data"]["retryCount"], 2);
    }

    #[test]
    fn test_filter() {
        let filter = EventFilter {
            entities: Some(vec!["member".into()]),
            event_types: Some(vec![
                SyncEventType::OperationSucceeded,
                SyncEventType::DrainCompleted,
            ]),
        };

        assert!(filter.matches(&SyncEvent::operation_succeeded(Utc::now(), "1", "member")));
        assert!(!filter.matches(&SyncEvent::operation_succeeded(Utc::now(), "1", "note")));
        assert!(!filter.matches(&SyncEvent::conflict_parked(Utc::now(), "1", "member")));
        assert!(filter.matches(&SyncEvent::drain_completed(Utc::now(), 3, 3)));
    }
}
