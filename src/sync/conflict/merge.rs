//! Field-level merge of two JSON records

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key holding a record's last modification time
pub const UPDATED_AT_KEY: &str = "updatedAt";
/// Marker added to merged records
pub const MERGED_AT_KEY: &str = "mergedAt";

/// Result of a field-level merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    /// The merged record
    pub record: Value,
    /// Statistics about the merge
    pub stats: MergeStats,
}

/// Statistics about a merge operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Fields present only in the local copy
    pub local_only: usize,
    /// Fields present only in the server copy
    pub server_only: usize,
    /// Contested fields taken from the local copy
    pub from_local: usize,
    /// Contested fields taken from the server copy
    pub from_server: usize,
}

/// Field-level merge
///
/// Fields present on one side only survive. Fields present on both sides are
/// taken from the copy with the newer `updatedAt`; on a tie, or when neither
/// side carries one, local wins. The result gets a fresh `updatedAt` and a
/// `mergedAt` marker, both set to the `now` passed in.
#[derive(Debug, Clone)]
pub struct FieldMerge {
    updated_at_key: String,
    merged_at_key: String,
}

impl Default for FieldMerge {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldMerge {
    pub fn new() -> Self {
        Self {
            updated_at_key: UPDATED_AT_KEY.to_string(),
            merged_at_key: MERGED_AT_KEY.to_string(),
        }
    }

    /// Use different timestamp/marker field names
    pub fn with_keys(mut self, updated_at: impl Into<String>, merged_at: impl Into<String>) -> Self {
        self.updated_at_key = updated_at.into();
        self.merged_at_key = merged_at.into();
        self
    }

    /// Merge `local` and `server`
    pub fn merge(&self, local: &Value, server: &Value, now: DateTime<Utc>) -> MergeResult {
        self.merge_with_local_time(local, server, None, now)
    }

    /// Merge `local` and `server`, falling back to `local_modified` as the
    /// local side's modification time when `local` has no `updatedAt`
    pub fn merge_with_local_time(
        &self,
        local: &Value,
        server: &Value,
        local_modified: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> MergeResult {
        let local_ts = self
            .updated_at_millis(local)
            .or_else(|| local_modified.map(|t| t.timestamp_millis()));
        let server_newer = is_newer(self.updated_at_millis(server), local_ts);

        let (local_map, server_map) = match (local.as_object(), server.as_object()) {
            (Some(l), Some(s)) => (l, s),
            // Not records: nothing to merge field by field
            _ => {
                let record = if server_newer { server } else { local };
                return MergeResult {
                    record: record.clone(),
                    stats: MergeStats::default(),
                };
            }
        };

        let mut stats = MergeStats::default();
        let mut merged = Map::new();

        for (key, local_value) in local_map {
            if self.is_marker(key) {
                continue;
            }
            match server_map.get(key) {
                Some(server_value) if server_newer => {
                    merged.insert(key.clone(), server_value.clone());
                    stats.from_server += 1;
                }
                Some(_) => {
                    merged.insert(key.clone(), local_value.clone());
                    stats.from_local += 1;
                }
                None => {
                    merged.insert(key.clone(), local_value.clone());
                    stats.local_only += 1;
                }
            }
        }

        for (key, server_value) in server_map {
            if self.is_marker(key) || local_map.contains_key(key) {
                continue;
            }
            merged.insert(key.clone(), server_value.clone());
            stats.server_only += 1;
        }

        let stamp = self.fresh_stamp(local_map, server_map, now);
        merged.insert(self.updated_at_key.clone(), stamp.clone());
        merged.insert(self.merged_at_key.clone(), stamp);

        MergeResult {
            record: Value::Object(merged),
            stats,
        }
    }

    fn is_marker(&self, key: &str) -> bool {
        key == self.updated_at_key || key == self.merged_at_key
    }

    /// Read `updatedAt` as epoch millis. Accepts numbers, numeric strings and
    /// RFC 3339 strings.
    pub fn updated_at_millis(&self, record: &Value) -> Option<i64> {
        parse_millis(record.get(&self.updated_at_key)?)
    }

    /// The fresh stamp keeps the representation the inputs use: RFC 3339 when
    /// the record being kept stores `updatedAt` as text, epoch millis otherwise.
    fn fresh_stamp(&self, local: &Map<String, Value>, server: &Map<String, Value>, now: DateTime<Utc>) -> Value {
        let textual = local
            .get(&self.updated_at_key)
            .or_else(|| server.get(&self.updated_at_key))
            .map(Value::is_string)
            .unwrap_or(false);
        if textual {
            Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true))
        } else {
            Value::from(now.timestamp_millis())
        }
    }
}

/// Server wins only with a strictly newer stamp, or when it is the only side
/// with one
fn is_newer(server: Option<i64>, local: Option<i64>) -> bool {
    match (local, server) {
        (Some(l), Some(s)) => s > l,
        (None, Some(_)) => true,
        _ => false,
    }
}

fn parse_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis())
        }),
        _ => None,
    }
}
