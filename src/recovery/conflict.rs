//! Restore conflict resolution
//!
//! A conflict arises when a key's current local value differs from the
//! value being restored. `Value::Null` on either side means the key is
//! absent there; resolving to `Value::Null` removes the key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MigrationError, Result};
use crate::model::parse_timestamp;

/// Field compared by the merge strategy
const UPDATED_AT: &str = "updatedAt";

/// A key whose local and backup values differ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Store key
    pub key: String,
    /// Current local value
    pub local_value: Value,
    /// Value in the backup
    pub backup_value: Value,
}

/// How to settle a [`Conflict`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Keep the local value
    PreserveLocal,
    /// Overwrite with the backup value
    #[default]
    PreferBackup,
    /// Merge the two, local values taking precedence
    Merge,
    /// Requires interaction; always fails here
    AskUser,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreserveLocal => write!(f, "preserve_local"),
            Self::PreferBackup => write!(f, "prefer_backup"),
            Self::Merge => write!(f, "merge"),
            Self::AskUser => write!(f, "ask_user"),
        }
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "preserve_local" | "local" => Ok(Self::PreserveLocal),
            "prefer_backup" | "backup" => Ok(Self::PreferBackup),
            "merge" => Ok(Self::Merge),
            "ask_user" | "ask" => Ok(Self::AskUser),
            other => Err(MigrationError::Configuration(format!(
                "unknown conflict strategy: {other}"
            ))),
        }
    }
}

/// Resolve one conflict
pub fn resolve_conflict(conflict: &Conflict, strategy: ConflictStrategy) -> Result<Value> {
    match strategy {
        ConflictStrategy::PreserveLocal => Ok(conflict.local_value.clone()),
        ConflictStrategy::PreferBackup => Ok(conflict.backup_value.clone()),
        ConflictStrategy::Merge => Ok(merge_values(&conflict.local_value, &conflict.backup_value)),
        ConflictStrategy::AskUser => Err(MigrationError::Conflict(format!(
            "key {} needs a manual decision, which is unavailable in a non-interactive restore",
            conflict.key
        ))),
    }
}

/// Merge `local` over `backup`.
///
/// Objects carrying `updatedAt` on both sides resolve to the newer one.
/// Other objects are unioned with local fields winning; arrays of records
/// are unioned by `id` with local records winning. Anything else keeps the
/// local value unless it is absent.
pub fn merge_values(local: &Value, backup: &Value) -> Value {
    match (local, backup) {
        (Value::Null, other) => other.clone(),
        (local, Value::Null) => local.clone(),
        (Value::Object(l), Value::Object(b)) => {
            if let (Some(lt), Some(bt)) = (updated_at(l), updated_at(b)) {
                return if bt > lt { backup.clone() } else { local.clone() };
            }
            let mut merged = b.clone();
            for (key, value) in l {
                let combined = match b.get(key) {
                    Some(existing) => merge_values(value, existing),
                    None => value.clone(),
                };
                merged.insert(key.clone(), combined);
            }
            Value::Object(merged)
        }
        (Value::Array(l), Value::Array(b)) if all_have_ids(l) && all_have_ids(b) => {
            let mut merged = l.clone();
            for record in b {
                if !l.iter().any(|r| r.get("id") == record.get("id")) {
                    merged.push(record.clone());
                }
            }
            Value::Array(merged)
        }
        (local, _) => local.clone(),
    }
}

fn updated_at(record: &Map<String, Value>) -> Option<chrono::DateTime<chrono::Utc>> {
    record.get(UPDATED_AT)?.as_str().and_then(parse_timestamp)
}

fn all_have_ids(records: &[Value]) -> bool {
    records.iter().all(|r| r.get("id").is_some())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conflict(local: Value, backup: Value) -> Conflict {
        Conflict {
            key: "app:stats:u1".into(),
            local_value: local,
            backup_value: backup,
        }
    }

    #[test]
    fn test_simple_strategies() {
        let c = conflict(json!({"a": 1}), json!({"a": 2}));
        assert_eq!(
            resolve_conflict(&c, ConflictStrategy::PreserveLocal).unwrap(),
            json!({"a": 1})
        );
        assert_eq!(
            resolve_conflict(&c, ConflictStrategy::PreferBackup).unwrap(),
            json!({"a": 2})
        );
        let err = resolve_conflict(&c, ConflictStrategy::AskUser).unwrap_err();
        assert_eq!(err.kind(), "conflict_error");
    }

    #[test]
    fn test_merge_object_union_local_wins() {
        let c = conflict(json!({"a": 1, "b": {"x": 1}}), json!({"a": 2, "c": 3, "b": {"y": 2}}));
        assert_eq!(
            resolve_conflict(&c, ConflictStrategy::Merge).unwrap(),
            json!({"a": 1, "b": {"x": 1, "y": 2}, "c": 3})
        );
    }

    #[test]
    fn test_merge_newest_timestamp_wins() {
        let local = json!({"totalSessions": 4, "updatedAt": "2024-01-01T00:00:00Z"});
        let backup = json!({"totalSessions": 7, "updatedAt": "2024-02-01T00:00:00Z"});
        assert_eq!(merge_values(&local, &backup), backup);
        assert_eq!(merge_values(&backup, &local), backup);
    }

    #[test]
    fn test_merge_arrays_by_id() {
        let local = json!([{"id": "s1", "v": "local"}, {"id": "s2"}]);
        let backup = json!([{"id": "s1", "v": "backup"}, {"id": "s3"}]);
        assert_eq!(
            merge_values(&local, &backup),
            json!([{"id": "s1", "v": "local"}, {"id": "s2"}, {"id": "s3"}])
        );
    }

    #[test]
    fn test_absent_sides() {
        assert_eq!(merge_values(&Value::Null, &json!(1)), json!(1));
        assert_eq!(merge_values(&json!(1), &Value::Null), json!(1));
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!(
            "prefer-backup".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::PreferBackup
        );
        assert!("nope".parse::<ConflictStrategy>().is_err());
    }
}
