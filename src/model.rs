//! Typed application records and the export dataset
//!
//! Records are stored in the local key-value store as camelCase JSON
//! documents. Every entity keeps unknown fields in `extra` so that a
//! backup/restore or a migration never drops data the engine does not model.
//! Most fields default when absent: a partial record still extracts, and the
//! validator reports what is missing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current export dataset schema version
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A user profile from the user index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// User identifier
    #[serde(default)]
    pub id: String,
    /// Contact email
    #[serde(default)]
    pub email: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Creation timestamp (ISO-8601)
    #[serde(default)]
    pub created_at: String,
    /// Last update timestamp (ISO-8601)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Application preferences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<UserPreferences>,
    /// Fields not modelled by the engine
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-user application preferences
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    /// UI theme (light, dark, system)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    /// Focus session length in minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_duration: Option<i64>,
    /// Break length in minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_duration: Option<i64>,
    /// Desktop notifications enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<bool>,
    /// Sounds enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound_enabled: Option<bool>,
    /// Fields not modelled by the engine
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A focus or break session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session identifier
    #[serde(default)]
    pub id: String,
    /// Owning user
    #[serde(default)]
    pub user_id: String,
    /// Start timestamp (ISO-8601)
    #[serde(default)]
    pub start_time: String,
    /// End timestamp (ISO-8601)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    /// Planned duration in minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// active, paused, completed or stopped
    #[serde(default)]
    pub status: String,
    /// focus, short_break or long_break
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<String>,
    /// Set when the session completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// Set when the session was stopped early
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
    /// Free-form notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Fields not modelled by the engine
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Session {
    /// Whether the session ended normally
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    /// Whether the session was stopped early
    pub fn is_stopped(&self) -> bool {
        self.status == "stopped"
    }
}

/// Aggregated per-user statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    /// Owning user
    #[serde(default)]
    pub user_id: String,
    /// Sessions started
    #[serde(default)]
    pub total_sessions: i64,
    /// Sessions completed
    #[serde(default)]
    pub completed_sessions: i64,
    /// Sessions stopped early
    #[serde(default)]
    pub stopped_sessions: i64,
    /// Minutes spent in focus sessions
    #[serde(default)]
    pub total_focus_minutes: i64,
    /// Minutes spent in completed focus sessions
    #[serde(default)]
    pub completed_focus_minutes: i64,
    /// Current daily streak
    #[serde(default)]
    pub current_streak: i64,
    /// Longest daily streak
    #[serde(default)]
    pub longest_streak: i64,
    /// Date of the most recent session (YYYY-MM-DD)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session_date: Option<String>,
    /// Last update timestamp (ISO-8601)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Fields not modelled by the engine
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A scheduled meeting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    /// Meeting identifier
    #[serde(default)]
    pub id: String,
    /// Owning user
    #[serde(default)]
    pub user_id: String,
    /// Title
    #[serde(default)]
    pub title: String,
    /// Calendar date (YYYY-MM-DD)
    #[serde(default)]
    pub date: String,
    /// Clock time (HH:MM)
    #[serde(default)]
    pub time: String,
    /// Duration in minutes
    #[serde(default)]
    pub duration: i64,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Creation timestamp (ISO-8601)
    #[serde(default)]
    pub created_at: String,
    /// Last update timestamp (ISO-8601)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Fields not modelled by the engine
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// ExportDataset
// ---------------------------------------------------------------------------

/// Computed record counts for a dataset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStatistics {
    /// Number of user profiles
    pub total_users: usize,
    /// Number of sessions across all users
    pub total_sessions: usize,
    /// Number of stats records
    pub total_stats: usize,
    /// Number of meetings across all users
    pub total_meetings: usize,
    /// Number of active sessions
    pub total_active_sessions: usize,
}

impl DatasetStatistics {
    /// Total number of records of every kind
    pub fn total_records(&self) -> usize {
        self.total_users
            + self.total_sessions
            + self.total_stats
            + self.total_meetings
            + self.total_active_sessions
    }
}

/// Export provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    /// When the export was taken
    pub exported_at: DateTime<Utc>,
    /// Where the data came from
    pub source: String,
    /// Record counts at export time
    pub statistics: DatasetStatistics,
}

/// A structured copy of user-owned records keyed by user id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDataset {
    /// Dataset schema version
    pub schema_version: u32,
    /// User profiles by id
    pub users: BTreeMap<String, UserProfile>,
    /// Sessions by owner id
    #[serde(default)]
    pub sessions: BTreeMap<String, Vec<Session>>,
    /// Statistics by owner id
    #[serde(default)]
    pub stats: BTreeMap<String, UserStats>,
    /// Meetings by owner id
    #[serde(default)]
    pub meetings: BTreeMap<String, Vec<Meeting>>,
    /// Currently running session by owner id
    #[serde(default)]
    pub active_sessions: BTreeMap<String, Session>,
    /// Export provenance
    pub metadata: ExportMetadata,
}

impl ExportDataset {
    /// Create an empty dataset stamped with the current time
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            users: BTreeMap::new(),
            sessions: BTreeMap::new(),
            stats: BTreeMap::new(),
            meetings: BTreeMap::new(),
            active_sessions: BTreeMap::new(),
            metadata: ExportMetadata {
                exported_at: Utc::now(),
                source: source.into(),
                statistics: DatasetStatistics::default(),
            },
        }
    }

    /// Count the records currently held
    pub fn compute_statistics(&self) -> DatasetStatistics {
        DatasetStatistics {
            total_users: self.users.len(),
            total_sessions: self.sessions.values().map(Vec::len).sum(),
            total_stats: self.stats.len(),
            total_meetings: self.meetings.values().map(Vec::len).sum(),
            total_active_sessions: self.active_sessions.len(),
        }
    }

    /// Recompute and store the metadata statistics
    pub fn refresh_statistics(&mut self) {
        self.metadata.statistics = self.compute_statistics();
    }

    /// Total number of records
    pub fn record_count(&self) -> usize {
        self.compute_statistics().total_records()
    }

    /// Whether the dataset holds no users
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Sessions owned by `user_id`
    pub fn sessions_for(&self, user_id: &str) -> &[Session] {
        self.sessions.get(user_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Meetings owned by `user_id`
    pub fn meetings_for(&self, user_id: &str) -> &[Meeting] {
        self.meetings.get(user_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Copy one user's records into a new dataset
    pub fn subset(&self, user_id: &str) -> Self {
        let mut subset = Self::new(self.metadata.source.clone());
        if let Some(user) = self.users.get(user_id) {
            subset.users.insert(user_id.to_string(), user.clone());
        }
        if let Some(sessions) = self.sessions.get(user_id) {
            subset.sessions.insert(user_id.to_string(), sessions.clone());
        }
        if let Some(stats) = self.stats.get(user_id) {
            subset.stats.insert(user_id.to_string(), stats.clone());
        }
        if let Some(meetings) = self.meetings.get(user_id) {
            subset.meetings.insert(user_id.to_string(), meetings.clone());
        }
        if let Some(active) = self.active_sessions.get(user_id) {
            subset.active_sessions.insert(user_id.to_string(), active.clone());
        }
        subset.refresh_statistics();
        subset
    }
}

/// Parse an ISO-8601 timestamp, with or without an offset
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_fields_preserved() {
        let raw = json!({
            "id": "s1",
            "userId": "u1",
            "startTime": "2024-01-01T10:00:00Z",
            "status": "completed",
            "mood": "great"
        });
        let session: Session = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(session.extra.get("mood"), Some(&json!("great")));
        assert_eq!(serde_json::to_value(&session).unwrap(), raw);
    }

    #[test]
    fn test_partial_record_defaults() {
        let user: UserProfile = serde_json::from_value(json!({"id": "u1"})).unwrap();
        assert_eq!(user.id, "u1");
        assert!(user.email.is_empty());
        assert!(user.preferences.is_none());
    }

    #[test]
    fn test_statistics_and_subset() {
        let mut dataset = ExportDataset::new("test");
        for uid in ["u1", "u2"] {
            dataset.users.insert(
                uid.to_string(),
                UserProfile {
                    id: uid.to_string(),
                    ..Default::default()
                },
            );
            dataset.sessions.insert(
                uid.to_string(),
                vec![Session::default(), Session::default()],
            );
        }
        dataset.refresh_statistics();
        assert_eq!(dataset.metadata.statistics.total_users, 2);
        assert_eq!(dataset.metadata.statistics.total_sessions, 4);
        assert_eq!(dataset.record_count(), 6);

        let subset = dataset.subset("u1");
        assert_eq!(subset.users.len(), 1);
        assert_eq!(subset.sessions_for("u1").len(), 2);
        assert!(subset.sessions_for("u2").is_empty());
    }

    #[test]
    fn test_parse_timestamp() {
        assert!(parse_timestamp("2024-01-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2024-01-01T10:00:00.123+02:00").is_some());
        assert!(parse_timestamp("2024-01-01T10:00:00").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
