//! Local data extraction
//!
//! The extractor reads the local key-value namespace into an
//! [`ExportDataset`]. Extraction tolerates damage: an unreadable record is
//! skipped and reported, never fatal to the whole export. [`Extractor::scan`]
//! is a cheap pre-flight that classifies keys without materialising records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{MigrationError, Result};
use crate::model::{ExportDataset, Meeting, Session, UserProfile, UserStats};
use crate::store::keys::{self, KeyKind};
use crate::store::KeyValueStore;

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

/// Overall state of the local namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanHealth {
    /// Every indexed user resolves and every record parses
    Healthy,
    /// Some keys are unreadable or orphaned
    Degraded,
    /// No users found
    Empty,
}

impl std::fmt::Display for ScanHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Empty => write!(f, "empty"),
        }
    }
}

/// Result of [`Extractor::scan`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    /// Keys in the store
    pub total_keys: usize,
    /// Application keys
    pub app_keys: usize,
    /// Engine bookkeeping keys
    pub engine_keys: usize,
    /// Keys outside both namespaces
    pub unknown_keys: Vec<String>,
    /// Users in the index
    pub user_count: usize,
    /// Users with a sessions key
    pub users_with_sessions: usize,
    /// Users with a stats key
    pub users_with_stats: usize,
    /// Users with a meetings key
    pub users_with_meetings: usize,
    /// Users with a running session
    pub active_sessions: usize,
    /// Expected keys that are absent
    pub missing_keys: Vec<String>,
    /// Keys whose value is not valid JSON of the expected shape
    pub unreadable_keys: Vec<String>,
    /// Per-user keys whose owner is not in the index
    pub orphan_keys: Vec<String>,
    /// Total size of application values in bytes
    pub total_bytes: usize,
    /// Aggregate health
    pub health: ScanHealth,
}

impl ScanReport {
    /// Human-readable findings
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.user_count == 0 {
            issues.push("no users found in local store".to_string());
        }
        if !self.unreadable_keys.is_empty() {
            issues.push(format!("{} unreadable keys", self.unreadable_keys.len()));
        }
        if !self.orphan_keys.is_empty() {
            issues.push(format!(
                "{} keys belong to users missing from the index",
                self.orphan_keys.len()
            ));
        }
        if !self.missing_keys.is_empty() {
            issues.push(format!("{} expected keys are missing", self.missing_keys.len()));
        }
        issues
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// A record skipped during extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedEntry {
    /// Store key
    pub key: String,
    /// Position inside a list value, if the damage was confined to one item
    pub index: Option<usize>,
    /// Why it was skipped
    pub reason: String,
}

impl SkippedEntry {
    /// User whose section held the damaged record, if the key is per-user
    pub fn owner(&self) -> Option<String> {
        keys::classify(&self.key).owner().map(str::to_string)
    }
}

impl fmt::Display for SkippedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{}]: {}", self.key, index, self.reason),
            None => write!(f, "{}: {}", self.key, self.reason),
        }
    }
}

/// Dataset plus the records that could not be read
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Extracted records
    pub dataset: ExportDataset,
    /// Skipped records
    pub skipped: Vec<SkippedEntry>,
}

impl Extraction {
    /// Skipped records from `user_id`'s sections
    pub fn skipped_for<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a SkippedEntry> {
        self.skipped
            .iter()
            .filter(move |entry| entry.owner().as_deref() == Some(user_id))
    }
}

/// Kind of drift found by [`Extractor::analyze`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisFinding {
    /// Profile lacks fields the application normally sets
    IncompleteProfile {
        /// Missing field names
        missing: Vec<String>,
    },
    /// Stats counter disagrees with the stored sessions
    SessionCountMismatch {
        /// Value recorded in stats
        recorded: i64,
        /// Sessions actually stored
        actual: usize,
    },
    /// User has sessions but no stats record
    MissingStats,
}

/// A warning produced by [`Extractor::analyze`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisWarning {
    /// Affected user
    pub user_id: String,
    /// What was found
    pub finding: AnalysisFinding,
    /// Human-readable summary
    pub message: String,
}

/// Output of [`Extractor::analyze`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Drift warnings; never errors
    pub warnings: Vec<AnalysisWarning>,
    /// Users with at least one warning
    pub affected_users: usize,
}

/// Reads the local namespace into datasets
#[derive(Clone)]
pub struct Extractor {
    store: Arc<dyn KeyValueStore>,
}

impl Extractor {
    /// Create an extractor over `store`
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Classify keys and gather statistics without materialising records
    pub fn scan(&self) -> Result<ScanReport> {
        let all_keys = self.store.keys()?;
        let mut report = ScanReport {
            total_keys: all_keys.len(),
            app_keys: 0,
            engine_keys: 0,
            unknown_keys: Vec::new(),
            user_count: 0,
            users_with_sessions: 0,
            users_with_stats: 0,
            users_with_meetings: 0,
            active_sessions: 0,
            missing_keys: Vec::new(),
            unreadable_keys: Vec::new(),
            orphan_keys: Vec::new(),
            total_bytes: 0,
            health: ScanHealth::Empty,
        };

        let user_ids: BTreeSet<String> = match self.read_raw(keys::USERS_KEY) {
            Ok(Some(Value::Object(index))) => index.keys().cloned().collect(),
            Ok(Some(Value::Array(list))) => list
                .iter()
                .filter_map(|u| u.get("id").and_then(Value::as_str).map(str::to_string))
                .collect(),
            Ok(Some(_)) | Err(_) => {
                report.unreadable_keys.push(keys::USERS_KEY.to_string());
                BTreeSet::new()
            }
            Ok(None) => {
                report.missing_keys.push(keys::USERS_KEY.to_string());
                BTreeSet::new()
            }
        };
        report.user_count = user_ids.len();

        let mut present: BTreeSet<String> = BTreeSet::new();
        for key in &all_keys {
            let kind = keys::classify(key);
            match kind {
                KeyKind::Engine => {
                    report.engine_keys += 1;
                    continue;
                }
                KeyKind::Unknown => {
                    report.unknown_keys.push(key.clone());
                    continue;
                }
                _ => report.app_keys += 1,
            }

            match self.store.get(key) {
                Ok(Some(raw)) => {
                    report.total_bytes += raw.len();
                    if !matches!(kind, KeyKind::UserIndex)
                        && serde_json::from_str::<Value>(&raw).is_err()
                    {
                        report.unreadable_keys.push(key.clone());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to read key during scan");
                    report.unreadable_keys.push(key.clone());
                }
            }

            if let Some(owner) = kind.owner() {
                if !user_ids.contains(owner) {
                    report.orphan_keys.push(key.clone());
                    continue;
                }
                match kind {
                    KeyKind::Sessions(_) => report.users_with_sessions += 1,
                    KeyKind::Stats(_) => report.users_with_stats += 1,
                    KeyKind::Meetings(_) => report.users_with_meetings += 1,
                    KeyKind::ActiveSession(_) => report.active_sessions += 1,
                    _ => {}
                }
            }
            present.insert(key.clone());
        }

        for uid in &user_ids {
            for key in [keys::sessions_key(uid), keys::stats_key(uid)] {
                if !present.contains(&key) {
                    report.missing_keys.push(key);
                }
            }
        }

        report.health = if report.user_count == 0 {
            ScanHealth::Empty
        } else if !report.unreadable_keys.is_empty() || !report.orphan_keys.is_empty() {
            ScanHealth::Degraded
        } else {
            ScanHealth::Healthy
        };

        debug!(
            keys = report.total_keys,
            users = report.user_count,
            health = %report.health,
            "scan complete"
        );
        Ok(report)
    }

    /// Build a dataset of every indexed user
    pub fn extract_all(&self) -> Result<Extraction> {
        let mut skipped = Vec::new();
        let users = self.read_user_index(&mut skipped)?;

        let mut dataset = ExportDataset::new("local");
        for (uid, profile) in users {
            self.extract_sections(&uid, &mut dataset, &mut skipped);
            dataset.users.insert(uid, profile);
        }
        dataset.refresh_statistics();

        info!(
            users = dataset.metadata.statistics.total_users,
            records = dataset.metadata.statistics.total_records(),
            skipped = skipped.len(),
            "local data extracted"
        );
        Ok(Extraction { dataset, skipped })
    }

    /// Build a dataset for a single user
    pub fn extract_user(&self, user_id: &str) -> Result<Extraction> {
        let mut skipped = Vec::new();
        let mut users = self.read_user_index(&mut skipped)?;
        let profile = users
            .remove(user_id)
            .ok_or_else(|| MigrationError::NotFound(format!("user {user_id}")))?;

        let mut dataset = ExportDataset::new("local");
        self.extract_sections(user_id, &mut dataset, &mut skipped);
        dataset.users.insert(user_id.to_string(), profile);
        dataset.refresh_statistics();
        Ok(Extraction { dataset, skipped })
    }

    /// Report drift that is tolerated but worth surfacing
    pub fn analyze(&self, dataset: &ExportDataset) -> AnalysisReport {
        let mut report = AnalysisReport::default();
        let mut affected = BTreeSet::new();

        for (uid, profile) in &dataset.users {
            let mut missing = Vec::new();
            if profile.email.trim().is_empty() {
                missing.push("email".to_string());
            }
            if profile.name.trim().is_empty() {
                missing.push("name".to_string());
            }
            if profile.created_at.trim().is_empty() {
                missing.push("createdAt".to_string());
            }
            if profile.preferences.is_none() {
                missing.push("preferences".to_string());
            }
            if !missing.is_empty() {
                report.warnings.push(AnalysisWarning {
                    user_id: uid.clone(),
                    message: format!("profile is missing {}", missing.join(", ")),
                    finding: AnalysisFinding::IncompleteProfile { missing },
                });
                affected.insert(uid.clone());
            }

            let actual = dataset.sessions_for(uid).len();
            match dataset.stats.get(uid) {
                Some(stats) if stats.total_sessions != actual as i64 => {
                    report.warnings.push(AnalysisWarning {
                        user_id: uid.clone(),
                        message: format!(
                            "stats record {} sessions but {} are stored",
                            stats.total_sessions, actual
                        ),
                        finding: AnalysisFinding::SessionCountMismatch {
                            recorded: stats.total_sessions,
                            actual,
                        },
                    });
                    affected.insert(uid.clone());
                }
                None if actual > 0 => {
                    report.warnings.push(AnalysisWarning {
                        user_id: uid.clone(),
                        message: format!("{actual} sessions stored but no stats record"),
                        finding: AnalysisFinding::MissingStats,
                    });
                    affected.insert(uid.clone());
                }
                _ => {}
            }
        }

        report.affected_users = affected.len();
        report
    }

    fn read_raw(&self, key: &str) -> Result<Option<Value>> {
        match self.store.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Read the user index, tolerating per-profile damage. Both the object
    /// form (id to profile) and a plain list of profiles are accepted.
    fn read_user_index(
        &self,
        skipped: &mut Vec<SkippedEntry>,
    ) -> Result<BTreeMap<String, UserProfile>> {
        let raw = match self.read_raw(keys::USERS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(BTreeMap::new()),
            Err(MigrationError::Serialization(e)) => {
                warn!(key = keys::USERS_KEY, error = %e, "user index unreadable");
                skipped.push(SkippedEntry {
                    key: keys::USERS_KEY.to_string(),
                    index: None,
                    reason: e.to_string(),
                });
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(e),
        };

        let candidates: Vec<(Option<String>, Value)> = match raw {
            Value::Object(index) => index.into_iter().map(|(k, v)| (Some(k), v)).collect(),
            Value::Array(list) => list.into_iter().map(|v| (None, v)).collect(),
            other => {
                skipped.push(SkippedEntry {
                    key: keys::USERS_KEY.to_string(),
                    index: None,
                    reason: format!("expected object or array, found {}", json_type(&other)),
                });
                return Ok(BTreeMap::new());
            }
        };

        let mut users = BTreeMap::new();
        for (position, (index_key, value)) in candidates.into_iter().enumerate() {
            match serde_json::from_value::<UserProfile>(value) {
                Ok(profile) => {
                    let id = index_key.unwrap_or_else(|| profile.id.clone());
                    if id.is_empty() {
                        skipped.push(SkippedEntry {
                            key: keys::USERS_KEY.to_string(),
                            index: Some(position),
                            reason: "profile has no id".to_string(),
                        });
                        continue;
                    }
                    users.insert(id, profile);
                }
                Err(e) => {
                    warn!(position, error = %e, "skipping unreadable user profile");
                    skipped.push(SkippedEntry {
                        key: keys::USERS_KEY.to_string(),
                        index: Some(position),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(users)
    }

    fn extract_sections(
        &self,
        uid: &str,
        dataset: &mut ExportDataset,
        skipped: &mut Vec<SkippedEntry>,
    ) {
        if let Some(sessions) = self.read_list::<Session>(&keys::sessions_key(uid), skipped) {
            dataset.sessions.insert(uid.to_string(), sessions);
        }
        if let Some(stats) = self.read_record::<UserStats>(&keys::stats_key(uid), skipped) {
            dataset.stats.insert(uid.to_string(), stats);
        }
        if let Some(meetings) = self.read_list::<Meeting>(&keys::meetings_key(uid), skipped) {
            dataset.meetings.insert(uid.to_string(), meetings);
        }
        if let Some(active) =
            self.read_record::<Session>(&keys::active_session_key(uid), skipped)
        {
            dataset.active_sessions.insert(uid.to_string(), active);
        }
    }

    fn read_record<T: DeserializeOwned>(
        &self,
        key: &str,
        skipped: &mut Vec<SkippedEntry>,
    ) -> Option<T> {
        let value = self.read_tolerant(key, skipped)?;
        if value.is_null() {
            return None;
        }
        match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key, error = %e, "skipping unreadable record");
                skipped.push(SkippedEntry {
                    key: key.to_string(),
                    index: None,
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    fn read_list<T: DeserializeOwned>(
        &self,
        key: &str,
        skipped: &mut Vec<SkippedEntry>,
    ) -> Option<Vec<T>> {
        let items = match self.read_tolerant(key, skipped)? {
            Value::Array(items) => items,
            other => {
                skipped.push(SkippedEntry {
                    key: key.to_string(),
                    index: None,
                    reason: format!("expected array, found {}", json_type(&other)),
                });
                return None;
            }
        };

        let mut records = Vec::with_capacity(items.len());
        for (position, item) in items.into_iter().enumerate() {
            match serde_json::from_value(item) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(key, position, error = %e, "skipping unreadable list item");
                    skipped.push(SkippedEntry {
                        key: key.to_string(),
                        index: Some(position),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Some(records)
    }

    fn read_tolerant(&self, key: &str, skipped: &mut Vec<SkippedEntry>) -> Option<Value> {
        match self.read_raw(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "skipping unreadable key");
                skipped.push(SkippedEntry {
                    key: key.to_string(),
                    index: None,
                    reason: e.to_string(),
                });
                None
            }
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
