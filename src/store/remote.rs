//! Remote relational store
//!
//! [`RemoteStore`] is the interface the engine consumes: per-entity CRUD,
//! bulk legacy-migration procedures, a small set of server-side queries and
//! per-table change notifications. [`MemoryRemoteStore`] implements it with
//! relational constraints (foreign keys to `users`) and optional JSON
//! persistence for the command-line tool.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{MigrationError, Result};
use crate::model::{Meeting, Session, UserPreferences, UserProfile, UserStats};

/// Change feed buffer per subscriber
const SUBSCRIBER_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Interface types
// ---------------------------------------------------------------------------

/// Remote tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTable {
    /// User profiles
    Users,
    /// User preferences
    Preferences,
    /// User statistics
    Stats,
    /// Sessions
    Sessions,
    /// Meetings
    Meetings,
}

impl RemoteTable {
    /// Every table
    pub const ALL: [RemoteTable; 5] = [
        Self::Users,
        Self::Preferences,
        Self::Stats,
        Self::Sessions,
        Self::Meetings,
    ];
}

impl std::fmt::Display for RemoteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Users => write!(f, "users"),
            Self::Preferences => write!(f, "user_preferences"),
            Self::Stats => write!(f, "user_stats"),
            Self::Sessions => write!(f, "sessions"),
            Self::Meetings => write!(f, "meetings"),
        }
    }
}

/// Server-side queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteQuery {
    /// Referential checks; rows of `{check, status: "OK" | "VIOLATION", details}`
    IntegrityReport,
    /// Row count of a table; one row `{table, count}`
    CountRows(RemoteTable),
    /// Row count of a table for one user; one row `{table, user_id, count}`
    CountRowsForUser(RemoteTable, String),
}

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

/// A row change notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Table that changed
    pub table: RemoteTable,
    /// Owner of the changed row
    pub user_id: String,
    /// What happened
    pub kind: ChangeKind,
    /// The row after the change (or before, for deletes)
    pub record: Value,
}

/// Result of a bulk migration procedure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkOutcome {
    /// Rows inserted
    pub inserted: usize,
    /// Rows already present and left untouched
    pub skipped: usize,
    /// Rows rejected, as (record id, reason)
    pub failed: Vec<(String, String)>,
}

impl BulkOutcome {
    /// Whether every row was accepted
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn absorb(&mut self, other: BulkOutcome) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.failed.extend(other.failed);
    }
}

/// Remote relational store client
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Connectivity check
    async fn ping(&self) -> Result<()>;

    /// Fetch a user profile
    async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>>;

    /// Insert or replace a user profile
    async fn upsert_user(&self, user: &UserProfile) -> Result<()>;

    /// Replace a user's preferences
    async fn update_preferences(&self, user_id: &str, preferences: &UserPreferences)
        -> Result<()>;

    /// Fetch a user's statistics
    async fn get_stats(&self, user_id: &str) -> Result<Option<UserStats>>;

    /// Insert or replace a user's statistics
    async fn upsert_stats(&self, stats: &UserStats) -> Result<()>;

    /// Insert or replace a session
    async fn upsert_session(&self, session: &Session) -> Result<()>;

    /// Insert or replace a meeting
    async fn upsert_meeting(&self, meeting: &Meeting) -> Result<()>;

    /// Delete a meeting
    async fn delete_meeting(&self, user_id: &str, meeting_id: &str) -> Result<()>;

    /// Bulk-insert legacy users, skipping ids that already exist
    async fn migrate_legacy_users(&self, users: &[UserProfile]) -> Result<BulkOutcome>;

    /// Bulk-insert legacy statistics
    async fn migrate_legacy_stats(&self, stats: &[UserStats]) -> Result<BulkOutcome>;

    /// Bulk-insert legacy sessions
    async fn migrate_legacy_sessions(&self, sessions: &[Session]) -> Result<BulkOutcome>;

    /// Bulk-insert legacy meetings
    async fn migrate_legacy_meetings(&self, meetings: &[Meeting]) -> Result<BulkOutcome>;

    /// Run a server-side query
    async fn execute_query(&self, query: RemoteQuery) -> Result<Vec<Value>>;

    /// Subscribe to changes of one table
    async fn subscribe(&self, table: RemoteTable) -> Result<mpsc::Receiver<ChangeEvent>>;

    /// Dump every table as JSON, keyed by table name
    async fn export_tables(&self) -> Result<BTreeMap<String, String>>;
}

// ---------------------------------------------------------------------------
// MemoryRemoteStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    users: BTreeMap<String, UserProfile>,
    preferences: BTreeMap<String, UserPreferences>,
    stats: BTreeMap<String, UserStats>,
    sessions: BTreeMap<String, Session>,
    meetings: BTreeMap<String, Meeting>,
}

/// In-memory remote store with foreign-key checks and failure injection
pub struct MemoryRemoteStore {
    tables: RwLock<Tables>,
    online: AtomicBool,
    writes: AtomicU64,
    failing_users: RwLock<HashSet<String>>,
    injected_violations: RwLock<Vec<String>>,
    subscribers: RwLock<Vec<(RemoteTable, mpsc::Sender<ChangeEvent>)>>,
    persist_path: Option<PathBuf>,
}

impl MemoryRemoteStore {
    /// Create an empty, online store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            online: AtomicBool::new(true),
            writes: AtomicU64::new(0),
            failing_users: RwLock::new(HashSet::new()),
            injected_violations: RwLock::new(Vec::new()),
            subscribers: RwLock::new(Vec::new()),
            persist_path: None,
        }
    }

    /// Open a store persisted at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents).map_err(|e| {
                MigrationError::Remote(format!("corrupt remote file {:?}: {}", path, e))
            })?
        } else {
            Tables::default()
        };

        let mut store = Self::new();
        store.tables = RwLock::new(tables);
        store.persist_path = Some(path);
        Ok(store)
    }

    /// Simulate connectivity loss or recovery
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Reject every write touching `user_id`
    pub fn fail_user(&self, user_id: impl Into<String>) {
        self.failing_users.write().insert(user_id.into());
    }

    /// Stop rejecting writes for `user_id`
    pub fn heal_user(&self, user_id: &str) {
        self.failing_users.write().remove(user_id);
    }

    /// Add a VIOLATION row to every integrity report
    pub fn inject_violation(&self, check: impl Into<String>) {
        self.injected_violations.write().push(check.into());
    }

    /// Number of write calls that reached the store
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of rows in a table
    pub fn row_count(&self, table: RemoteTable) -> usize {
        let tables = self.tables.read();
        match table {
            RemoteTable::Users => tables.users.len(),
            RemoteTable::Preferences => tables.preferences.len(),
            RemoteTable::Stats => tables.stats.len(),
            RemoteTable::Sessions => tables.sessions.len(),
            RemoteTable::Meetings => tables.meetings.len(),
        }
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MigrationError::Remote("remote store is offline".to_string()))
        }
    }

    /// Gate for every write: connectivity, injected failures, then the write counter
    fn begin_write(&self, user_id: &str) -> Result<()> {
        self.ensure_online()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.failing_users.read().contains(user_id) {
            return Err(MigrationError::Transfer {
                user_id: user_id.to_string(),
                message: "remote write rejected".to_string(),
            });
        }
        Ok(())
    }

    fn require_user(tables: &Tables, user_id: &str) -> Result<()> {
        if tables.users.contains_key(user_id) {
            Ok(())
        } else {
            Err(MigrationError::Transfer {
                user_id: user_id.to_string(),
                message: "foreign key violation: user does not exist".to_string(),
            })
        }
    }

    fn notify(&self, table: RemoteTable, user_id: &str, kind: ChangeKind, record: Value) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|(_, tx)| !tx.is_closed());
        for (subscribed, tx) in subscribers.iter() {
            if *subscribed != table {
                continue;
            }
            let event = ChangeEvent {
                table,
                user_id: user_id.to_string(),
                kind,
                record: record.clone(),
            };
            if tx.try_send(event).is_err() {
                warn!(table = %table, "change subscriber lagging, dropping event");
            }
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(&*self.tables.read())?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn insert_session(&self, session: &Session) -> Result<ChangeKind> {
        let mut tables = self.tables.write();
        Self::require_user(&tables, &session.user_id)?;
        let kind = match tables.sessions.insert(session.id.clone(), session.clone()) {
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Insert,
        };
        Ok(kind)
    }

    fn insert_meeting(&self, meeting: &Meeting) -> Result<ChangeKind> {
        let mut tables = self.tables.write();
        Self::require_user(&tables, &meeting.user_id)?;
        let kind = match tables.meetings.insert(meeting.id.clone(), meeting.clone()) {
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Insert,
        };
        Ok(kind)
    }

    fn insert_stats(&self, stats: &UserStats) -> Result<ChangeKind> {
        let mut tables = self.tables.write();
        Self::require_user(&tables, &stats.user_id)?;
        let kind = match tables.stats.insert(stats.user_id.clone(), stats.clone()) {
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Insert,
        };
        Ok(kind)
    }

    fn integrity_rows(&self) -> Vec<Value> {
        let tables = self.tables.read();
        let mut rows = Vec::new();

        let orphan_stats = tables
            .stats
            .keys()
            .filter(|uid| !tables.users.contains_key(*uid))
            .count();
        let orphan_sessions = tables
            .sessions
            .values()
            .filter(|s| !tables.users.contains_key(&s.user_id))
            .count();
        let orphan_meetings = tables
            .meetings
            .values()
            .filter(|m| !tables.users.contains_key(&m.user_id))
            .count();
        let orphan_preferences = tables
            .preferences
            .keys()
            .filter(|uid| !tables.users.contains_key(*uid))
            .count();

        for (check, orphans) in [
            ("orphan_stats", orphan_stats),
            ("orphan_sessions", orphan_sessions),
            ("orphan_meetings", orphan_meetings),
            ("orphan_preferences", orphan_preferences),
        ] {
            rows.push(json!({
                "check": check,
                "status": if orphans == 0 { "OK" } else { "VIOLATION" },
                "details": format!("{orphans} orphaned rows"),
            }));
        }

        for check in self.injected_violations.read().iter() {
            rows.push(json!({
                "check": check,
                "status": "VIOLATION",
                "details": "reported by server",
            }));
        }

        rows
    }

    fn count_user_rows(&self, table: RemoteTable, uid: &str) -> usize {
        let tables = self.tables.read();
        match table {
            RemoteTable::Users => usize::from(tables.users.contains_key(uid)),
            RemoteTable::Preferences => usize::from(tables.preferences.contains_key(uid)),
            RemoteTable::Stats => usize::from(tables.stats.contains_key(uid)),
            RemoteTable::Sessions => tables.sessions.values().filter(|s| s.user_id == uid).count(),
            RemoteTable::Meetings => tables.meetings.values().filter(|m| m.user_id == uid).count(),
        }
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn ping(&self) -> Result<()> {
        self.ensure_online()
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.ensure_online()?;
        Ok(self.tables.read().users.get(user_id).cloned())
    }

    async fn upsert_user(&self, user: &UserProfile) -> Result<()> {
        self.begin_write(&user.id)?;
        let kind = match self.tables.write().users.insert(user.id.clone(), user.clone()) {
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Insert,
        };
        self.notify(RemoteTable::Users, &user.id, kind, serde_json::to_value(user)?);
        self.persist()
    }

    async fn update_preferences(
        &self,
        user_id: &str,
        preferences: &UserPreferences,
    ) -> Result<()> {
        self.begin_write(user_id)?;
        let kind = {
            let mut tables = self.tables.write();
            Self::require_user(&tables, user_id)?;
            match tables
                .preferences
                .insert(user_id.to_string(), preferences.clone())
            {
                Some(_) => ChangeKind::Update,
                None => ChangeKind::Insert,
            }
        };
        self.notify(
            RemoteTable::Preferences,
            user_id,
            kind,
            serde_json::to_value(preferences)?,
        );
        self.persist()
    }

    async fn get_stats(&self, user_id: &str) -> Result<Option<UserStats>> {
        self.ensure_online()?;
        Ok(self.tables.read().stats.get(user_id).cloned())
    }

    async fn upsert_stats(&self, stats: &UserStats) -> Result<()> {
        self.begin_write(&stats.user_id)?;
        let kind = self.insert_stats(stats)?;
        self.notify(
            RemoteTable::Stats,
            &stats.user_id,
            kind,
            serde_json::to_value(stats)?,
        );
        self.persist()
    }

    async fn upsert_session(&self, session: &Session) -> Result<()> {
        self.begin_write(&session.user_id)?;
        let kind = self.insert_session(session)?;
        self.notify(
            RemoteTable::Sessions,
            &session.user_id,
            kind,
            serde_json::to_value(session)?,
        );
        self.persist()
    }

    async fn upsert_meeting(&self, meeting: &Meeting) -> Result<()> {
        self.begin_write(&meeting.user_id)?;
        let kind = self.insert_meeting(meeting)?;
        self.notify(
            RemoteTable::Meetings,
            &meeting.user_id,
            kind,
            serde_json::to_value(meeting)?,
        );
        self.persist()
    }

    async fn delete_meeting(&self, user_id: &str, meeting_id: &str) -> Result<()> {
        self.begin_write(user_id)?;
        let removed = self.tables.write().meetings.remove(meeting_id);
        if let Some(meeting) = removed {
            self.notify(
                RemoteTable::Meetings,
                user_id,
                ChangeKind::Delete,
                serde_json::to_value(&meeting)?,
            );
        }
        self.persist()
    }

    async fn migrate_legacy_users(&self, users: &[UserProfile]) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        for user in users {
            if let Err(e) = self.begin_write(&user.id) {
                if matches!(e, MigrationError::Remote(_)) {
                    return Err(e);
                }
                outcome.failed.push((user.id.clone(), e.to_string()));
                continue;
            }
            let inserted = {
                let mut tables = self.tables.write();
                if tables.users.contains_key(&user.id) {
                    false
                } else {
                    tables.users.insert(user.id.clone(), user.clone());
                    true
                }
            };
            if inserted {
                outcome.inserted += 1;
                self.notify(
                    RemoteTable::Users,
                    &user.id,
                    ChangeKind::Insert,
                    serde_json::to_value(user)?,
                );
            } else {
                outcome.skipped += 1;
            }
        }
        debug!(inserted = outcome.inserted, skipped = outcome.skipped, "legacy users migrated");
        self.persist()?;
        Ok(outcome)
    }

    async fn migrate_legacy_stats(&self, stats: &[UserStats]) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        for record in stats {
            let single = match self
                .begin_write(&record.user_id)
                .and_then(|_| self.insert_stats(record))
            {
                Ok(_) => BulkOutcome {
                    inserted: 1,
                    ..Default::default()
                },
                Err(e @ MigrationError::Remote(_)) => return Err(e),
                Err(e) => BulkOutcome {
                    failed: vec![(record.user_id.clone(), e.to_string())],
                    ..Default::default()
                },
            };
            outcome.absorb(single);
        }
        self.persist()?;
        Ok(outcome)
    }

    async fn migrate_legacy_sessions(&self, sessions: &[Session]) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        for session in sessions {
            let single = match self
                .begin_write(&session.user_id)
                .and_then(|_| self.insert_session(session))
            {
                Ok(_) => BulkOutcome {
                    inserted: 1,
                    ..Default::default()
                },
                Err(e @ MigrationError::Remote(_)) => return Err(e),
                Err(e) => BulkOutcome {
                    failed: vec![(session.id.clone(), e.to_string())],
                    ..Default::default()
                },
            };
            outcome.absorb(single);
        }
        self.persist()?;
        Ok(outcome)
    }

    async fn migrate_legacy_meetings(&self, meetings: &[Meeting]) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        for meeting in meetings {
            let single = match self
                .begin_write(&meeting.user_id)
                .and_then(|_| self.insert_meeting(meeting))
            {
                Ok(_) => BulkOutcome {
                    inserted: 1,
                    ..Default::default()
                },
                Err(e @ MigrationError::Remote(_)) => return Err(e),
                Err(e) => BulkOutcome {
                    failed: vec![(meeting.id.clone(), e.to_string())],
                    ..Default::default()
                },
            };
            outcome.absorb(single);
        }
        self.persist()?;
        Ok(outcome)
    }

    async fn execute_query(&self, query: RemoteQuery) -> Result<Vec<Value>> {
        self.ensure_online()?;
        let rows = match query {
            RemoteQuery::IntegrityReport => self.integrity_rows(),
            RemoteQuery::CountRows(table) => vec![json!({
                "table": table.to_string(),
                "count": self.row_count(table),
            })],
            RemoteQuery::CountRowsForUser(table, user_id) => vec![json!({
                "table": table.to_string(),
                "count": self.count_user_rows(table, &user_id),
                "user_id": user_id,
            })],
        };
        Ok(rows)
    }

    async fn subscribe(&self, table: RemoteTable) -> Result<mpsc::Receiver<ChangeEvent>> {
        self.ensure_online()?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.write().push((table, tx));
        Ok(rx)
    }

    async fn export_tables(&self) -> Result<BTreeMap<String, String>> {
        self.ensure_online()?;
        let tables = self.tables.read();
        let mut dump = BTreeMap::new();
        dump.insert(
            RemoteTable::Users.to_string(),
            serde_json::to_string(&tables.users)?,
        );
        dump.insert(
            RemoteTable::Preferences.to_string(),
            serde_json::to_string(&tables.preferences)?,
        );
        dump.insert(
            RemoteTable::Stats.to_string(),
            serde_json::to_string(&tables.stats)?,
        );
        dump.insert(
            RemoteTable::Sessions.to_string(),
            serde_json::to_string(&tables.sessions)?,
        );
        dump.insert(
            RemoteTable::Meetings.to_string(),
            serde_json::to_string(&tables.meetings)?,
        );
        Ok(dump)
    }
}
