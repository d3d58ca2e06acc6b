//! Hybrid Manager
//!
//! Dual-store operation during a gradual cut-over. Every write lands in the
//! local store first, which stays authoritative. When the acting user is
//! already migrated, the remote store is reachable and no migration holds
//! the user's lock, the write is mirrored remotely; otherwise, or when the
//! mirror fails, it is deferred to the [`SyncQueue`]. A local write that
//! succeeded is never reported as failed because of the remote side.
//!
//! The queue drains on an interval ([`HybridManager::spawn_sync_worker`])
//! and whenever connectivity returns ([`HybridManager::set_online`]).

pub mod merge;
pub mod sync_queue;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::HybridConfig;
use crate::error::{MigrationError, Result};
use crate::extractor::Extractor;
use crate::model::{Meeting, Session, UserProfile, UserStats};
use crate::recovery::{upsert_index_entry, PartialRollbackReport, RecoveryManager};
use crate::state::EngineContext;
use crate::store::keys::{self, HYBRID_KEY, USERS_KEY};
use crate::store::{ChangeKind, KeyValueStoreExt, RemoteTable};

pub use merge::merge_stats;
pub use sync_queue::{SyncOperation, SyncQueue, SyncQueueItem};

/// Lock holder name for hybrid transfers
const LOCK_HOLDER: &str = "hybrid";

/// Persisted hybrid mode flag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HybridState {
    /// Whether hybrid mode is on
    pub enabled: bool,
    /// When it was last switched on
    pub enabled_at: Option<DateTime<Utc>>,
}

/// Where a hybrid write ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Written locally; the user is not migrated
    LocalOnly,
    /// Written locally and remotely
    Mirrored,
    /// Written locally; the remote write was deferred
    Queued,
}

/// Options for [`HybridManager::migrate_user`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMigrationOptions {
    /// Transfer even if the user is already migrated
    pub force_remigration: bool,
    /// Push data sections only; the remote profile must already exist
    pub sync_only: bool,
}

/// Result of [`HybridManager::migrate_user`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UserMigrationOutcome {
    /// Already migrated; nothing was sent
    Skipped,
    /// Every section reached the remote store
    Migrated {
        /// Records written
        records: usize,
    },
    /// At least one section failed; the user stays unmigrated
    Failed {
        /// One entry per failed record
        errors: Vec<String>,
    },
}

/// Result of one sync queue drain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Items replayed
    pub attempted: usize,
    /// Items that reached the remote store
    pub succeeded: usize,
    /// Items kept for another attempt
    pub retried: usize,
    /// Items left alone because their user is locked
    pub deferred: usize,
    /// Items dropped after using every attempt
    pub permanently_failed: Vec<SyncQueueItem>,
    /// The drain did not run because the remote store is offline
    pub offline: bool,
}

/// Dual-store operation manager
pub struct HybridManager {
    ctx: EngineContext,
    recovery: Arc<RecoveryManager>,
    queue: SyncQueue,
    config: HybridConfig,
    online: AtomicBool,
    drain_lock: tokio::sync::Mutex<()>,
}

impl HybridManager {
    /// Create a hybrid manager, initially online
    pub fn new(ctx: EngineContext, recovery: Arc<RecoveryManager>, config: HybridConfig) -> Self {
        Self {
            queue: SyncQueue::new(ctx.local.clone()),
            ctx,
            recovery,
            config,
            online: AtomicBool::new(true),
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    // ── Mode ──

    /// Persisted hybrid state
    pub fn state(&self) -> Result<HybridState> {
        Ok(self.ctx.local.get_json(HYBRID_KEY)?.unwrap_or_default())
    }

    /// Whether hybrid mode is on
    pub fn is_enabled(&self) -> Result<bool> {
        Ok(self.state()?.enabled)
    }

    /// Switch hybrid mode on
    pub fn enable(&self) -> Result<HybridState> {
        let state = HybridState {
            enabled: true,
            enabled_at: Some(Utc::now()),
        };
        self.ctx.local.set_json(HYBRID_KEY, &state)?;
        info!("hybrid mode enabled");
        self.ctx.journal.info("hybrid mode enabled");
        Ok(state)
    }

    /// Switch hybrid mode off; queued items are kept
    pub fn disable(&self) -> Result<HybridState> {
        let mut state = self.state()?;
        state.enabled = false;
        self.ctx.local.set_json(HYBRID_KEY, &state)?;
        info!("hybrid mode disabled");
        self.ctx.journal.info("hybrid mode disabled");
        Ok(state)
    }

    /// Whether the remote store is considered reachable
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record a connectivity change. Coming back online drains the queue.
    pub async fn set_online(&self, online: bool) -> Result<Option<DrainReport>> {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            info!("remote store reachable again, draining sync queue");
            return self.drain().await.map(Some);
        }
        if !online && was_online {
            warn!("remote store unreachable, deferring remote writes");
        }
        Ok(None)
    }

    /// Items waiting for a replay
    pub fn pending(&self) -> Result<Vec<SyncQueueItem>> {
        self.queue.items()
    }

    // ── Writes ──

    /// Insert or replace a session in the user's list
    pub async fn save_session(&self, session: &Session) -> Result<WriteOutcome> {
        let key = keys::sessions_key(&session.user_id);
        let mut sessions: Vec<Session> = self.ctx.local.get_json(&key)?.unwrap_or_default();
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => sessions.push(session.clone()),
        }
        self.ctx.local.set_json(&key, &sessions)?;

        Ok(self
            .mirror(SyncOperation::UpsertSession, &session.user_id, to_payload(session)?)
            .await)
    }

    /// Set or clear the user's running session
    pub async fn set_active_session(
        &self,
        user_id: &str,
        session: Option<&Session>,
    ) -> Result<WriteOutcome> {
        let key = keys::active_session_key(user_id);
        match session {
            Some(session) => {
                self.ctx.local.set_json(&key, session)?;
                Ok(self
                    .mirror(SyncOperation::UpsertSession, user_id, to_payload(session)?)
                    .await)
            }
            None => {
                self.ctx.local.remove(&key)?;
                Ok(WriteOutcome::LocalOnly)
            }
        }
    }

    /// Replace the user's statistics
    pub async fn update_stats(&self, stats: &UserStats) -> Result<WriteOutcome> {
        self.ctx
            .local
            .set_json(&keys::stats_key(&stats.user_id), stats)?;
        Ok(self
            .mirror(SyncOperation::UpsertStats, &stats.user_id, to_payload(stats)?)
            .await)
    }

    /// Insert or replace a meeting in the user's list
    pub async fn save_meeting(&self, meeting: &Meeting) -> Result<WriteOutcome> {
        let key = keys::meetings_key(&meeting.user_id);
        let mut meetings: Vec<Meeting> = self.ctx.local.get_json(&key)?.unwrap_or_default();
        match meetings.iter_mut().find(|m| m.id == meeting.id) {
            Some(existing) => *existing = meeting.clone(),
            None => meetings.push(meeting.clone()),
        }
        self.ctx.local.set_json(&key, &meetings)?;

        Ok(self
            .mirror(SyncOperation::UpsertMeeting, &meeting.user_id, to_payload(meeting)?)
            .await)
    }

    /// Remove a meeting from the user's list
    pub async fn delete_meeting(&self, user_id: &str, meeting_id: &str) -> Result<WriteOutcome> {
        let key = keys::meetings_key(user_id);
        let mut meetings: Vec<Meeting> = self.ctx.local.get_json(&key)?.unwrap_or_default();
        let before = meetings.len();
        meetings.retain(|m| m.id != meeting_id);
        if meetings.len() == before {
            return Err(MigrationError::NotFound(format!(
                "meeting {meeting_id} for user {user_id}"
            )));
        }
        self.ctx.local.set_json(&key, &meetings)?;

        Ok(self
            .mirror(SyncOperation::DeleteMeeting, user_id, json!({ "id": meeting_id }))
            .await)
    }

    /// Replace the user's profile in the users index
    pub async fn update_profile(&self, profile: &UserProfile) -> Result<WriteOutcome> {
        let index: Value = self
            .ctx
            .local
            .get_json(USERS_KEY)?
            .unwrap_or_else(|| Value::Object(Map::new()));
        let updated = upsert_index_entry(index, &profile.id, Some(to_payload(profile)?));
        self.ctx.local.set_json(USERS_KEY, &updated)?;

        Ok(self
            .mirror(SyncOperation::UpdateProfile, &profile.id, to_payload(profile)?)
            .await)
    }

    /// The user's statistics, merged with the remote copy when reachable.
    ///
    /// A merge that changes anything is written back locally.
    pub async fn get_stats(&self, user_id: &str) -> Result<Option<UserStats>> {
        let local: Option<UserStats> = self.ctx.local.get_json(&keys::stats_key(user_id))?;
        if !self.is_online() || !self.ctx.user_status.is_migrated(user_id)? {
            return Ok(local);
        }

        let remote = match self.ctx.remote.get_stats(user_id).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(user_id, error = %e, "remote stats unavailable, using local copy");
                return Ok(local);
            }
        };
        match remote {
            Some(remote) => self.apply_remote_stats(&remote).map(Some),
            None => Ok(local),
        }
    }

    /// Merge remote statistics into the local copy, returning the result
    pub fn apply_remote_stats(&self, remote: &UserStats) -> Result<UserStats> {
        let key = keys::stats_key(&remote.user_id);
        let local: Option<UserStats> = self.ctx.local.get_json(&key)?;
        let merged = match &local {
            Some(local) => merge_stats(local, remote),
            None => remote.clone(),
        };
        if local.as_ref() != Some(&merged) {
            debug!(user_id = %remote.user_id, "local stats updated from remote");
            self.ctx.local.set_json(&key, &merged)?;
        }
        Ok(merged)
    }

    async fn mirror(&self, operation: SyncOperation, user_id: &str, payload: Value) -> WriteOutcome {
        match self.ctx.user_status.is_migrated(user_id) {
            Ok(true) => {}
            Ok(false) => return WriteOutcome::LocalOnly,
            Err(e) => {
                warn!(user_id, error = %e, "unreadable user status, deferring remote write");
                return self.defer(operation, user_id, payload, e.to_string());
            }
        }
        if !self.is_online() {
            return self.defer(operation, user_id, payload, "offline".to_string());
        }
        if self.ctx.locks.is_locked(user_id) {
            return self.defer(operation, user_id, payload, "user locked".to_string());
        }

        match self.replay(operation, user_id, &payload).await {
            Ok(()) => {
                if let Err(e) = self.ctx.user_status.touch_sync(user_id) {
                    warn!(user_id, error = %e, "failed to record sync time");
                }
                WriteOutcome::Mirrored
            }
            Err(e) => {
                warn!(user_id, operation = %operation, error = %e, "remote mirror failed");
                self.defer(operation, user_id, payload, e.to_string())
            }
        }
    }

    fn defer(
        &self,
        operation: SyncOperation,
        user_id: &str,
        payload: Value,
        reason: String,
    ) -> WriteOutcome {
        let item = SyncQueueItem::new(operation, user_id, payload, self.config.max_attempts);
        debug!(user_id, operation = %operation, reason = %reason, "remote write deferred");
        match self.queue.push(item) {
            Ok(()) => WriteOutcome::Queued,
            Err(e) => {
                error!(user_id, operation = %operation, error = %e, "failed to queue remote write");
                self.ctx
                    .journal
                    .error(format!("lost remote {operation} for user {user_id}: {e}"));
                WriteOutcome::LocalOnly
            }
        }
    }

    async fn replay(&self, operation: SyncOperation, user_id: &str, payload: &Value) -> Result<()> {
        let remote = &self.ctx.remote;
        match operation {
            SyncOperation::UpsertSession => remote.upsert_session(&from_payload(payload)?).await,
            SyncOperation::UpsertStats => remote.upsert_stats(&from_payload(payload)?).await,
            SyncOperation::UpsertMeeting => remote.upsert_meeting(&from_payload(payload)?).await,
            SyncOperation::DeleteMeeting => {
                let meeting_id = payload.get("id").and_then(Value::as_str).ok_or_else(|| {
                    MigrationError::Validation("delete_meeting payload has no id".to_string())
                })?;
                remote.delete_meeting(user_id, meeting_id).await
            }
            SyncOperation::UpdateProfile => remote.upsert_user(&from_payload(payload)?).await,
            SyncOperation::UpdatePreferences => {
                remote
                    .update_preferences(user_id, &from_payload(payload)?)
                    .await
            }
        }
    }

    // ── Sync queue ──

    /// Replay queued writes once.
    ///
    /// Each replay uses one attempt; an item that has used all of its
    /// attempts, or whose replay failed with an error that cannot clear up
    /// on its own, is removed and reported as permanently failed. Items whose
    /// user is locked are left untouched. Concurrent calls return an empty
    /// report while a drain is in progress.
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        if !self.is_online() {
            report.offline = true;
            return Ok(report);
        }
        let Ok(_draining) = self.drain_lock.try_lock() else {
            debug!("sync queue drain already running");
            return Ok(report);
        };

        let mut finished = HashSet::new();
        let mut updated = Vec::new();
        for mut item in self.queue.items()? {
            if item.exhausted() {
                finished.insert(item.id.clone());
                report.permanently_failed.push(item);
                continue;
            }
            if self.ctx.locks.is_locked(&item.user_id) {
                report.deferred += 1;
                continue;
            }

            report.attempted += 1;
            item.attempts += 1;
            match self.replay(item.operation, &item.user_id, &item.payload).await {
                Ok(()) => {
                    report.succeeded += 1;
                    finished.insert(item.id.clone());
                    if let Err(e) = self.ctx.user_status.touch_sync(&item.user_id) {
                        warn!(user_id = %item.user_id, error = %e, "failed to record sync time");
                    }
                }
                Err(e) => {
                    item.last_error = Some(e.to_string());
                    if item.exhausted() || !e.is_recoverable() {
                        warn!(
                            user_id = %item.user_id,
                            operation = %item.operation,
                            attempts = item.attempts,
                            error = %e,
                            "sync item permanently failed"
                        );
                        self.ctx.journal.error(format!(
                            "gave up on {} for user {} after {} attempts: {e}",
                            item.operation, item.user_id, item.attempts
                        ));
                        finished.insert(item.id.clone());
                        report.permanently_failed.push(item);
                    } else {
                        report.retried += 1;
                        updated.push(item);
                    }
                }
            }
        }

        self.queue.settle(&finished, &updated)?;
        if report.attempted > 0 || !report.permanently_failed.is_empty() {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                retried = report.retried,
                failed = report.permanently_failed.len(),
                "sync queue drained"
            );
        }
        Ok(report)
    }

    /// Drain the queue every `sync_interval_secs` until `shutdown` fires
    pub fn spawn_sync_worker(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.sync_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.drain().await {
                            warn!(error = %e, "sync queue drain failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("sync worker shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Apply remote statistics changes locally until `shutdown` fires
    pub async fn watch_remote_stats(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>> {
        let mut changes = self.ctx.remote.subscribe(RemoteTable::Stats).await?;
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => {
                        let Some(change) = change else {
                            debug!("remote stats feed closed");
                            break;
                        };
                        if change.kind == ChangeKind::Delete {
                            continue;
                        }
                        match serde_json::from_value::<UserStats>(change.record) {
                            Ok(stats) => {
                                if let Err(e) = self.apply_remote_stats(&stats) {
                                    warn!(user_id = %change.user_id, error = %e, "failed to apply remote stats");
                                }
                            }
                            Err(e) => warn!(user_id = %change.user_id, error = %e, "malformed remote stats"),
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("remote stats watcher shutting down");
                        break;
                    }
                }
            }
        }))
    }

    // ── Per-user transfer ──

    /// Transfer one user's data to the remote store.
    ///
    /// Returns [`UserMigrationOutcome::Skipped`] without any remote call when
    /// the user is already migrated and `force_remigration` is off. The user
    /// is marked migrated only when every record succeeded and every local
    /// section could be read.
    pub async fn migrate_user(
        &self,
        user_id: &str,
        options: UserMigrationOptions,
    ) -> Result<UserMigrationOutcome> {
        if self.ctx.user_status.is_migrated(user_id)? && !options.force_remigration {
            debug!(user_id, "user already migrated");
            return Ok(UserMigrationOutcome::Skipped);
        }

        let _lock = self.ctx.locks.try_acquire(user_id, LOCK_HOLDER)?;
        self.ctx.remote.ping().await?;
        let extraction = Extractor::new(self.ctx.local.clone()).extract_user(user_id)?;
        let remote = &self.ctx.remote;

        let mut records = 0;
        // A local section that could not be read never reaches the remote
        let mut errors: Vec<String> = extraction
            .skipped_for(user_id)
            .map(|entry| format!("unreadable {entry}"))
            .collect();
        let dataset = extraction.dataset;
        let mut record = |section: &str, result: Result<()>| match result {
            Ok(()) => records += 1,
            Err(e) => errors.push(format!("{section}: {e}")),
        };

        if let Some(profile) = dataset.users.get(user_id) {
            if !options.sync_only {
                record("profile", remote.upsert_user(profile).await);
            }
            if let Some(preferences) = &profile.preferences {
                record(
                    "preferences",
                    remote.update_preferences(user_id, preferences).await,
                );
            }
        }
        if let Some(stats) = dataset.stats.get(user_id) {
            record("stats", remote.upsert_stats(stats).await);
        }
        for session in dataset.sessions_for(user_id) {
            record(
                &format!("session {}", session.id),
                remote.upsert_session(session).await,
            );
        }
        if let Some(active) = dataset.active_sessions.get(user_id) {
            record(
                &format!("session {}", active.id),
                remote.upsert_session(active).await,
            );
        }
        for meeting in dataset.meetings_for(user_id) {
            record(
                &format!("meeting {}", meeting.id),
                remote.upsert_meeting(meeting).await,
            );
        }

        if errors.is_empty() {
            self.ctx.user_status.mark_migrated(user_id)?;
            self.ctx.user_status.touch_sync(user_id)?;
            info!(user_id, records, "user migrated");
            self.ctx
                .journal
                .info(format!("user {user_id} migrated ({records} records)"));
            Ok(UserMigrationOutcome::Migrated { records })
        } else {
            self.ctx.user_status.mark_failed(user_id, errors.join("; "))?;
            warn!(user_id, failed = errors.len(), "user migration incomplete");
            self.ctx.journal.warn(format!(
                "user {user_id} migration incomplete: {} failures",
                errors.len()
            ));
            Ok(UserMigrationOutcome::Failed { errors })
        }
    }

    /// Restore one user's local sections from a backup
    pub async fn rollback_user(
        &self,
        user_id: &str,
        backup_id: Option<&str>,
    ) -> Result<PartialRollbackReport> {
        self.recovery.perform_partial_rollback(user_id, backup_id).await
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn from_payload<T: DeserializeOwned>(payload: &Value) -> Result<T> {
    Ok(serde_json::from_value(payload.clone())?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::RecoveryConfig;
    use crate::model::ExportDataset;
    use crate::store::remote::RemoteStore;
    use crate::store::{write_dataset, KeyValueStore, MemoryKvStore, MemoryRemoteStore, MemorySink};

    struct Fixture {
        hybrid: Arc<HybridManager>,
        local: Arc<MemoryKvStore>,
        remote: Arc<MemoryRemoteStore>,
    }

    fn session(id: &str) -> Session {
        Session {
            id: id.into(),
            user_id: "u1".into(),
            start_time: "2024-01-02T10:00:00Z".into(),
            status: "completed".into(),
            completed_at: Some("2024-01-02T10:25:00Z".into()),
            ..Default::default()
        }
    }

    fn fixture() -> Fixture {
        let mut dataset = ExportDataset::new("test");
        dataset.users.insert(
            "u1".into(),
            UserProfile {
                id: "u1".into(),
                email: "u1@example.com".into(),
                name: "Ada".into(),
                created_at: "2024-01-01T00:00:00Z".into(),
                ..Default::default()
            },
        );
        dataset.sessions.insert("u1".into(), vec![session("s1")]);
        dataset.stats.insert(
            "u1".into(),
            UserStats {
                user_id: "u1".into(),
                total_sessions: 1,
                completed_sessions: 1,
                ..Default::default()
            },
        );
        let local = Arc::new(MemoryKvStore::new());
        write_dataset(local.as_ref(), &dataset).unwrap();
        let remote = Arc::new(MemoryRemoteStore::new());
        let ctx = EngineContext::new(
            local.clone(),
            remote.clone(),
            Arc::new(MemorySink::new()),
            100,
        );
        let recovery = Arc::new(RecoveryManager::new(ctx.clone(), RecoveryConfig::default()));
        let hybrid = Arc::new(HybridManager::new(ctx, recovery, HybridConfig::default()));
        Fixture {
            hybrid,
            local,
            remote,
        }
    }

    async fn migrated() -> Fixture {
        let f = fixture();
        let outcome = f
            .hybrid
            .migrate_user("u1", UserMigrationOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, UserMigrationOutcome::Migrated { records: 3 });
        f
    }

    #[tokio::test]
    async fn test_unmigrated_user_writes_locally_only() {
        let f = fixture();
        let outcome = f.hybrid.save_session(&session("s2")).await.unwrap();

        assert_eq!(outcome, WriteOutcome::LocalOnly);
        assert_eq!(f.remote.write_count(), 0);
        let stored: Vec<Session> = f
            .local
            .get_json(&keys::sessions_key("u1"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_migrated_user_is_mirrored() {
        let f = migrated().await;
        let outcome = f.hybrid.save_session(&session("s2")).await.unwrap();

        assert_eq!(outcome, WriteOutcome::Mirrored);
        assert_eq!(f.remote.row_count(RemoteTable::Sessions), 2);
        assert!(f.hybrid.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_write_queues_and_drains_on_reconnect() {
        let f = migrated().await;
        f.hybrid.set_online(false).await.unwrap();

        let outcome = f.hybrid.save_session(&session("s2")).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Queued);
        assert_eq!(f.hybrid.pending().unwrap().len(), 1);

        let report = f.hybrid.set_online(true).await.unwrap().unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(f.hybrid.pending().unwrap().is_empty());
        assert_eq!(f.remote.row_count(RemoteTable::Sessions), 2);
    }

    #[tokio::test]
    async fn test_mirror_failure_never_fails_local_write() {
        let f = migrated().await;
        f.remote.fail_user("u1");

        let mut stats: UserStats = f.local.get_json(&keys::stats_key("u1")).unwrap().unwrap();
        stats.total_sessions = 2;
        let outcome = f.hybrid.update_stats(&stats).await.unwrap();

        assert_eq!(outcome, WriteOutcome::Queued);
        let stored: UserStats = f.local.get_json(&keys::stats_key("u1")).unwrap().unwrap();
        assert_eq!(stored.total_sessions, 2);
    }

    #[tokio::test]
    async fn test_queue_item_fails_permanently_after_max_attempts() {
        let f = migrated().await;
        f.remote.fail_user("u1");
        f.hybrid.save_session(&session("s2")).await.unwrap();
        let writes_before = f.remote.write_count();

        for attempt in 1..=2 {
            let report = f.hybrid.drain().await.unwrap();
            assert_eq!(report.retried, 1, "attempt {attempt}");
            assert_eq!(f.hybrid.pending().unwrap()[0].attempts, attempt);
        }
        let report = f.hybrid.drain().await.unwrap();
        assert_eq!(report.permanently_failed.len(), 1);
        assert_eq!(report.permanently_failed[0].attempts, 3);
        assert!(f.hybrid.pending().unwrap().is_empty());

        let report = f.hybrid.drain().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(f.remote.write_count() - writes_before, 3);
    }

    #[tokio::test]
    async fn test_malformed_queue_item_is_not_retried() {
        let f = migrated().await;
        let item = SyncQueueItem::new(SyncOperation::DeleteMeeting, "u1", json!({}), 3);
        f.hybrid.queue.push(item).unwrap();

        let report = f.hybrid.drain().await.unwrap();
        assert_eq!(report.retried, 0);
        assert_eq!(report.permanently_failed.len(), 1);
        assert_eq!(report.permanently_failed[0].attempts, 1);
        assert!(report.permanently_failed[0]
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("no id")));
        assert!(f.hybrid.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_skips_locked_users() {
        let f = migrated().await;
        f.hybrid.set_online(false).await.unwrap();
        f.hybrid.save_session(&session("s2")).await.unwrap();
        let _lock = f.hybrid.ctx.locks.try_acquire("u1", "migration").unwrap();

        let report = f.hybrid.set_online(true).await.unwrap().unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.attempted, 0);
        assert_eq!(f.hybrid.pending().unwrap()[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_migrate_user_is_idempotent() {
        let f = migrated().await;
        let writes = f.remote.write_count();

        let outcome = f
            .hybrid
            .migrate_user("u1", UserMigrationOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, UserMigrationOutcome::Skipped);
        assert_eq!(f.remote.write_count(), writes);

        let forced = UserMigrationOptions {
            force_remigration: true,
            ..Default::default()
        };
        let outcome = f.hybrid.migrate_user("u1", forced).await.unwrap();
        assert!(matches!(outcome, UserMigrationOutcome::Migrated { .. }));
    }

    #[tokio::test]
    async fn test_partial_failure_leaves_user_unmigrated() {
        let f = fixture();
        f.remote.fail_user("u1");

        let outcome = f
            .hybrid
            .migrate_user("u1", UserMigrationOptions::default())
            .await
            .unwrap();
        let UserMigrationOutcome::Failed { errors } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(errors.len(), 3);
        let status = f.hybrid.ctx.user_status.get("u1").unwrap();
        assert!(!status.migrated);
        assert!(status.reason.is_some());
    }

    #[tokio::test]
    async fn test_unreadable_section_leaves_user_unmigrated() {
        let f = fixture();
        f.local.set(&keys::sessions_key("u1"), "{not json").unwrap();

        let outcome = f
            .hybrid
            .migrate_user("u1", UserMigrationOptions::default())
            .await
            .unwrap();
        let UserMigrationOutcome::Failed { errors } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains(&keys::sessions_key("u1")), "{errors:?}");
        assert_eq!(f.remote.row_count(RemoteTable::Sessions), 0);
        assert!(!f.hybrid.ctx.user_status.is_migrated("u1").unwrap());

        // Once the section is repaired the next attempt goes through
        f.local
            .set_json(&keys::sessions_key("u1"), &vec![session("s1")])
            .unwrap();
        let outcome = f
            .hybrid
            .migrate_user("u1", UserMigrationOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, UserMigrationOutcome::Migrated { records: 3 });
        assert_eq!(f.remote.row_count(RemoteTable::Sessions), 1);
    }

    #[tokio::test]
    async fn test_get_stats_merges_remote_counters() {
        let f = migrated().await;
        let remote_stats = UserStats {
            user_id: "u1".into(),
            total_sessions: 9,
            completed_sessions: 9,
            updated_at: Some("2030-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        f.remote.upsert_stats(&remote_stats).await.unwrap();

        let merged = f.hybrid.get_stats("u1").await.unwrap().unwrap();
        assert_eq!(merged.total_sessions, 9);
        let stored: UserStats = f.local.get_json(&keys::stats_key("u1")).unwrap().unwrap();
        assert_eq!(stored, merged);
    }

    #[tokio::test]
    async fn test_delete_meeting_and_profile_update() {
        let f = migrated().await;
        let meeting = Meeting {
            id: "m1".into(),
            user_id: "u1".into(),
            title: "Standup".into(),
            date: "2024-01-03".into(),
            time: "09:00".into(),
            duration: 15,
            created_at: "2024-01-01T00:00:00Z".into(),
            ..Default::default()
        };
        assert_eq!(
            f.hybrid.save_meeting(&meeting).await.unwrap(),
            WriteOutcome::Mirrored
        );
        assert_eq!(f.remote.row_count(RemoteTable::Meetings), 1);
        f.hybrid.delete_meeting("u1", "m1").await.unwrap();
        assert_eq!(f.remote.row_count(RemoteTable::Meetings), 0);
        assert!(f.hybrid.delete_meeting("u1", "m1").await.is_err());

        let mut profile = f.remote.get_user("u1").await.unwrap().unwrap();
        profile.name = "Ada L.".into();
        f.hybrid.update_profile(&profile).await.unwrap();
        assert_eq!(f.remote.get_user("u1").await.unwrap().unwrap().name, "Ada L.");
    }

    #[tokio::test]
    async fn test_mode_flag_persists() {
        let f = fixture();
        assert!(!f.hybrid.is_enabled().unwrap());
        f.hybrid.enable().unwrap();
        assert!(f.hybrid.is_enabled().unwrap());
        let state = f.hybrid.disable().unwrap();
        assert!(!state.enabled);
        assert!(state.enabled_at.is_some());
    }

    #[tokio::test]
    async fn test_remote_stats_watcher_applies_changes() {
        let f = migrated().await;
        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = f
            .hybrid
            .clone()
            .watch_remote_stats(shutdown_tx.subscribe())
            .await
            .unwrap();

        let remote_stats = UserStats {
            user_id: "u1".into(),
            total_sessions: 4,
            ..Default::default()
        };
        f.remote.upsert_stats(&remote_stats).await.unwrap();

        for _ in 0..50 {
            let stored: UserStats = f.local.get_json(&keys::stats_key("u1")).unwrap().unwrap();
            if stored.total_sessions == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stored: UserStats = f.local.get_json(&keys::stats_key("u1")).unwrap().unwrap();
        assert_eq!(stored.total_sessions, 4);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
