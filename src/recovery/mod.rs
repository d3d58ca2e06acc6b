//! Backup, snapshot and rollback
//!
//! The [`RecoveryManager`] owns every copy of the application namespace the
//! engine takes:
//!
//! - **Full backups** are stored as the latest backup, indexed, and exported
//!   as a file through the [`BackupSink`](crate::store::BackupSink).
//! - **Snapshots** are cheaper event-tagged copies kept in a bounded ring.
//!
//! A full rollback is itself undoable: the current state is snapshotted
//! first, the restored state is compared key-by-key against the plan, and a
//! mismatch puts the pre-rollback snapshot back before failing.

pub mod backup;
pub mod conflict;
pub mod snapshot;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::error::{MigrationError, Result};
use crate::state::EngineContext;
use crate::store::keys::{self, BACKUP_INDEX_KEY, LATEST_BACKUP_KEY, USERS_KEY};
use crate::store::KeyValueStoreExt;

pub use backup::{
    compute_checksum, index_user_ids, Backup, BackupData, BackupInfo, BackupKind, BackupOptions,
    BackupSource, BackupValidation,
};
pub use conflict::{merge_values, resolve_conflict, Conflict, ConflictStrategy};
pub use snapshot::SnapshotRing;

/// Full backups remembered in the index
const MAX_INDEX_ENTRIES: usize = 100;

/// Snapshot event before a rollback
pub const EVENT_PRE_ROLLBACK: &str = "pre_rollback";
/// Snapshot event after a rollback
pub const EVENT_POST_ROLLBACK: &str = "post_rollback";

// ---------------------------------------------------------------------------
// Rollback types
// ---------------------------------------------------------------------------

/// Options for [`RecoveryManager::perform_full_rollback`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOptions {
    /// Restore even if the backup fails validation
    pub skip_validation: bool,
    /// Snapshot the current state first so the rollback can be undone
    pub snapshot_before: bool,
    /// How to settle keys that differ from the backup
    pub conflict_strategy: ConflictStrategy,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            skip_validation: false,
            snapshot_before: true,
            conflict_strategy: ConflictStrategy::PreferBackup,
        }
    }
}

/// Outcome of a full rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Backup restored
    pub backup_id: String,
    /// Snapshot taken before restoring
    pub pre_snapshot_id: Option<String>,
    /// Snapshot taken after restoring
    pub post_snapshot_id: String,
    /// Keys written
    pub restored_keys: usize,
    /// Keys removed
    pub removed_keys: usize,
    /// Keys already matching the backup
    pub unchanged_keys: usize,
    /// Conflicts settled by the strategy
    pub conflicts_resolved: usize,
    /// Users in the restored index
    pub users_restored: usize,
}

/// Outcome of a single-user rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialRollbackReport {
    /// Backup restored from
    pub backup_id: String,
    /// User restored
    pub user_id: String,
    /// Keys written
    pub restored_keys: usize,
    /// Keys removed
    pub removed_keys: usize,
    /// Whether the user exists in the backup
    pub user_in_backup: bool,
}

/// Resolved restore: what to write and what to remove
#[derive(Debug, Default)]
struct RestorePlan {
    writes: BTreeMap<String, String>,
    removals: Vec<String>,
    unchanged: usize,
    conflicts: usize,
}

impl RestorePlan {
    /// The namespace as it should look once applied
    fn expected(&self, current: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut expected = current.clone();
        for key in &self.removals {
            expected.remove(key);
        }
        for (key, value) in &self.writes {
            expected.insert(key.clone(), value.clone());
        }
        expected
    }
}

// ---------------------------------------------------------------------------
// RecoveryManager
// ---------------------------------------------------------------------------

/// Creates backups and snapshots and restores from them
pub struct RecoveryManager {
    ctx: EngineContext,
    config: RecoveryConfig,
    snapshots: SnapshotRing,
    restore_lock: Mutex<()>,
}

impl RecoveryManager {
    /// Create a recovery manager
    pub fn new(ctx: EngineContext, config: RecoveryConfig) -> Self {
        let snapshots = SnapshotRing::new(ctx.local.clone(), config.max_snapshots);
        Self {
            ctx,
            config,
            snapshots,
            restore_lock: Mutex::new(()),
        }
    }

    /// Backup options derived from configuration
    pub fn default_backup_options(&self) -> BackupOptions {
        BackupOptions {
            include_snapshots: false,
            compress: self.config.compress,
            checksum: self.config.checksum,
            export_copy: self.config.export_copies,
        }
    }

    /// Copy the namespace into a new full backup.
    ///
    /// Local backups become the latest backup. Remote backups exist for
    /// verification and are only exported to the sink.
    pub async fn create_full_backup(
        &self,
        source: BackupSource,
        options: BackupOptions,
    ) -> Result<Backup> {
        let entries = match source {
            BackupSource::Local => self.ctx.local.entries_where(keys::is_app_key)?,
            BackupSource::Remote => self.ctx.remote.export_tables().await?,
        };

        let mut backup = Backup::capture(
            source,
            BackupKind::Full,
            entries,
            options.compress,
            options.checksum,
        )?;
        if options.include_snapshots {
            backup.snapshots = self.snapshots.list()?;
        }

        if source == BackupSource::Local {
            self.ctx.local.set_json(LATEST_BACKUP_KEY, &backup)?;
        }
        self.record_in_index(&backup)?;

        if options.export_copy || source == BackupSource::Remote {
            let name = backup::sink_file_name(&backup.id);
            if let Err(e) = self.ctx.sink.store(&name, &backup.to_bytes()?).await {
                if source == BackupSource::Remote {
                    return Err(e);
                }
                warn!(backup_id = %backup.id, error = %e, "failed to export backup copy");
                self.ctx
                    .journal
                    .warn(format!("backup {} was not exported: {e}", backup.id));
            }
        }

        info!(
            backup_id = %backup.id,
            source = %source,
            entries = backup.entry_count,
            users = backup.user_ids.len(),
            compressed = backup.compressed,
            "full backup created"
        );
        self.ctx.journal.info(format!(
            "created {source} backup {} ({} entries)",
            backup.id, backup.entry_count
        ));
        Ok(backup)
    }

    /// Take a snapshot of the local namespace tagged with `event`
    pub fn create_snapshot(&self, event: &str, description: Option<String>) -> Result<Backup> {
        let entries = self.ctx.local.entries_where(keys::is_app_key)?;
        let snapshot = Backup::capture(
            BackupSource::Local,
            BackupKind::Snapshot,
            entries,
            false,
            self.config.checksum,
        )?
        .with_event(event, description);

        let evicted = self.snapshots.push(snapshot.clone())?;
        debug!(
            snapshot_id = %snapshot.id,
            event,
            evicted = evicted.len(),
            "snapshot created"
        );
        Ok(snapshot)
    }

    /// Delete a snapshot, returning whether it existed
    pub fn discard_snapshot(&self, id: &str) -> Result<bool> {
        self.snapshots.remove(id)
    }

    /// Snapshots, oldest first
    pub fn snapshots(&self) -> Result<Vec<Backup>> {
        self.snapshots.list()
    }

    /// Most recent local full backup
    pub fn latest_backup(&self) -> Result<Option<Backup>> {
        self.ctx.local.get_json(LATEST_BACKUP_KEY)
    }

    /// Check a backup's payload, checksum and shape
    pub fn validate_backup(&self, backup: &Backup) -> BackupValidation {
        backup.validate()
    }

    /// Every known backup and snapshot, newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        let mut infos = self.index()?;
        infos.extend(self.snapshots.list()?.iter().map(Backup::info));

        let known: HashSet<String> = infos.iter().map(|i| i.id.clone()).collect();
        for name in self.ctx.sink.list().await? {
            let Some(id) = backup::parse_sink_file_name(&name) else {
                continue;
            };
            if known.contains(id) {
                continue;
            }
            match self.load_backup(id).await {
                Ok(backup) => infos.push(backup.info()),
                Err(e) => warn!(file = %name, error = %e, "skipping unreadable backup file"),
            }
        }

        infos.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(infos)
    }

    /// Read a backup file from the sink
    pub async fn load_backup(&self, id: &str) -> Result<Backup> {
        let data = self.ctx.sink.retrieve(&backup::sink_file_name(id)).await?;
        Backup::from_bytes(&data)
    }

    /// Find a backup by id: latest, then snapshots, then the sink
    pub async fn find_backup(&self, id: &str) -> Result<Backup> {
        if let Some(latest) = self.latest_backup()? {
            if latest.id == id {
                return Ok(latest);
            }
        }
        if let Some(snapshot) = self.snapshots.get(id)? {
            return Ok(snapshot);
        }
        match self.load_backup(id).await {
            Ok(backup) => Ok(backup),
            Err(MigrationError::NotFound(_)) => Err(MigrationError::NotFound(format!("backup {id}"))),
            Err(e) => Err(e),
        }
    }

    /// Restore the whole namespace from a backup (the latest when `backup_id` is `None`)
    pub async fn perform_full_rollback(
        &self,
        backup_id: Option<&str>,
        options: RollbackOptions,
    ) -> Result<RollbackReport> {
        let _guard = self.restore_lock.lock().await;

        let backup = self.select_backup(backup_id).await?;
        if !options.skip_validation {
            ensure_valid(&backup)?;
        }
        let target = backup.entries()?;

        let pre_snapshot = if options.snapshot_before {
            Some(self.create_snapshot(
                EVENT_PRE_ROLLBACK,
                Some(format!("before restoring backup {}", backup.id)),
            )?)
        } else {
            None
        };

        let current = self.ctx.local.entries_where(keys::is_app_key)?;
        let plan = plan_restore(&current, &target, options.conflict_strategy)?;
        let expected = plan.expected(&current);

        info!(
            backup_id = %backup.id,
            writes = plan.writes.len(),
            removals = plan.removals.len(),
            conflicts = plan.conflicts,
            strategy = %options.conflict_strategy,
            "restoring backup"
        );
        let applied = self.apply_plan(&plan);
        let restored = self.ctx.local.entries_where(keys::is_app_key);

        let verified = matches!((&applied, &restored), (Ok(()), Ok(state)) if *state == expected);
        if !verified {
            let detail = match (applied, restored) {
                (Err(e), _) | (_, Err(e)) => e.to_string(),
                _ => "restored state does not match the backup".to_string(),
            };
            return Err(self.undo_rollback(&backup.id, pre_snapshot.as_ref(), &detail));
        }

        self.ctx.status.clear()?;
        self.ctx.user_status.clear()?;

        let post_snapshot = self.create_snapshot(
            EVENT_POST_ROLLBACK,
            Some(format!("after restoring backup {}", backup.id)),
        )?;

        let users_restored = expected
            .get(USERS_KEY)
            .map(|raw| index_user_ids(raw).len())
            .unwrap_or(0);

        let report = RollbackReport {
            backup_id: backup.id.clone(),
            pre_snapshot_id: pre_snapshot.map(|s| s.id),
            post_snapshot_id: post_snapshot.id,
            restored_keys: plan.writes.len(),
            removed_keys: plan.removals.len(),
            unchanged_keys: plan.unchanged,
            conflicts_resolved: plan.conflicts,
            users_restored,
        };
        info!(
            backup_id = %report.backup_id,
            users = users_restored,
            restored = report.restored_keys,
            removed = report.removed_keys,
            "rollback complete"
        );
        self.ctx.journal.info(format!(
            "rolled back to backup {} ({} users)",
            report.backup_id, users_restored
        ));
        Ok(report)
    }

    /// Restore one user's sections and index entry, leaving everyone else alone
    pub async fn perform_partial_rollback(
        &self,
        user_id: &str,
        backup_id: Option<&str>,
    ) -> Result<PartialRollbackReport> {
        let _guard = self.restore_lock.lock().await;
        let _user = self.ctx.locks.try_acquire(user_id, "partial_rollback")?;

        let backup = self.select_backup(backup_id).await?;
        ensure_valid(&backup)?;
        let entries = backup.entries()?;

        if self.config.snapshot_before_rollback {
            self.create_snapshot(
                EVENT_PRE_ROLLBACK,
                Some(format!("before restoring user {user_id} from {}", backup.id)),
            )?;
        }

        let mut restored_keys = 0;
        let mut removed_keys = 0;
        for key in keys::user_section_keys(user_id) {
            match entries.get(&key) {
                Some(value) => {
                    self.ctx.local.set(&key, value)?;
                    restored_keys += 1;
                }
                None => {
                    if self.ctx.local.get(&key)?.is_some() {
                        self.ctx.local.remove(&key)?;
                        removed_keys += 1;
                    }
                }
            }
        }

        let backup_entry = entries
            .get(USERS_KEY)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|index| index_entry(&index, user_id));
        let user_in_backup = backup_entry.is_some();
        let local_index = self
            .ctx
            .local
            .get(USERS_KEY)?
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .unwrap_or_else(|| Value::Object(Map::new()));
        let updated = upsert_index_entry(local_index, user_id, backup_entry);
        self.ctx.local.set_json(USERS_KEY, &updated)?;

        self.ctx
            .user_status
            .reset(user_id, format!("rolled back to backup {}", backup.id))?;

        info!(
            user_id,
            backup_id = %backup.id,
            restored = restored_keys,
            removed = removed_keys,
            "partial rollback complete"
        );
        self.ctx
            .journal
            .info(format!("rolled back user {user_id} to backup {}", backup.id));

        Ok(PartialRollbackReport {
            backup_id: backup.id,
            user_id: user_id.to_string(),
            restored_keys,
            removed_keys,
            user_in_backup,
        })
    }

    async fn select_backup(&self, backup_id: Option<&str>) -> Result<Backup> {
        let backup = match backup_id {
            Some(id) => self.find_backup(id).await?,
            None => self
                .latest_backup()?
                .ok_or_else(|| MigrationError::NotFound("no backup available".to_string()))?,
        };
        if backup.source == BackupSource::Remote {
            return Err(MigrationError::Backup(format!(
                "backup {} was taken from the remote store and cannot be restored locally",
                backup.id
            )));
        }
        Ok(backup)
    }

    fn apply_plan(&self, plan: &RestorePlan) -> Result<()> {
        for (key, value) in &plan.writes {
            self.ctx.local.set(key, value)?;
        }
        for key in &plan.removals {
            self.ctx.local.remove(key)?;
        }
        Ok(())
    }

    /// Put the pre-rollback snapshot back and build the error to return
    fn undo_rollback(
        &self,
        backup_id: &str,
        pre_snapshot: Option<&Backup>,
        detail: &str,
    ) -> MigrationError {
        self.ctx
            .journal
            .error(format!("rollback to {backup_id} failed verification: {detail}"));

        let Some(snapshot) = pre_snapshot else {
            warn!(backup_id, detail, "rollback failed with no pre-rollback snapshot");
            return MigrationError::Backup(format!(
                "rollback to {backup_id} failed verification ({detail}); no pre-rollback snapshot was taken"
            ));
        };

        match snapshot.entries().and_then(|entries| self.restore_exact(&entries)) {
            Ok(()) => {
                warn!(backup_id, snapshot_id = %snapshot.id, detail, "rollback undone");
                MigrationError::Backup(format!(
                    "rollback to {backup_id} failed verification ({detail}); local state restored from snapshot {}",
                    snapshot.id
                ))
            }
            Err(e) => MigrationError::Backup(format!(
                "rollback to {backup_id} failed verification ({detail}) and snapshot {} could not be restored: {e}",
                snapshot.id
            )),
        }
    }

    /// Make the namespace equal `entries`
    fn restore_exact(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        for key in self.ctx.local.entries_where(keys::is_app_key)?.keys() {
            if !entries.contains_key(key) {
                self.ctx.local.remove(key)?;
            }
        }
        for (key, value) in entries {
            self.ctx.local.set(key, value)?;
        }
        Ok(())
    }

    fn index(&self) -> Result<Vec<BackupInfo>> {
        Ok(self.ctx.local.get_json(BACKUP_INDEX_KEY)?.unwrap_or_default())
    }

    fn record_in_index(&self, backup: &Backup) -> Result<()> {
        let mut index = self.index()?;
        index.push(backup.info());
        let overflow = index.len().saturating_sub(MAX_INDEX_ENTRIES);
        index.drain(..overflow);
        self.ctx.local.set_json(BACKUP_INDEX_KEY, &index)
    }
}

fn ensure_valid(backup: &Backup) -> Result<()> {
    let validation = backup.validate();
    if validation.valid {
        Ok(())
    } else {
        Err(MigrationError::Backup(format!(
            "backup {} failed validation: {}",
            backup.id,
            validation.issues.join("; ")
        )))
    }
}

fn parse_raw(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Decide every write and removal before touching the store
fn plan_restore(
    current: &BTreeMap<String, String>,
    target: &BTreeMap<String, String>,
    strategy: ConflictStrategy,
) -> Result<RestorePlan> {
    let mut plan = RestorePlan::default();

    for (key, backup_raw) in target {
        match current.get(key) {
            None => {
                plan.writes.insert(key.clone(), backup_raw.clone());
            }
            Some(local_raw) if local_raw == backup_raw => plan.unchanged += 1,
            Some(local_raw) => settle(&mut plan, strategy, key, Some(local_raw), Some(backup_raw))?,
        }
    }
    for (key, local_raw) in current {
        if !target.contains_key(key) {
            settle(&mut plan, strategy, key, Some(local_raw), None)?;
        }
    }

    Ok(plan)
}

/// Resolve one differing key into the plan
fn settle(
    plan: &mut RestorePlan,
    strategy: ConflictStrategy,
    key: &str,
    local: Option<&String>,
    backup: Option<&String>,
) -> Result<()> {
    let conflict = Conflict {
        key: key.to_string(),
        local_value: local.map_or(Value::Null, |raw| parse_raw(raw)),
        backup_value: backup.map_or(Value::Null, |raw| parse_raw(raw)),
    };
    let resolved = resolve_conflict(&conflict, strategy)?;
    plan.conflicts += 1;

    if resolved.is_null() {
        if local.is_some() {
            plan.removals.push(key.to_string());
        }
    } else if resolved == conflict.backup_value {
        if let Some(raw) = backup {
            plan.writes.insert(key.to_string(), raw.clone());
        }
    } else if resolved == conflict.local_value {
        plan.unchanged += 1;
    } else {
        plan.writes
            .insert(key.to_string(), serde_json::to_string(&resolved)?);
    }
    Ok(())
}

/// A user's entry in a users index
fn index_entry(index: &Value, user_id: &str) -> Option<Value> {
    match index {
        Value::Object(map) => map.get(user_id).cloned(),
        Value::Array(list) => list
            .iter()
            .find(|entry| match entry {
                Value::String(id) => id == user_id,
                other => other.get("id").and_then(Value::as_str) == Some(user_id),
            })
            .cloned(),
        _ => None,
    }
}

/// Replace (or drop, when `entry` is `None`) a user's entry in a users index
pub(crate) fn upsert_index_entry(index: Value, user_id: &str, entry: Option<Value>) -> Value {
    match index {
        Value::Array(list) => {
            let mut list: Vec<Value> = list
                .into_iter()
                .filter(|e| match e {
                    Value::String(id) => id != user_id,
                    other => other.get("id").and_then(Value::as_str) != Some(user_id),
                })
                .collect();
            list.extend(entry);
            Value::Array(list)
        }
        Value::Object(mut map) => {
            match entry {
                Some(entry) => {
                    map.insert(user_id.to_string(), entry);
                }
                None => {
                    map.remove(user_id);
                }
            }
            Value::Object(map)
        }
        _ => {
            let mut map = Map::new();
            if let Some(entry) = entry {
                map.insert(user_id.to_string(), entry);
            }
            Value::Object(map)
        }
    }
}
