//! Per-user migration status map.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::keys::USER_STATUS_KEY;
use crate::store::{KeyValueStore, KeyValueStoreExt};

/// Migration state of a single user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMigrationStatus {
    /// All sections of the user reached the remote store.
    pub migrated: bool,
    /// Last successful remote sync.
    pub last_sync: Option<DateTime<Utc>>,
    /// The user still has local data to push.
    pub needs_migration: bool,
    /// Why the user is in this state.
    pub reason: Option<String>,
}

impl Default for UserMigrationStatus {
    fn default() -> Self {
        Self {
            migrated: false,
            last_sync: None,
            needs_migration: true,
            reason: None,
        }
    }
}

/// Persisted map of user id to [`UserMigrationStatus`].
#[derive(Clone)]
pub struct UserStatusStore {
    store: Arc<dyn KeyValueStore>,
    write_lock: Arc<Mutex<()>>,
}

impl UserStatusStore {
    /// Create a user status store over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Status of every known user.
    pub fn all(&self) -> Result<BTreeMap<String, UserMigrationStatus>> {
        Ok(self.store.get_json(USER_STATUS_KEY)?.unwrap_or_default())
    }

    /// Status of one user; unknown users start unmigrated.
    pub fn get(&self, user_id: &str) -> Result<UserMigrationStatus> {
        Ok(self.all()?.remove(user_id).unwrap_or_default())
    }

    /// Whether `user_id` is fully migrated.
    pub fn is_migrated(&self, user_id: &str) -> Result<bool> {
        Ok(self.get(user_id)?.migrated)
    }

    /// Record a fully successful transfer.
    pub fn mark_migrated(&self, user_id: &str) -> Result<UserMigrationStatus> {
        self.modify(user_id, |status| {
            status.migrated = true;
            status.needs_migration = false;
            status.last_sync = Some(Utc::now());
            status.reason = None;
        })
    }

    /// Record a failed or partial transfer.
    pub fn mark_failed(&self, user_id: &str, reason: impl Into<String>) -> Result<UserMigrationStatus> {
        let reason = reason.into();
        self.modify(user_id, |status| {
            status.migrated = false;
            status.needs_migration = true;
            status.reason = Some(reason);
        })
    }

    /// Record a successful sync of an already migrated user.
    pub fn touch_sync(&self, user_id: &str) -> Result<UserMigrationStatus> {
        self.modify(user_id, |status| {
            status.last_sync = Some(Utc::now());
        })
    }

    /// Reset one user to unmigrated.
    pub fn reset(&self, user_id: &str, reason: impl Into<String>) -> Result<UserMigrationStatus> {
        let reason = reason.into();
        self.modify(user_id, |status| {
            *status = UserMigrationStatus {
                reason: Some(reason),
                ..Default::default()
            };
        })
    }

    /// Forget every user.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.store.remove(USER_STATUS_KEY)
    }

    fn modify<F>(&self, user_id: &str, f: F) -> Result<UserMigrationStatus>
    where
        F: FnOnce(&mut UserMigrationStatus),
    {
        let _guard = self.write_lock.lock();
        let mut all = self.all()?;
        let status = all.entry(user_id.to_string()).or_default();
        f(status);
        let updated = status.clone();
        self.store.set_json(USER_STATUS_KEY, &all)?;
        Ok(updated)
    }
}
