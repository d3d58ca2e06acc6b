//! Persisted engine state
//!
//! All state lives in the local key-value store under the engine prefix and
//! is reached through these small injectable wrappers rather than through
//! globals.

pub mod journal;
pub mod locks;
pub mod status;
pub mod user_status;

use std::sync::Arc;

use crate::store::{BackupSink, KeyValueStore, RemoteStore};

pub use journal::{Journal, JournalEntry, JournalLevel};
pub use locks::{UserLockGuard, UserLocks};
pub use status::{MigrationStatus, MigrationStep, RunState, StatusError, StatusStore};
pub use user_status::{UserMigrationStatus, UserStatusStore};

/// Shared handles every engine component works against
#[derive(Clone)]
pub struct EngineContext {
    /// Local key-value store
    pub local: Arc<dyn KeyValueStore>,
    /// Remote relational store
    pub remote: Arc<dyn RemoteStore>,
    /// Destination for exported backup files
    pub sink: Arc<dyn BackupSink>,
    /// Run status
    pub status: StatusStore,
    /// Per-user migration state
    pub user_status: UserStatusStore,
    /// Persisted textual log
    pub journal: Journal,
    /// Per-user migration locks
    pub locks: UserLocks,
}

impl EngineContext {
    /// Wire the state wrappers over `local`
    pub fn new(
        local: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        sink: Arc<dyn BackupSink>,
        journal_max_entries: usize,
    ) -> Self {
        Self {
            status: StatusStore::new(local.clone()),
            user_status: UserStatusStore::new(local.clone()),
            journal: Journal::new(local.clone(), journal_max_entries),
            locks: UserLocks::new(),
            local,
            remote,
            sink,
        }
    }
}
