//! Per-user migration locks
//!
//! A full migration run and a hybrid-mode migration or sync of the same
//! user must not overlap. Both acquire the user's lock first; the guard
//! releases it on drop.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{MigrationError, Result};

/// Registry of users with a migration in progress
#[derive(Clone, Default)]
pub struct UserLocks {
    held: Arc<DashMap<String, String>>,
}

impl UserLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `user_id` on behalf of `holder`
    pub fn try_acquire(&self, user_id: &str, holder: &str) -> Result<UserLockGuard> {
        match self.held.entry(user_id.to_string()) {
            Entry::Occupied(existing) => {
                debug!(user_id, holder = %existing.get(), "user lock busy");
                Err(MigrationError::UserBusy(user_id.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(holder.to_string());
                Ok(UserLockGuard {
                    held: Arc::clone(&self.held),
                    user_id: user_id.to_string(),
                })
            }
        }
    }

    /// Whether `user_id` is locked
    pub fn is_locked(&self, user_id: &str) -> bool {
        self.held.contains_key(user_id)
    }

    /// Who holds the lock for `user_id`
    pub fn holder(&self, user_id: &str) -> Option<String> {
        self.held.get(user_id).map(|h| h.value().clone())
    }
}

/// Releases a user lock on drop
#[derive(Debug)]
pub struct UserLockGuard {
    held: Arc<DashMap<String, String>>,
    user_id: String,
}

impl UserLockGuard {
    /// The locked user
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Drop for UserLockGuard {
    fn drop(&mut self) {
        self.held.remove(&self.user_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive() {
        let locks = UserLocks::new();
        let guard = locks.try_acquire("u1", "migration").unwrap();
        assert!(locks.is_locked("u1"));
        assert_eq!(locks.holder("u1").as_deref(), Some("migration"));

        let err = locks.try_acquire("u1", "hybrid").unwrap_err();
        assert!(matches!(err, MigrationError::UserBusy(ref u) if u == "u1"));

        assert!(locks.try_acquire("u2", "hybrid").is_ok());
        drop(guard);
        assert!(!locks.is_locked("u1"));
        assert!(locks.try_acquire("u1", "hybrid").is_ok());
    }

    #[test]
    fn test_shared_between_clones() {
        let locks = UserLocks::new();
        let other = locks.clone();
        let _guard = locks.try_acquire("u1", "migration").unwrap();
        assert!(other.try_acquire("u1", "hybrid").is_err());
    }
}
