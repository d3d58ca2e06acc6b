//! Durable queue of deferred remote writes.
//!
//! Items are persisted under [`SYNC_QUEUE_KEY`] in insertion order. The
//! queue itself never talks to the remote store: the drain loop takes a
//! copy with [`SyncQueue::items`], works without holding any lock, and folds
//! its results back with [`SyncQueue::settle`] so items enqueued meanwhile
//! survive.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::store::keys::SYNC_QUEUE_KEY;
use crate::store::{KeyValueStore, KeyValueStoreExt};

/// Remote write kinds that can be deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    /// Insert or replace a session
    UpsertSession,
    /// Insert or replace statistics
    UpsertStats,
    /// Insert or replace a meeting
    UpsertMeeting,
    /// Delete a meeting
    DeleteMeeting,
    /// Insert or replace a profile
    UpdateProfile,
    /// Replace preferences
    UpdatePreferences,
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpsertSession => write!(f, "upsert_session"),
            Self::UpsertStats => write!(f, "upsert_stats"),
            Self::UpsertMeeting => write!(f, "upsert_meeting"),
            Self::DeleteMeeting => write!(f, "delete_meeting"),
            Self::UpdateProfile => write!(f, "update_profile"),
            Self::UpdatePreferences => write!(f, "update_preferences"),
        }
    }
}

/// A deferred remote write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    /// Queue item id
    pub id: String,
    /// What to replay
    pub operation: SyncOperation,
    /// Acting user
    pub user_id: String,
    /// Record to send
    pub payload: Value,
    /// When the write was deferred
    pub timestamp: DateTime<Utc>,
    /// Replays tried so far
    pub attempts: u32,
    /// Replays allowed before the item is dropped
    pub max_attempts: u32,
    /// Error from the last replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    /// Create an item with no attempts yet.
    pub fn new(
        operation: SyncOperation,
        user_id: impl Into<String>,
        payload: Value,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation,
            user_id: user_id.into(),
            payload,
            timestamp: Utc::now(),
            attempts: 0,
            max_attempts,
            last_error: None,
        }
    }

    /// Whether every allowed replay has been used.
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Persisted sync queue.
#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<dyn KeyValueStore>,
    write_lock: Arc<Mutex<()>>,
}

impl SyncQueue {
    /// Create a queue over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Every queued item, oldest first.
    pub fn items(&self) -> Result<Vec<SyncQueueItem>> {
        Ok(self.store.get_json(SYNC_QUEUE_KEY)?.unwrap_or_default())
    }

    /// Number of queued items.
    pub fn len(&self) -> Result<usize> {
        Ok(self.items()?.len())
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Append an item.
    pub fn push(&self, item: SyncQueueItem) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut items = self.items()?;
        items.push(item);
        self.store.set_json(SYNC_QUEUE_KEY, &items)
    }

    /// Fold drain results back: drop `finished` ids and replace items
    /// present in `updated`. Items not mentioned are kept as they are.
    pub fn settle(&self, finished: &HashSet<String>, updated: &[SyncQueueItem]) -> Result<()> {
        let _guard = self.write_lock.lock();
        let items: Vec<SyncQueueItem> = self
            .items()?
            .into_iter()
            .filter(|item| !finished.contains(&item.id))
            .map(|item| {
                updated
                    .iter()
                    .find(|u| u.id == item.id)
                    .cloned()
                    .unwrap_or(item)
            })
            .collect();
        self.store.set_json(SYNC_QUEUE_KEY, &items)
    }

    /// Drop every item.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.store.remove(SYNC_QUEUE_KEY)
    }
}
