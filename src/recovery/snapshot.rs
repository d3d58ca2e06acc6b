//! Snapshot ring
//!
//! Snapshots are kept newest-last in a bounded list persisted in the local
//! store. Pushing past capacity evicts the oldest entries first.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::store::keys::SNAPSHOTS_KEY;
use crate::store::{KeyValueStore, KeyValueStoreExt};

use super::backup::Backup;

/// Bounded, persisted list of snapshots
pub struct SnapshotRing {
    store: Arc<dyn KeyValueStore>,
    capacity: usize,
    write_lock: Mutex<()>,
}

impl SnapshotRing {
    /// Create a ring holding at most `capacity` snapshots
    pub fn new(store: Arc<dyn KeyValueStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            write_lock: Mutex::new(()),
        }
    }

    /// Maximum number of snapshots kept
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshots, oldest first
    pub fn list(&self) -> Result<Vec<Backup>> {
        Ok(self.store.get_json(SNAPSHOTS_KEY)?.unwrap_or_default())
    }

    /// Append a snapshot, returning whatever was evicted
    pub fn push(&self, snapshot: Backup) -> Result<Vec<Backup>> {
        let _guard = self.write_lock.lock();
        let mut ring = self.list()?;
        ring.push(snapshot);

        let overflow = ring.len().saturating_sub(self.capacity);
        let evicted: Vec<Backup> = ring.drain(..overflow).collect();
        for old in &evicted {
            debug!(snapshot_id = %old.id, "evicted snapshot");
        }

        self.store.set_json(SNAPSHOTS_KEY, &ring)?;
        Ok(evicted)
    }

    /// Find a snapshot by id
    pub fn get(&self, id: &str) -> Result<Option<Backup>> {
        Ok(self.list()?.into_iter().find(|s| s.id == id))
    }

    /// Remove a snapshot, returning whether it existed
    pub fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let mut ring = self.list()?;
        let before = ring.len();
        ring.retain(|s| s.id != id);
        if ring.len() == before {
            return Ok(false);
        }
        self.store.set_json(SNAPSHOTS_KEY, &ring)?;
        Ok(true)
    }
}
