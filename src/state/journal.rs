//! Bounded textual migration log
//!
//! Every component appends short human-readable lines here in addition to
//! emitting `tracing` events. The journal is persisted in the local store so
//! it survives restarts and can be inspected after a failed run. Appends
//! never fail the caller.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::store::keys::JOURNAL_KEY;
use crate::store::{KeyValueStore, KeyValueStoreExt};

/// Severity of a journal line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalLevel {
    /// Informational
    Info,
    /// Something degraded
    Warn,
    /// Something failed
    Error,
}

impl std::fmt::Display for JournalLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One journal line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// When it was written
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: JournalLevel,
    /// Text
    pub message: String,
}

impl std::fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.to_rfc3339(),
            self.level,
            self.message
        )
    }
}

/// Persisted ring of journal lines
#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn KeyValueStore>,
    max_entries: usize,
    lock: Arc<Mutex<()>>,
}

impl Journal {
    /// Create a journal keeping at most `max_entries` lines
    pub fn new(store: Arc<dyn KeyValueStore>, max_entries: usize) -> Self {
        Self {
            store,
            max_entries: max_entries.max(1),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Append an info line
    pub fn info(&self, message: impl Into<String>) {
        self.append(JournalLevel::Info, message);
    }

    /// Append a warning line
    pub fn warn(&self, message: impl Into<String>) {
        self.append(JournalLevel::Warn, message);
    }

    /// Append an error line
    pub fn error(&self, message: impl Into<String>) {
        self.append(JournalLevel::Error, message);
    }

    /// Append a line, evicting the oldest beyond capacity
    pub fn append(&self, level: JournalLevel, message: impl Into<String>) {
        let entry = JournalEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };

        let _guard = self.lock.lock();
        let result = self.load().and_then(|mut entries| {
            entries.push_back(entry);
            while entries.len() > self.max_entries {
                entries.pop_front();
            }
            self.store.set_json(JOURNAL_KEY, &entries)
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to append to migration journal");
        }
    }

    /// Every retained line, oldest first
    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        Ok(self.load()?.into_iter().collect())
    }

    /// Drop every line
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock();
        self.store.remove(JOURNAL_KEY)
    }

    fn load(&self) -> Result<VecDeque<JournalEntry>> {
        Ok(self.store.get_json(JOURNAL_KEY)?.unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    #[test]
    fn test_bounded() {
        let journal = Journal::new(Arc::new(MemoryKvStore::new()), 3);
        for i in 0..5 {
            journal.info(format!("line {i}"));
        }
        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "line 2");
        assert_eq!(entries[2].message, "line 4");
    }

    #[test]
    fn test_levels_and_display() {
        let journal = Journal::new(Arc::new(MemoryKvStore::new()), 10);
        journal.warn("slow remote");
        journal.error("backup failed");
        let entries = journal.entries().unwrap();
        assert_eq!(entries[0].level, JournalLevel::Warn);
        assert!(entries[1].to_string().contains("[error] backup failed"));

        journal.clear().unwrap();
        assert!(journal.entries().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_journal_does_not_panic() {
        let store = Arc::new(MemoryKvStore::new());
        store.set(JOURNAL_KEY, "garbage").unwrap();
        let journal = Journal::new(store, 10);
        journal.info("still works");
        assert!(journal.entries().is_err());
    }
}
