//! Persisted migration run status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, Result};
use crate::store::keys::STATUS_KEY;
use crate::store::{KeyValueStore, KeyValueStoreExt};

/// Ordered steps of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStep {
    /// Read the local namespace into a dataset.
    Export,
    /// Validate the exported dataset.
    ValidateExport,
    /// Take a full backup of the local namespace.
    CreateBackup,
    /// Create remote user profiles.
    MigrateUsers,
    /// Copy user preferences.
    MigratePreferences,
    /// Copy user statistics.
    MigrateStats,
    /// Copy sessions.
    MigrateSessions,
    /// Copy meetings.
    MigrateMeetings,
    /// Run remote consistency checks.
    ValidateMigration,
    /// Release locks and record the run summary.
    Cleanup,
}

impl MigrationStep {
    /// Every step in execution order.
    pub const ALL: [MigrationStep; 10] = [
        Self::Export,
        Self::ValidateExport,
        Self::CreateBackup,
        Self::MigrateUsers,
        Self::MigratePreferences,
        Self::MigrateStats,
        Self::MigrateSessions,
        Self::MigrateMeetings,
        Self::ValidateMigration,
        Self::Cleanup,
    ];

    /// Total number of steps.
    pub const fn total() -> usize {
        Self::ALL.len()
    }

    /// Position of the step in execution order.
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }
}

impl std::fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Export => write!(f, "export"),
            Self::ValidateExport => write!(f, "validate_export"),
            Self::CreateBackup => write!(f, "create_backup"),
            Self::MigrateUsers => write!(f, "migrate_users"),
            Self::MigratePreferences => write!(f, "migrate_preferences"),
            Self::MigrateStats => write!(f, "migrate_stats"),
            Self::MigrateSessions => write!(f, "migrate_sessions"),
            Self::MigrateMeetings => write!(f, "migrate_meetings"),
            Self::ValidateMigration => write!(f, "validate_migration"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Run has not started.
    NotStarted,
    /// Run is in progress (or was interrupted while in progress).
    Running,
    /// Run finished.
    Completed,
    /// Run failed with the given reason.
    Failed(String),
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// An error recorded against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusError {
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Step that was running.
    pub step: Option<MigrationStep>,
    /// User involved, if any.
    pub user_id: Option<String>,
    /// Description.
    pub message: String,
}

/// Status of one migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStatus {
    /// Run identifier.
    pub run_id: String,
    /// Lifecycle state.
    pub state: RunState,
    /// Step currently executing.
    pub current_step: Option<MigrationStep>,
    /// Steps finished, in completion order, without duplicates.
    pub completed_steps: Vec<MigrationStep>,
    /// `100 * completed_steps / total steps`.
    pub progress: u8,
    /// Accumulated errors.
    pub errors: Vec<StatusError>,
    /// Dry runs stop after the backup step and never touch the remote store.
    pub dry_run: bool,
    /// Backup taken (or reused) by this run.
    pub backup_id: Option<String>,
    /// When the run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

impl MigrationStatus {
    /// Create a not-started status.
    pub fn new(run_id: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id: run_id.into(),
            state: RunState::NotStarted,
            current_step: None,
            completed_steps: Vec::new(),
            progress: 0,
            errors: Vec::new(),
            dry_run,
            backup_id: None,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether the run has started.
    pub fn started(&self) -> bool {
        self.state != RunState::NotStarted
    }

    /// Whether the run completed.
    pub fn completed(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Whether the run reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RunState::Completed | RunState::Failed(_))
    }

    /// Whether a step already finished.
    pub fn is_step_completed(&self, step: MigrationStep) -> bool {
        self.completed_steps.contains(&step)
    }

    /// Mark the run as running.
    pub fn mark_running(&mut self) {
        self.state = RunState::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Enter a step.
    pub fn begin_step(&mut self, step: MigrationStep) {
        self.current_step = Some(step);
    }

    /// Record a finished step. Completing a step twice is a no-op, so
    /// progress never decreases.
    pub fn complete_step(&mut self, step: MigrationStep) {
        if !self.completed_steps.contains(&step) {
            self.completed_steps.push(step);
        }
        self.progress = Self::progress_for(self.completed_steps.len());
    }

    /// Record an error.
    pub fn record_error(
        &mut self,
        step: Option<MigrationStep>,
        user_id: Option<&str>,
        message: impl Into<String>,
    ) {
        self.errors.push(StatusError {
            timestamp: Utc::now(),
            step,
            user_id: user_id.map(str::to_string),
            message: message.into(),
        });
    }

    /// Mark the run as completed.
    pub fn mark_completed(&mut self) {
        self.state = RunState::Completed;
        self.current_step = None;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the run as failed.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.record_error(self.current_step, None, reason.clone());
        self.state = RunState::Failed(reason);
        self.completed_at = Some(Utc::now());
    }

    fn progress_for(completed: usize) -> u8 {
        let total = MigrationStep::total();
        ((completed.min(total) * 100) / total) as u8
    }
}

/// Persisted, injectable store for the run status.
#[derive(Clone)]
pub struct StatusStore {
    store: Arc<dyn KeyValueStore>,
}

impl StatusStore {
    /// Create a status store over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Read the persisted status.
    pub fn read(&self) -> Result<Option<MigrationStatus>> {
        self.store.get_json(STATUS_KEY)
    }

    /// Create and persist a fresh status, replacing any existing one.
    pub fn init(&self, run_id: impl Into<String>, dry_run: bool) -> Result<MigrationStatus> {
        let status = MigrationStatus::new(run_id, dry_run);
        self.store.set_json(STATUS_KEY, &status)?;
        Ok(status)
    }

    /// Apply `f` to the persisted status and write it back.
    pub fn update<F>(&self, f: F) -> Result<MigrationStatus>
    where
        F: FnOnce(&mut MigrationStatus),
    {
        let mut status = self
            .read()?
            .ok_or_else(|| MigrationError::NotFound("migration status".to_string()))?;
        f(&mut status);
        status.updated_at = Utc::now();
        self.store.set_json(STATUS_KEY, &status)?;
        Ok(status)
    }

    /// Remove the persisted status.
    pub fn clear(&self) -> Result<()> {
        self.store.remove(STATUS_KEY)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    fn status_store() -> StatusStore {
        StatusStore::new(Arc::new(MemoryKvStore::new()))
    }

    #[test]
    fn test_step_order() {
        assert_eq!(MigrationStep::total(), 10);
        assert_eq!(MigrationStep::Export.index(), 0);
        assert_eq!(MigrationStep::Cleanup.index(), 9);
        assert!(MigrationStep::CreateBackup < MigrationStep::MigrateUsers);
        assert_eq!(MigrationStep::ValidateExport.to_string(), "validate_export");
    }

    #[test]
    fn test_complete_step_progress() {
        let mut status = MigrationStatus::new("r1", false);
        assert_eq!(status.progress, 0);
        status.complete_step(MigrationStep::Export);
        assert_eq!(status.progress, 10);
        status.complete_step(MigrationStep::Export);
        assert_eq!(status.completed_steps.len(), 1);
        assert_eq!(status.progress, 10);
        for step in MigrationStep::ALL {
            status.complete_step(step);
        }
        assert_eq!(status.progress, 100);
    }

    #[test]
    fn test_mark_failed() {
        let mut status = MigrationStatus::new("r1", false);
        status.mark_running();
        status.begin_step(MigrationStep::ValidateExport);
        status.mark_failed("bad data");
        assert!(status.is_terminal());
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.errors[0].step, Some(MigrationStep::ValidateExport));
        assert_eq!(status.state.to_string(), "failed: bad data");
    }

    #[test]
    fn test_store_lifecycle() {
        let store = status_store();
        assert!(store.read().unwrap().is_none());
        assert!(matches!(
            store.update(|s| s.mark_running()),
            Err(MigrationError::NotFound(_))
        ));

        store.init("r1", false).unwrap();
        store
            .update(|s| {
                s.mark_running();
                s.complete_step(MigrationStep::Export);
            })
            .unwrap();

        let read = store.read().unwrap().unwrap();
        assert_eq!(read.run_id, "r1");
        assert_eq!(read.state, RunState::Running);
        assert!(read.started());
        assert_eq!(read.completed_steps, vec![MigrationStep::Export]);

        store.clear().unwrap();
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn test_status_serialization() {
        let mut status = MigrationStatus::new("r1", true);
        status.mark_failed("boom");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"]["failed"], "boom");
        let back: MigrationStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }
}
