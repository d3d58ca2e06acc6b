//! Orchestrator
//!
//! Top-level facade over the engine. It wires the managers to one set of
//! stores, picks a migration strategy, and reports every public operation
//! through the [`EventBus`] and a uniform [`OperationResult`].
//!
//! # Example
//!
//! ```ignore
//! use kvshift::orchestrator::{MigrationRequest, MigrationStrategy, Orchestrator};
//!
//! let orchestrator = Orchestrator::from_config(config)?;
//! let mut events = orchestrator.subscribe();
//! let result = orchestrator
//!     .start_migration(MigrationRequest {
//!         strategy: MigrationStrategy::Safe,
//!         ..Default::default()
//!     })
//!     .await;
//! ```

pub mod events;
pub mod health;
pub mod strategy;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{MigrationError, Result};
use crate::extractor::Extractor;
use crate::hybrid::{HybridManager, HybridState};
use crate::migration::{MigrationManager, MigrationReport};
use crate::recovery::{BackupInfo, PartialRollbackReport, RecoveryManager, RollbackReport};
use crate::state::{EngineContext, MigrationStatus, UserMigrationStatus};
use crate::store::{
    BackupSink, DirectorySink, FileKvStore, KeyValueStore, MemoryRemoteStore, RemoteStore,
};
use crate::validator::ValidationOptions;

pub use events::{EventBus, OrchestratorEvent};
pub use health::{run_health_check, CheckResult, CheckStatus, HealthReport, HealthStatus};
pub use strategy::{
    HybridSummary, MigrationRequest, MigrationStrategy, StrategyOutcome, EVENT_PRE_MIGRATION,
};

/// Error part of an [`OperationResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// Error kind, see [`MigrationError::kind`]
    pub kind: String,
    /// Error message
    pub message: String,
}

impl From<&MigrationError> for OperationError {
    fn from(err: &MigrationError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Uniform result of every public orchestrator operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    /// Whether the operation reached its goal
    pub success: bool,
    /// Operation name
    pub operation: String,
    /// Payload; may be present on failure when partial results exist
    pub data: Option<T>,
    /// Failure detail
    pub error: Option<OperationError>,
    /// Human-readable summary
    pub message: Option<String>,
}

impl<T> OperationResult<T> {
    /// Successful result
    pub fn ok(operation: &str, data: T, message: Option<String>) -> Self {
        Self {
            success: true,
            operation: operation.to_string(),
            data: Some(data),
            error: None,
            message,
        }
    }

    /// Failed result
    pub fn failed(operation: &str, err: &MigrationError, data: Option<T>) -> Self {
        Self {
            success: false,
            operation: operation.to_string(),
            data,
            error: Some(err.into()),
            message: Some(err.to_string()),
        }
    }
}

/// Everything [`Orchestrator::get_status`] reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Current or last run
    pub migration: Option<MigrationStatus>,
    /// Report of the last finished run
    pub last_run: Option<MigrationReport>,
    /// Per-user migration state
    pub users: BTreeMap<String, UserMigrationStatus>,
    /// Hybrid mode flag
    pub hybrid: HybridState,
    /// Queued remote writes
    pub pending_sync: usize,
    /// Snapshots held
    pub snapshots: usize,
    /// Most recent full backup
    pub latest_backup: Option<BackupInfo>,
    /// An operation is in progress
    pub busy: bool,
}

/// Clears the busy flag when an operation ends
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Engine facade
pub struct Orchestrator {
    config: Config,
    ctx: EngineContext,
    extractor: Extractor,
    validation: ValidationOptions,
    recovery: Arc<RecoveryManager>,
    migration: Arc<MigrationManager>,
    hybrid: Arc<HybridManager>,
    events: EventBus,
    busy: AtomicBool,
}

impl Orchestrator {
    /// Wire every manager over the given stores
    pub fn new(
        config: Config,
        local: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        sink: Arc<dyn BackupSink>,
    ) -> Self {
        let ctx = EngineContext::new(local, remote, sink, config.storage.journal_max_entries);
        let validation = ValidationOptions::from(&config.validation);
        let events = EventBus::default();
        let recovery = Arc::new(RecoveryManager::new(ctx.clone(), config.recovery.clone()));
        let migration = Arc::new(
            MigrationManager::new(ctx.clone(), recovery.clone(), validation.clone())
                .with_reporter(Arc::new(events.clone())),
        );
        let hybrid = Arc::new(HybridManager::new(
            ctx.clone(),
            recovery.clone(),
            config.hybrid.clone(),
        ));

        Self {
            extractor: Extractor::new(ctx.local.clone()),
            config,
            ctx,
            validation,
            recovery,
            migration,
            hybrid,
            events,
            busy: AtomicBool::new(false),
        }
    }

    /// Open the file-backed stores named in `config.storage`
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let local = Arc::new(FileKvStore::open(&config.storage.local_path)?);
        let remote = Arc::new(MemoryRemoteStore::open(&config.storage.remote_path)?);
        let sink = Arc::new(DirectorySink::new(config.storage.backup_dir.clone()));
        Ok(Self::new(config, local, remote, sink))
    }

    /// Receive events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Shared engine state
    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Local reader
    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Validator settings
    pub fn validation(&self) -> &ValidationOptions {
        &self.validation
    }

    /// Recovery Manager
    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// Migration Manager
    pub fn migration(&self) -> &Arc<MigrationManager> {
        &self.migration
    }

    /// Hybrid Manager
    pub fn hybrid(&self) -> &Arc<HybridManager> {
        &self.hybrid
    }

    // ── Public operations ──

    /// Run a migration with the requested strategy
    pub async fn start_migration(&self, request: MigrationRequest) -> OperationResult<StrategyOutcome> {
        const OP: &str = "start_migration";
        let _busy = match self.claim() {
            Ok(guard) => guard,
            Err(e) => return self.fail(OP, e, None),
        };
        self.events.emit(OrchestratorEvent::OperationStart {
            operation: OP.to_string(),
        });

        match self.run_strategy(&request).await {
            Ok(outcome) if outcome.succeeded() => {
                let message = outcome
                    .report
                    .as_ref()
                    .map(MigrationReport::summary)
                    .or_else(|| {
                        outcome.hybrid.as_ref().map(|h| {
                            format!(
                                "{} migrated, {} skipped, {} failed",
                                h.migrated.len(),
                                h.skipped.len(),
                                h.failed.len()
                            )
                        })
                    });
                self.complete(OP, outcome, message)
            }
            Ok(outcome) => {
                let reason = outcome.failure.clone().unwrap_or_default();
                let backup_id = outcome
                    .rolled_back
                    .as_ref()
                    .map(|r| r.backup_id.clone())
                    .unwrap_or_default();
                let err = MigrationError::Integrity(format!(
                    "{reason}; rolled back to backup {backup_id}"
                ));
                self.fail(OP, err, Some(outcome))
            }
            Err(e) => self.fail(OP, e, None),
        }
    }

    /// Check readiness for a migration
    pub async fn perform_health_check(&self) -> OperationResult<HealthReport> {
        const OP: &str = "perform_health_check";
        self.events.emit(OrchestratorEvent::OperationStart {
            operation: OP.to_string(),
        });
        let report = self.health_check().await;
        let message = Some(format!("health status: {}", report.status));
        self.complete(OP, report, message)
    }

    /// Restore local state from a backup and clear the run status
    pub async fn rollback_migration(&self, backup_id: Option<&str>) -> OperationResult<RollbackReport> {
        const OP: &str = "rollback_migration";
        self.guarded(OP, async {
            match self.migration.rollback(backup_id).await {
                Ok(report) => {
                    self.events.emit(OrchestratorEvent::RollbackComplete {
                        backup_id: report.backup_id.clone(),
                    });
                    Ok(report)
                }
                Err(e) => {
                    self.events.emit(OrchestratorEvent::RollbackError {
                        message: e.to_string(),
                    });
                    Err(e)
                }
            }
        })
        .await
    }

    /// Restore one user's local state from a backup
    pub async fn rollback_user(
        &self,
        user_id: &str,
        backup_id: Option<&str>,
    ) -> OperationResult<PartialRollbackReport> {
        self.guarded("rollback_user", self.hybrid.rollback_user(user_id, backup_id))
            .await
    }

    /// Switch hybrid mode on
    pub fn enable_hybrid_mode(&self) -> OperationResult<HybridState> {
        const OP: &str = "enable_hybrid_mode";
        match self.hybrid.enable() {
            Ok(state) => {
                self.events.emit(OrchestratorEvent::HybridModeEnabled);
                self.complete(OP, state, None)
            }
            Err(e) => self.fail(OP, e, None),
        }
    }

    /// Switch hybrid mode off
    pub fn disable_hybrid_mode(&self) -> OperationResult<HybridState> {
        const OP: &str = "disable_hybrid_mode";
        match self.hybrid.disable() {
            Ok(state) => {
                self.events.emit(OrchestratorEvent::HybridModeDisabled);
                self.complete(OP, state, None)
            }
            Err(e) => self.fail(OP, e, None),
        }
    }

    /// Report persisted engine state
    pub fn get_status(&self) -> OperationResult<EngineStatus> {
        const OP: &str = "get_status";
        match self.collect_status() {
            Ok(status) => OperationResult::ok(OP, status, None),
            Err(e) => OperationResult::failed(OP, &e, None),
        }
    }

    fn collect_status(&self) -> Result<EngineStatus> {
        Ok(EngineStatus {
            migration: self.migration.status()?,
            last_run: self.migration.last_run()?,
            users: self.ctx.user_status.all()?,
            hybrid: self.hybrid.state()?,
            pending_sync: self.hybrid.pending()?.len(),
            snapshots: self.recovery.snapshots()?.len(),
            latest_backup: self.recovery.latest_backup()?.map(|b| b.info()),
            busy: self.busy.load(Ordering::SeqCst) || self.migration.is_running(),
        })
    }

    // ── Helpers ──

    pub(crate) async fn health_check(&self) -> HealthReport {
        run_health_check(
            &self.extractor,
            &self.validation,
            self.ctx.remote.as_ref(),
            &self.recovery,
            |stage, progress| {
                self.events.emit(OrchestratorEvent::HealthCheckProgress {
                    stage: stage.to_string(),
                    progress,
                })
            },
        )
        .await
    }

    fn claim(&self) -> Result<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| MigrationError::AlreadyRunning)?;
        Ok(BusyGuard(&self.busy))
    }

    async fn guarded<T, F>(&self, operation: &str, fut: F) -> OperationResult<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _busy = match self.claim() {
            Ok(guard) => guard,
            Err(e) => return self.fail(operation, e, None),
        };
        self.events.emit(OrchestratorEvent::OperationStart {
            operation: operation.to_string(),
        });
        match fut.await {
            Ok(data) => self.complete(operation, data, None),
            Err(e) => self.fail(operation, e, None),
        }
    }

    fn complete<T>(&self, operation: &str, data: T, message: Option<String>) -> OperationResult<T> {
        info!(operation, "operation complete");
        self.events.emit(OrchestratorEvent::OperationComplete {
            operation: operation.to_string(),
            message: message.clone(),
        });
        OperationResult::ok(operation, data, message)
    }

    fn fail<T>(&self, operation: &str, err: MigrationError, data: Option<T>) -> OperationResult<T> {
        error!(operation, kind = err.kind(), error = %err, "operation failed");
        self.events.emit(OrchestratorEvent::OperationError {
            operation: operation.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
        OperationResult::failed(operation, &err, data)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::keys::USERS_KEY;
    use crate::store::{MemoryKvStore, MemorySink};

    fn orchestrator() -> (Orchestrator, Arc<MemoryKvStore>, Arc<MemoryRemoteStore>) {
        let local = Arc::new(MemoryKvStore::new());
        local
            .set(
                USERS_KEY,
                r#"{"u1":{"id":"u1","email":"a@example.com","name":"Ada","createdAt":"2024-01-01T00:00:00Z"}}"#,
            )
            .unwrap();
        let remote = Arc::new(MemoryRemoteStore::new());
        let orchestrator = Orchestrator::new(
            Config::default(),
            local.clone(),
            remote.clone(),
            Arc::new(MemorySink::new()),
        );
        (orchestrator, local, remote)
    }

    fn drain(rx: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_safe_migration_emits_events() {
        let (orchestrator, _, remote) = orchestrator();
        let mut rx = orchestrator.subscribe();

        let result = orchestrator.start_migration(MigrationRequest::default()).await;
        assert!(result.success, "{:?}", result.error);
        let outcome = result.data.unwrap();
        assert!(outcome.health.is_some());
        assert!(outcome.backup_id.is_some());
        assert!(!outcome.hybrid_enabled);
        assert_eq!(remote.row_count(crate::store::RemoteTable::Users), 1);

        let names: Vec<&str> = drain(&mut rx).iter().map(|e| e.name()).collect();
        assert_eq!(names.first(), Some(&"operationStart"));
        assert_eq!(names.last(), Some(&"operationComplete"));
        assert!(names.contains(&"healthCheckProgress"));
        assert!(names.contains(&"migrationProgress"));
    }

    #[tokio::test]
    async fn test_busy_orchestrator_rejects_second_operation() {
        let (orchestrator, _, _) = orchestrator();
        let _busy = orchestrator.claim().unwrap();

        let result = orchestrator.start_migration(MigrationRequest::default()).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, "already_running");
        let result = orchestrator.rollback_migration(None).await;
        assert_eq!(result.error.unwrap().kind, "already_running");
    }

    #[tokio::test]
    async fn test_critical_health_blocks_safe_migration() {
        let (orchestrator, _, remote) = orchestrator();
        remote.set_online(false);

        let result = orchestrator.start_migration(MigrationRequest::default()).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, "validation_error");
        assert!(orchestrator.recovery().latest_backup().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hybrid_mode_toggle_and_status() {
        let (orchestrator, _, _) = orchestrator();
        let mut rx = orchestrator.subscribe();

        assert!(orchestrator.enable_hybrid_mode().success);
        let status = orchestrator.get_status().data.unwrap();
        assert!(status.hybrid.enabled);
        assert!(!status.busy);
        assert!(status.migration.is_none());

        assert!(orchestrator.disable_hybrid_mode().success);
        let names: Vec<&str> = drain(&mut rx).iter().map(|e| e.name()).collect();
        assert!(names.contains(&"hybridModeEnabled"));
        assert!(names.contains(&"hybridModeDisabled"));
    }

    #[tokio::test]
    async fn test_rollback_without_backup_fails() {
        let (orchestrator, _, _) = orchestrator();
        let mut rx = orchestrator.subscribe();

        let result = orchestrator.rollback_migration(None).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, "not_found");
        let names: Vec<&str> = drain(&mut rx).iter().map(|e| e.name()).collect();
        assert!(names.contains(&"rollbackError"));
        assert_eq!(names.last(), Some(&"operationError"));
    }
}
