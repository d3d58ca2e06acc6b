//! Migration strategies
//!
//! - `safe`: health pre-flight, full backup, verified migration, automatic
//!   rollback when verification fails, then optionally hybrid mode.
//! - `fast`: one snapshot, larger batches, no remote verification.
//! - `hybrid`: hybrid mode first, then users one at a time, tolerating
//!   individual failures.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{MigrationError, Result};
use crate::hybrid::{UserMigrationOptions, UserMigrationOutcome};
use crate::migration::{MigrationOptions, MigrationReport};
use crate::orchestrator::health::HealthReport;
use crate::recovery::{BackupSource, RollbackReport};

use super::{Orchestrator, OrchestratorEvent};

/// Snapshot event taken before a fast migration
pub const EVENT_PRE_MIGRATION: &str = "pre_migration";

/// How to run a migration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStrategy {
    /// Backup, verify and roll back on failure
    #[default]
    Safe,
    /// Snapshot only, no verification
    Fast,
    /// Per-user migration in hybrid mode
    Hybrid,
}

impl std::fmt::Display for MigrationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Fast => write!(f, "fast"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl std::str::FromStr for MigrationStrategy {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "fast" => Ok(Self::Fast),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(MigrationError::Configuration(format!(
                "unknown migration strategy: {other}"
            ))),
        }
    }
}

/// Parameters of [`Orchestrator::start_migration`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRequest {
    /// Strategy to run
    pub strategy: MigrationStrategy,
    /// Stop before any remote write
    pub dry_run: bool,
    /// Continue past export validation errors
    pub ignore_validation_errors: bool,
    /// Skip the safe strategy's health pre-flight
    pub skip_health_check: bool,
    /// Switch hybrid mode on after a successful safe migration;
    /// `None` uses the configured default
    pub enable_hybrid_after: Option<bool>,
}

/// Per-user results of the hybrid strategy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridSummary {
    /// Users transferred
    pub migrated: Vec<String>,
    /// Users already migrated
    pub skipped: Vec<String>,
    /// Users that failed, with their errors
    pub failed: BTreeMap<String, Vec<String>>,
}

/// What a strategy did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyOutcome {
    /// Strategy that ran
    pub strategy: MigrationStrategy,
    /// Pre-flight result
    pub health: Option<HealthReport>,
    /// Backup or snapshot protecting the run
    pub backup_id: Option<String>,
    /// Migration Manager report
    pub report: Option<MigrationReport>,
    /// Hybrid strategy results
    pub hybrid: Option<HybridSummary>,
    /// Set when verification failed and local state was restored
    pub rolled_back: Option<RollbackReport>,
    /// Why the run was rolled back
    pub failure: Option<String>,
    /// Hybrid mode is on after the run
    pub hybrid_enabled: bool,
}

impl StrategyOutcome {
    fn new(strategy: MigrationStrategy) -> Self {
        Self {
            strategy,
            health: None,
            backup_id: None,
            report: None,
            hybrid: None,
            rolled_back: None,
            failure: None,
            hybrid_enabled: false,
        }
    }

    /// Whether the strategy reached its goal
    pub fn succeeded(&self) -> bool {
        self.rolled_back.is_none() && self.failure.is_none()
    }
}

impl Orchestrator {
    pub(super) async fn run_strategy(&self, request: &MigrationRequest) -> Result<StrategyOutcome> {
        info!(strategy = %request.strategy, dry_run = request.dry_run, "starting migration strategy");
        match request.strategy {
            MigrationStrategy::Safe => self.run_safe(request).await,
            MigrationStrategy::Fast => self.run_fast(request).await,
            MigrationStrategy::Hybrid => self.run_hybrid(request).await,
        }
    }

    async fn run_safe(&self, request: &MigrationRequest) -> Result<StrategyOutcome> {
        let mut outcome = StrategyOutcome::new(MigrationStrategy::Safe);

        if !request.skip_health_check {
            let health = self.health_check().await;
            if !health.allows_migration() {
                let reasons: Vec<&str> = health
                    .recommendations
                    .iter()
                    .map(|r| r.message.as_str())
                    .collect();
                return Err(MigrationError::Validation(format!(
                    "pre-flight health check is {}: {}",
                    health.status,
                    reasons.join("; ")
                )));
            }
            outcome.health = Some(health);
        }

        let backup = self
            .recovery
            .create_full_backup(BackupSource::Local, self.recovery.default_backup_options())
            .await?;
        outcome.backup_id = Some(backup.id.clone());

        let options = MigrationOptions {
            dry_run: request.dry_run,
            ignore_validation_errors: request.ignore_validation_errors,
            verify: true,
            backup_id: Some(backup.id.clone()),
            ..MigrationOptions::from_config(&self.config.migration)
        };
        match self.migration.start(options).await {
            Ok(report) => {
                let enable_hybrid = request
                    .enable_hybrid_after
                    .unwrap_or(self.config.migration.enable_hybrid_after);
                if enable_hybrid && !request.dry_run {
                    self.hybrid.enable()?;
                    self.events.emit(OrchestratorEvent::HybridModeEnabled);
                    outcome.hybrid_enabled = true;
                }
                outcome.report = Some(report);
                Ok(outcome)
            }
            Err(MigrationError::Integrity(reason)) => {
                warn!(backup_id = %backup.id, reason = %reason, "verification failed, rolling back");
                match self.migration.rollback(Some(&backup.id)).await {
                    Ok(rollback) => {
                        self.events.emit(OrchestratorEvent::RollbackComplete {
                            backup_id: rollback.backup_id.clone(),
                        });
                        outcome.rolled_back = Some(rollback);
                        outcome.failure = Some(reason);
                        Ok(outcome)
                    }
                    Err(e) => {
                        error!(error = %e, "automatic rollback failed");
                        self.events.emit(OrchestratorEvent::RollbackError {
                            message: e.to_string(),
                        });
                        Err(MigrationError::Backup(format!(
                            "verification failed ({reason}) and automatic rollback failed: {e}"
                        )))
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn run_fast(&self, request: &MigrationRequest) -> Result<StrategyOutcome> {
        let mut outcome = StrategyOutcome::new(MigrationStrategy::Fast);

        let snapshot = self.recovery.create_snapshot(
            EVENT_PRE_MIGRATION,
            Some("before fast migration".to_string()),
        )?;
        outcome.backup_id = Some(snapshot.id.clone());

        let options = MigrationOptions {
            dry_run: request.dry_run,
            ignore_validation_errors: request.ignore_validation_errors,
            batch_size: self.config.migration.fast_batch_size,
            verify: false,
            backup_id: Some(snapshot.id),
            skip_backup: false,
        };
        outcome.report = Some(self.migration.start(options).await?);
        Ok(outcome)
    }

    async fn run_hybrid(&self, request: &MigrationRequest) -> Result<StrategyOutcome> {
        if request.dry_run {
            return Err(MigrationError::Configuration(
                "the hybrid strategy writes per user and has no dry run".to_string(),
            ));
        }
        let mut outcome = StrategyOutcome::new(MigrationStrategy::Hybrid);

        self.hybrid.enable()?;
        self.events.emit(OrchestratorEvent::HybridModeEnabled);
        outcome.hybrid_enabled = true;

        let extraction = self.extractor.extract_all()?;
        let user_ids: Vec<String> = extraction.dataset.users.into_keys().collect();
        let total = user_ids.len().max(1);
        let mut summary = HybridSummary::default();

        for (done, user_id) in user_ids.into_iter().enumerate() {
            match self
                .hybrid
                .migrate_user(&user_id, UserMigrationOptions::default())
                .await
            {
                Ok(UserMigrationOutcome::Skipped) => summary.skipped.push(user_id.clone()),
                Ok(UserMigrationOutcome::Migrated { .. }) => summary.migrated.push(user_id.clone()),
                Ok(UserMigrationOutcome::Failed { errors }) => {
                    summary.failed.insert(user_id.clone(), errors);
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "hybrid user migration failed");
                    summary.failed.insert(user_id.clone(), vec![e.to_string()]);
                }
            }
            self.events.emit(OrchestratorEvent::MigrationProgress {
                step: None,
                progress: (((done + 1) * 100) / total) as u8,
                message: Some(format!("user {user_id}")),
            });
        }

        info!(
            migrated = summary.migrated.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "hybrid migration finished"
        );
        outcome.hybrid = Some(summary);
        Ok(outcome)
    }
}
