//! Step-ordered migration runs
//!
//! [`MigrationManager::start`] walks [`MigrationStep::ALL`] in order,
//! persisting the run status and notifying the progress reporter at every
//! transition. Users move in fixed-size batches; a failing user is recorded
//! and dropped from later steps while the rest of the batch continues.
//! Losing the remote store mid-run fails the run, which can then be resumed
//! under the same run id.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::extractor::Extractor;
use crate::model::{ExportDataset, Session};
use crate::recovery::{BackupSource, RecoveryManager, RollbackOptions, RollbackReport};
use crate::state::{EngineContext, MigrationStatus, MigrationStep, UserLockGuard};
use crate::store::keys::LAST_RUN_KEY;
use crate::store::{BulkOutcome, KeyValueStoreExt};
use crate::validator::{users_with_errors, DatasetValidator, ValidationOptions};

use super::progress::{
    MigrationOutcome, MigrationReport, NoopReporter, ProgressReporter, StepPhase, StepProgress,
    TransferTracker, UserFailure,
};
use super::verify::verify_remote;

/// Options for one migration run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Run without taking a backup
    pub skip_backup: bool,
    /// Stop after the backup step without touching the remote store
    pub dry_run: bool,
    /// Users per batch
    pub batch_size: usize,
    /// Continue even if the export fails validation
    pub ignore_validation_errors: bool,
    /// Run remote consistency checks after the transfer
    pub verify: bool,
    /// Reuse this backup instead of taking a new one
    pub backup_id: Option<String>,
}

impl MigrationOptions {
    /// Options derived from configuration
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            skip_backup: false,
            dry_run: false,
            batch_size: config.batch_size,
            ignore_validation_errors: config.ignore_validation_errors,
            verify: true,
            backup_id: None,
        }
    }
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self::from_config(&MigrationConfig::default())
    }
}

/// Clears the running flag when a run ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-run transfer bookkeeping
struct Transfer {
    run_id: String,
    tracker: TransferTracker,
    failures: Vec<UserFailure>,
    failed: BTreeSet<String>,
    flushed: usize,
}

impl Transfer {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            tracker: TransferTracker::new(),
            failures: Vec::new(),
            failed: BTreeSet::new(),
            flushed: 0,
        }
    }

    fn fail_user(&mut self, step: MigrationStep, user_id: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(run_id = %self.run_id, user_id, step = %step, error = %message, "user transfer failed");
        self.failed.insert(user_id.to_string());
        self.failures.push(UserFailure {
            user_id: user_id.to_string(),
            step,
            message,
        });
    }

    /// Users still eligible for later steps
    fn active<'a>(&self, users: &'a [String]) -> Vec<&'a String> {
        users.iter().filter(|u| !self.failed.contains(*u)).collect()
    }

    /// Record bulk rejections, mapping record ids back to owners
    fn absorb(
        &mut self,
        step: MigrationStep,
        outcome: BulkOutcome,
        owner_of: &HashMap<String, String>,
    ) {
        self.tracker.records_transferred(outcome.inserted as u64);
        self.tracker.records_failed(outcome.failed.len() as u64);
        for (record_id, reason) in outcome.failed {
            let owner = owner_of.get(&record_id).cloned().unwrap_or_else(|| record_id.clone());
            self.fail_user(step, &owner, format!("record {record_id}: {reason}"));
        }
    }
}

/// Runs migrations from the local store into the remote store
pub struct MigrationManager {
    ctx: EngineContext,
    recovery: Arc<RecoveryManager>,
    extractor: Extractor,
    validation: ValidationOptions,
    reporter: Arc<dyn ProgressReporter>,
    running: AtomicBool,
}

impl MigrationManager {
    /// Create a migration manager
    pub fn new(
        ctx: EngineContext,
        recovery: Arc<RecoveryManager>,
        validation: ValidationOptions,
    ) -> Self {
        Self {
            extractor: Extractor::new(ctx.local.clone()),
            ctx,
            recovery,
            validation,
            reporter: Arc::new(NoopReporter),
            running: AtomicBool::new(false),
        }
    }

    /// Send step transitions to `reporter`
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Whether a run or rollback is in progress
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Persisted run status
    pub fn status(&self) -> Result<Option<MigrationStatus>> {
        self.ctx.status.read()
    }

    /// Report of the last finished run
    pub fn last_run(&self) -> Result<Option<MigrationReport>> {
        self.ctx.local.get_json(LAST_RUN_KEY)
    }

    /// Run a migration, resuming an interrupted one if present
    pub async fn start(&self, options: MigrationOptions) -> Result<MigrationReport> {
        let _running = self.claim()?;
        self.run(options).await
    }

    /// Restore pre-migration local state and clear the run status.
    ///
    /// Uses `backup_id`, else the run's recorded backup, else the latest.
    pub async fn rollback(&self, backup_id: Option<&str>) -> Result<RollbackReport> {
        let _running = self.claim()?;
        let recorded = self.ctx.status.read()?.and_then(|s| s.backup_id);
        let target = backup_id.map(str::to_string).or(recorded);

        let report = self
            .recovery
            .perform_full_rollback(target.as_deref(), RollbackOptions::default())
            .await?;
        info!(backup_id = %report.backup_id, "migration rolled back");
        self.ctx
            .journal
            .warn(format!("migration rolled back to backup {}", report.backup_id));
        Ok(report)
    }

    fn claim(&self) -> Result<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| MigrationError::AlreadyRunning)?;
        Ok(RunningGuard(&self.running))
    }

    async fn run(&self, options: MigrationOptions) -> Result<MigrationReport> {
        let (status, resumed) = self.prepare_status(&options)?;
        let run_id = status.run_id.clone();
        let mut report = MigrationReport::new(&run_id, options.dry_run);
        report.resumed = resumed;

        self.ctx.status.update(|s| s.mark_running())?;
        info!(run_id = %run_id, dry_run = options.dry_run, resumed, "migration started");
        self.ctx.journal.info(format!(
            "migration {run_id} {}",
            if resumed { "resumed" } else { "started" }
        ));

        // Export
        self.begin(&run_id, MigrationStep::Export)?;
        let extraction = self
            .extractor
            .extract_all()
            .map_err(|e| self.fail(&run_id, MigrationStep::Export, e))?;
        for skipped in &extraction.skipped {
            self.ctx
                .journal
                .warn(format!("skipped {}: {}", skipped.key, skipped.reason));
        }
        let dataset = extraction.dataset;
        self.complete(
            &run_id,
            MigrationStep::Export,
            Some(format!(
                "{} users, {} records, {} skipped",
                dataset.users.len(),
                dataset.record_count(),
                extraction.skipped.len()
            )),
        )?;

        // Validate export
        self.begin(&run_id, MigrationStep::ValidateExport)?;
        let validation = DatasetValidator::new(self.validation.clone()).validate(&dataset);
        if !validation.is_valid {
            if options.ignore_validation_errors {
                warn!(run_id = %run_id, score = validation.score, "continuing despite validation errors");
                self.ctx.journal.warn(format!(
                    "export failed validation (score {}), continuing as requested",
                    validation.score
                ));
            } else {
                let affected: Vec<String> = users_with_errors(&validation).into_iter().collect();
                let err = MigrationError::Validation(format!(
                    "export failed validation: score {}, {} errors (users: {})",
                    validation.score,
                    validation.error_total,
                    affected.join(", ")
                ));
                return Err(self.fail(&run_id, MigrationStep::ValidateExport, err));
            }
        }
        self.complete(
            &run_id,
            MigrationStep::ValidateExport,
            Some(validation.summary()),
        )?;

        // Backup
        let backup_id = self
            .backup_step(&run_id, &options, &status)
            .await
            .map_err(|e| self.fail(&run_id, MigrationStep::CreateBackup, e))?;
        report.backup_id = backup_id;

        if options.dry_run {
            let status = self.ctx.status.update(|s| s.mark_completed())?;
            info!(run_id = %run_id, "dry run finished before any remote write");
            self.ctx.journal.info(format!("dry run {run_id} finished"));
            report.completed_steps = status.completed_steps;
            report.completed_at = status.completed_at;
            report.export = Some(dataset);
            report.validation = Some(validation);
            report.outcome = MigrationOutcome::DryRun;
            return Ok(report);
        }
        report.validation = Some(validation);

        let mut transfer = Transfer::new(&run_id);
        let (users, locks) = self.claim_users(&dataset, &mut transfer)?;
        for entry in &extraction.skipped {
            if let Some(owner) = entry.owner().filter(|o| users.contains(o)) {
                transfer.fail_user(
                    MigrationStep::MigrateUsers,
                    &owner,
                    format!("unreadable local record {entry}"),
                );
            }
        }

        self.begin(&run_id, MigrationStep::MigrateUsers)?;
        let result = self.migrate_users(&dataset, &users, &options, &mut transfer).await;
        self.finish_transfer(&run_id, MigrationStep::MigrateUsers, &mut transfer, result)?;

        self.begin(&run_id, MigrationStep::MigratePreferences)?;
        let result = self.migrate_preferences(&dataset, &users, &mut transfer).await;
        self.finish_transfer(&run_id, MigrationStep::MigratePreferences, &mut transfer, result)?;

        self.begin(&run_id, MigrationStep::MigrateStats)?;
        let result = self.migrate_stats(&dataset, &users, &options, &mut transfer).await;
        self.finish_transfer(&run_id, MigrationStep::MigrateStats, &mut transfer, result)?;

        self.begin(&run_id, MigrationStep::MigrateSessions)?;
        let result = self.migrate_sessions(&dataset, &users, &options, &mut transfer).await;
        self.finish_transfer(&run_id, MigrationStep::MigrateSessions, &mut transfer, result)?;

        self.begin(&run_id, MigrationStep::MigrateMeetings)?;
        let result = self.migrate_meetings(&dataset, &users, &options, &mut transfer).await;
        self.finish_transfer(&run_id, MigrationStep::MigrateMeetings, &mut transfer, result)?;

        let migrated: Vec<String> = transfer.active(&users).into_iter().cloned().collect();
        for user_id in &migrated {
            self.ctx.user_status.mark_migrated(user_id)?;
            transfer.tracker.user_migrated();
        }
        for user_id in &transfer.failed {
            let reason = transfer
                .failures
                .iter()
                .rev()
                .find(|f| &f.user_id == user_id)
                .map(|f| f.message.clone())
                .unwrap_or_default();
            self.ctx.user_status.mark_failed(user_id, reason)?;
            transfer.tracker.user_failed();
        }

        // Validate migration
        self.begin(&run_id, MigrationStep::ValidateMigration)?;
        if options.verify {
            let verification = verify_remote(self.ctx.remote.as_ref(), &dataset, &migrated)
                .await
                .map_err(|e| self.fail(&run_id, MigrationStep::ValidateMigration, e))?;
            let passed = verification.passed;
            let problems = verification.problems();
            report.verification = Some(verification);
            if !passed {
                let err = MigrationError::Integrity(format!(
                    "remote verification failed: {}",
                    problems.join("; ")
                ));
                return Err(self.fail(&run_id, MigrationStep::ValidateMigration, err));
            }
            self.complete(&run_id, MigrationStep::ValidateMigration, None)?;
        } else {
            self.complete(
                &run_id,
                MigrationStep::ValidateMigration,
                Some("verification skipped".to_string()),
            )?;
        }

        // Cleanup
        self.begin(&run_id, MigrationStep::Cleanup)?;
        drop(locks);
        self.complete(&run_id, MigrationStep::Cleanup, None)?;
        let status = self.ctx.status.update(|s| s.mark_completed())?;

        report.completed_steps = status.completed_steps;
        report.completed_at = status.completed_at;
        report.transfer = transfer.tracker.snapshot();
        report.failures = transfer.failures;
        report.outcome = if report.failures.is_empty() {
            MigrationOutcome::Success
        } else {
            MigrationOutcome::PartialSuccess
        };
        if let Err(e) = self.ctx.local.set_json(LAST_RUN_KEY, &report) {
            warn!(run_id = %run_id, error = %e, "failed to record run summary");
        }

        info!(
            run_id = %run_id,
            outcome = %report.outcome,
            migrated = report.transfer.users_migrated,
            skipped = report.transfer.users_skipped,
            failed = report.transfer.users_failed,
            "migration finished"
        );
        self.ctx
            .journal
            .info(format!("migration {run_id} finished: {}", report.outcome));
        Ok(report)
    }

    /// Resume a persisted unfinished run or start a new one
    fn prepare_status(&self, options: &MigrationOptions) -> Result<(MigrationStatus, bool)> {
        match self.ctx.status.read()? {
            Some(existing)
                if existing.started()
                    && !existing.is_terminal()
                    && !existing.dry_run
                    && !options.dry_run =>
            {
                info!(run_id = %existing.run_id, "resuming interrupted migration");
                Ok((existing, true))
            }
            _ => Ok((
                self.ctx
                    .status
                    .init(Uuid::new_v4().to_string(), options.dry_run)?,
                false,
            )),
        }
    }

    async fn backup_step(
        &self,
        run_id: &str,
        options: &MigrationOptions,
        status: &MigrationStatus,
    ) -> Result<Option<String>> {
        let step = MigrationStep::CreateBackup;
        if status.is_step_completed(step) && status.backup_id.is_some() {
            self.emit(run_id, step, StepPhase::Skipped, status.progress, None);
            return Ok(status.backup_id.clone());
        }

        self.begin(run_id, step)?;
        let backup_id = if let Some(id) = &options.backup_id {
            self.recovery.find_backup(id).await?;
            Some(id.clone())
        } else if options.skip_backup {
            warn!(run_id, "backup skipped on request");
            self.ctx.journal.warn(format!("run {run_id} has no backup"));
            None
        } else {
            let backup = self
                .recovery
                .create_full_backup(
                    BackupSource::Local,
                    self.recovery.default_backup_options(),
                )
                .await?;
            Some(backup.id)
        };

        let recorded = backup_id.clone();
        self.ctx.status.update(|s| s.backup_id = recorded)?;
        self.complete(run_id, step, backup_id.clone())?;
        Ok(backup_id)
    }

    /// Users to transfer: not yet migrated, and lockable
    fn claim_users(
        &self,
        dataset: &ExportDataset,
        transfer: &mut Transfer,
    ) -> Result<(Vec<String>, Vec<UserLockGuard>)> {
        transfer.tracker.set_users_total(dataset.users.len() as u64);
        let holder = format!("migration:{}", transfer.run_id);

        let mut users = Vec::new();
        let mut guards = Vec::new();
        for user_id in dataset.users.keys() {
            if self.ctx.user_status.is_migrated(user_id)? {
                debug!(user_id = %user_id, "already migrated");
                transfer.tracker.user_skipped();
                continue;
            }
            match self.ctx.locks.try_acquire(user_id, &holder) {
                Ok(guard) => {
                    guards.push(guard);
                    users.push(user_id.clone());
                }
                Err(e) => {
                    transfer.fail_user(MigrationStep::MigrateUsers, user_id, e.to_string());
                }
            }
        }
        Ok((users, guards))
    }

    /// Close a transfer step, flushing per-user failures into the status
    fn finish_transfer(
        &self,
        run_id: &str,
        step: MigrationStep,
        transfer: &mut Transfer,
        result: Result<()>,
    ) -> Result<()> {
        self.flush_failures(transfer);
        if let Err(e) = result {
            return Err(self.fail(run_id, step, e));
        }
        self.complete(
            run_id,
            step,
            Some(format!("{} users failed so far", transfer.failed.len())),
        )
    }

    fn flush_failures(&self, transfer: &mut Transfer) {
        let fresh = &transfer.failures[transfer.flushed..];
        if fresh.is_empty() {
            return;
        }
        let result = self.ctx.status.update(|s| {
            for failure in fresh {
                s.record_error(Some(failure.step), Some(&failure.user_id), failure.message.clone());
            }
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to persist user failures");
        }
        transfer.flushed = transfer.failures.len();
    }

    async fn migrate_users(
        &self,
        dataset: &ExportDataset,
        users: &[String],
        options: &MigrationOptions,
        transfer: &mut Transfer,
    ) -> Result<()> {
        self.ctx.remote.ping().await?;
        for (batch_no, batch) in users.chunks(options.batch_size.max(1)).enumerate() {
            let profiles: Vec<_> = batch
                .iter()
                .filter_map(|uid| dataset.users.get(uid).cloned())
                .collect();
            let owners = batch.iter().map(|u| (u.clone(), u.clone())).collect();
            let outcome = self.ctx.remote.migrate_legacy_users(&profiles).await?;
            debug!(batch = batch_no, inserted = outcome.inserted, skipped = outcome.skipped, "user batch");
            transfer.absorb(MigrationStep::MigrateUsers, outcome, &owners);
        }
        Ok(())
    }

    async fn migrate_preferences(
        &self,
        dataset: &ExportDataset,
        users: &[String],
        transfer: &mut Transfer,
    ) -> Result<()> {
        for user_id in transfer.active(users) {
            let Some(preferences) = dataset.users.get(user_id).and_then(|u| u.preferences.as_ref())
            else {
                continue;
            };
            match self.ctx.remote.update_preferences(user_id, preferences).await {
                Ok(()) => transfer.tracker.records_transferred(1),
                Err(e @ MigrationError::Remote(_)) => return Err(e),
                Err(e) => {
                    transfer.tracker.records_failed(1);
                    transfer.fail_user(MigrationStep::MigratePreferences, user_id, e.to_string());
                }
            }
        }
        Ok(())
    }

    async fn migrate_stats(
        &self,
        dataset: &ExportDataset,
        users: &[String],
        options: &MigrationOptions,
        transfer: &mut Transfer,
    ) -> Result<()> {
        let active: Vec<String> = transfer.active(users).into_iter().cloned().collect();
        for batch in active.chunks(options.batch_size.max(1)) {
            let stats: Vec<_> = batch
                .iter()
                .filter_map(|uid| dataset.stats.get(uid).cloned())
                .collect();
            if stats.is_empty() {
                continue;
            }
            let owners = batch.iter().map(|u| (u.clone(), u.clone())).collect();
            let outcome = self.ctx.remote.migrate_legacy_stats(&stats).await?;
            transfer.absorb(MigrationStep::MigrateStats, outcome, &owners);
        }
        Ok(())
    }

    async fn migrate_sessions(
        &self,
        dataset: &ExportDataset,
        users: &[String],
        options: &MigrationOptions,
        transfer: &mut Transfer,
    ) -> Result<()> {
        let active: Vec<String> = transfer.active(users).into_iter().cloned().collect();
        for batch in active.chunks(options.batch_size.max(1)) {
            let mut sessions: Vec<Session> = Vec::new();
            let mut owners = HashMap::new();
            for user_id in batch {
                let stored = dataset.sessions_for(user_id);
                sessions.extend(stored.iter().cloned());
                if let Some(running) = dataset.active_sessions.get(user_id) {
                    if !stored.iter().any(|s| s.id == running.id) {
                        sessions.push(running.clone());
                    }
                }
                for session in stored.iter().chain(dataset.active_sessions.get(user_id)) {
                    owners.insert(session.id.clone(), user_id.clone());
                }
            }
            if sessions.is_empty() {
                continue;
            }
            let outcome = self.ctx.remote.migrate_legacy_sessions(&sessions).await?;
            transfer.absorb(MigrationStep::MigrateSessions, outcome, &owners);
        }
        Ok(())
    }

    async fn migrate_meetings(
        &self,
        dataset: &ExportDataset,
        users: &[String],
        options: &MigrationOptions,
        transfer: &mut Transfer,
    ) -> Result<()> {
        let active: Vec<String> = transfer.active(users).into_iter().cloned().collect();
        for batch in active.chunks(options.batch_size.max(1)) {
            let mut meetings = Vec::new();
            let mut owners = HashMap::new();
            for user_id in batch {
                for meeting in dataset.meetings_for(user_id) {
                    owners.insert(meeting.id.clone(), user_id.clone());
                    meetings.push(meeting.clone());
                }
            }
            if meetings.is_empty() {
                continue;
            }
            let outcome = self.ctx.remote.migrate_legacy_meetings(&meetings).await?;
            transfer.absorb(MigrationStep::MigrateMeetings, outcome, &owners);
        }
        Ok(())
    }

    // ── Step transitions ──

    fn begin(&self, run_id: &str, step: MigrationStep) -> Result<()> {
        let status = self.ctx.status.update(|s| s.begin_step(step))?;
        debug!(run_id, step = %step, "step started");
        self.emit(run_id, step, StepPhase::Started, status.progress, None);
        Ok(())
    }

    fn complete(&self, run_id: &str, step: MigrationStep, message: Option<String>) -> Result<()> {
        let status = self.ctx.status.update(|s| s.complete_step(step))?;
        info!(run_id, step = %step, progress = status.progress, "step completed");
        self.emit(run_id, step, StepPhase::Completed, status.progress, message);
        Ok(())
    }

    /// Mark the run failed and hand back the error to return
    fn fail(&self, run_id: &str, step: MigrationStep, err: MigrationError) -> MigrationError {
        let message = err.to_string();
        error!(run_id, step = %step, error = %message, "migration failed");
        let progress = match self.ctx.status.update(|s| s.mark_failed(message.clone())) {
            Ok(status) => status.progress,
            Err(e) => {
                warn!(run_id, error = %e, "failed to persist run failure");
                0
            }
        };
        self.ctx
            .journal
            .error(format!("migration {run_id} failed at {step}: {message}"));
        self.emit(run_id, step, StepPhase::Failed, progress, Some(message));
        err
    }

    fn emit(
        &self,
        run_id: &str,
        step: MigrationStep,
        phase: StepPhase,
        progress: u8,
        message: Option<String>,
    ) {
        self.reporter.on_step(&StepProgress {
            run_id: run_id.to_string(),
            step,
            phase,
            progress,
            message,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::RecoveryConfig;
    use crate::model::{Session, UserProfile, UserStats};
    use crate::state::RunState;
    use crate::store::{
        write_dataset, KeyValueStore, MemoryKvStore, MemoryRemoteStore, MemorySink, RemoteTable,
    };
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingReporter {
        events: Mutex<Vec<StepProgress>>,
    }

    impl ProgressReporter for RecordingReporter {
        fn on_step(&self, progress: &StepProgress) {
            self.events.lock().push(progress.clone());
        }
    }

    struct Fixture {
        manager: MigrationManager,
        local: Arc<MemoryKvStore>,
        remote: Arc<MemoryRemoteStore>,
        reporter: Arc<RecordingReporter>,
    }

    fn user(id: &str) -> UserProfile {
        UserProfile {
            id: id.into(),
            email: format!("{id}@example.com"),
            name: format!("User {id}"),
            created_at: "2024-01-01T00:00:00Z".into(),
            ..Default::default()
        }
    }

    fn session(id: &str, uid: &str) -> Session {
        Session {
            id: id.into(),
            user_id: uid.into(),
            start_time: "2024-01-02T10:00:00Z".into(),
            end_time: Some("2024-01-02T10:25:00Z".into()),
            duration: Some(25),
            status: "completed".into(),
            completed_at: Some("2024-01-02T10:25:00Z".into()),
            ..Default::default()
        }
    }

    fn dataset() -> ExportDataset {
        let mut dataset = ExportDataset::new("test");
        for uid in ["u1", "u2"] {
            dataset.users.insert(uid.into(), user(uid));
            dataset.sessions.insert(
                uid.into(),
                vec![session(&format!("{uid}-s1"), uid), session(&format!("{uid}-s2"), uid)],
            );
            dataset.stats.insert(
                uid.into(),
                UserStats {
                    user_id: uid.into(),
                    total_sessions: 2,
                    completed_sessions: 2,
                    ..Default::default()
                },
            );
        }
        dataset.refresh_statistics();
        dataset
    }

    fn fixture(dataset: &ExportDataset) -> Fixture {
        let local = Arc::new(MemoryKvStore::new());
        write_dataset(local.as_ref(), dataset).unwrap();
        let remote = Arc::new(MemoryRemoteStore::new());
        let ctx = EngineContext::new(
            local.clone(),
            remote.clone(),
            Arc::new(MemorySink::new()),
            100,
        );
        let recovery = Arc::new(RecoveryManager::new(ctx.clone(), RecoveryConfig::default()));
        let reporter = Arc::new(RecordingReporter::default());
        let manager = MigrationManager::new(ctx, recovery, ValidationOptions::default())
            .with_reporter(reporter.clone());
        Fixture {
            manager,
            local,
            remote,
            reporter,
        }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let f = fixture(&dataset());
        let report = f.manager.start(MigrationOptions::default()).await.unwrap();

        assert_eq!(report.outcome, MigrationOutcome::Success);
        assert_eq!(report.completed_steps, MigrationStep::ALL.to_vec());
        assert!(report.backup_id.is_some());
        assert!(report.verification.as_ref().unwrap().passed);
        assert_eq!(report.transfer.users_migrated, 2);
        assert_eq!(f.remote.row_count(RemoteTable::Users), 2);
        assert_eq!(f.remote.row_count(RemoteTable::Sessions), 4);
        assert_eq!(f.remote.row_count(RemoteTable::Stats), 2);

        let status = f.manager.status().unwrap().unwrap();
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.progress, 100);
        assert!(f.manager.last_run().unwrap().is_some());
        assert!(f.manager.ctx.user_status.is_migrated("u1").unwrap());
        assert!(!f.manager.ctx.locks.is_locked("u1"));
        assert!(!f.manager.is_running());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let f = fixture(&dataset());
        f.manager.start(MigrationOptions::default()).await.unwrap();

        let events = f.reporter.events.lock();
        assert!(!events.is_empty());
        for pair in events.windows(2) {
            assert!(pair[0].progress <= pair[1].progress);
        }
        let completed = events
            .iter()
            .filter(|e| e.phase == StepPhase::Completed)
            .count();
        assert_eq!(completed, MigrationStep::ALL.len());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing_remote() {
        let f = fixture(&dataset());
        let options = MigrationOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = f.manager.start(options).await.unwrap();

        assert_eq!(report.outcome, MigrationOutcome::DryRun);
        assert_eq!(
            report.completed_steps,
            vec![
                MigrationStep::Export,
                MigrationStep::ValidateExport,
                MigrationStep::CreateBackup
            ]
        );
        assert_eq!(report.export.unwrap().users.len(), 2);
        assert!(report.validation.unwrap().is_valid);
        assert_eq!(f.remote.write_count(), 0);

        let status = f.manager.status().unwrap().unwrap();
        assert!(status.dry_run);
        assert!(status.completed());
    }

    #[tokio::test]
    async fn test_invalid_export_aborts_before_remote_writes() {
        let mut data = dataset();
        data.sessions.get_mut("u1").unwrap()[0].end_time = Some("2024-01-02T09:00:00Z".into());
        let f = fixture(&data);

        let err = f.manager.start(MigrationOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("(users: u1)"), "{err}");
        assert_eq!(f.remote.write_count(), 0);
        let status = f.manager.status().unwrap().unwrap();
        assert!(matches!(status.state, RunState::Failed(_)));
        assert!(!status.is_step_completed(MigrationStep::ValidateExport));
        assert!(f
            .reporter
            .events
            .lock()
            .iter()
            .any(|e| e.phase == StepPhase::Failed));
    }

    #[tokio::test]
    async fn test_ignoring_validation_errors_continues() {
        let mut data = dataset();
        data.sessions.get_mut("u1").unwrap()[0].end_time = Some("2024-01-02T09:00:00Z".into());
        let f = fixture(&data);
        let options = MigrationOptions {
            ignore_validation_errors: true,
            ..Default::default()
        };
        let report = f.manager.start(options).await.unwrap();
        assert_eq!(report.outcome, MigrationOutcome::Success);
        assert!(!report.validation.unwrap().is_valid);
    }

    #[tokio::test]
    async fn test_failing_user_is_skipped_and_reported() {
        let f = fixture(&dataset());
        f.remote.fail_user("u2");

        let report = f.manager.start(MigrationOptions::default()).await.unwrap();
        assert_eq!(report.outcome, MigrationOutcome::PartialSuccess);
        assert_eq!(report.failed_users(), vec!["u2"]);
        assert_eq!(report.transfer.users_migrated, 1);
        assert_eq!(report.transfer.users_failed, 1);
        assert!(f.manager.ctx.user_status.is_migrated("u1").unwrap());
        assert!(!f.manager.ctx.user_status.is_migrated("u2").unwrap());

        let status = f.manager.status().unwrap().unwrap();
        assert!(status
            .errors
            .iter()
            .any(|e| e.user_id.as_deref() == Some("u2")));

        // A second run only transfers the previously failed user
        f.remote.heal_user("u2");
        let report = f.manager.start(MigrationOptions::default()).await.unwrap();
        assert_eq!(report.outcome, MigrationOutcome::Success);
        assert_eq!(report.transfer.users_skipped, 1);
        assert_eq!(report.transfer.users_migrated, 1);
    }

    #[tokio::test]
    async fn test_unreadable_section_fails_its_owner() {
        let f = fixture(&dataset());
        f.local
            .set(&crate::store::keys::sessions_key("u1"), "{not json")
            .unwrap();

        let report = f.manager.start(MigrationOptions::default()).await.unwrap();
        assert_eq!(report.outcome, MigrationOutcome::PartialSuccess);
        assert_eq!(report.failed_users(), vec!["u1"]);
        assert!(report.failures[0].message.contains("app:sessions:u1"));
        assert!(!f.manager.ctx.user_status.is_migrated("u1").unwrap());
        assert!(f.manager.ctx.user_status.is_migrated("u2").unwrap());
        assert_eq!(f.remote.row_count(RemoteTable::Sessions), 2);

        // Repairing the section lets the next run pick the user up
        write_dataset(f.local.as_ref(), &dataset()).unwrap();
        let report = f.manager.start(MigrationOptions::default()).await.unwrap();
        assert_eq!(report.outcome, MigrationOutcome::Success);
        assert_eq!(report.transfer.users_migrated, 1);
        assert_eq!(f.remote.row_count(RemoteTable::Sessions), 4);
    }

    #[tokio::test]
    async fn test_offline_remote_fails_run() {
        let f = fixture(&dataset());
        f.remote.set_online(false);

        let err = f.manager.start(MigrationOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), "remote_error");
        let status = f.manager.status().unwrap().unwrap();
        assert!(matches!(status.state, RunState::Failed(_)));
        assert!(status.is_step_completed(MigrationStep::CreateBackup));
    }

    #[tokio::test]
    async fn test_verification_failure_is_integrity_error() {
        let f = fixture(&dataset());
        f.remote.inject_violation("orphan_sessions");

        let err = f.manager.start(MigrationOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), "integrity_error");
        assert!(err.to_string().contains("orphan_sessions"));
    }

    #[tokio::test]
    async fn test_interrupted_run_resumes_under_same_id() {
        let f = fixture(&dataset());
        let ctx = &f.manager.ctx;
        ctx.status.init("run-1", false).unwrap();
        ctx.status
            .update(|s| {
                s.mark_running();
                s.complete_step(MigrationStep::Export);
                s.complete_step(MigrationStep::ValidateExport);
                s.complete_step(MigrationStep::CreateBackup);
                s.backup_id = Some("b-1".into());
            })
            .unwrap();

        let report = f.manager.start(MigrationOptions::default()).await.unwrap();
        assert!(report.resumed);
        assert_eq!(report.run_id, "run-1");
        assert_eq!(report.backup_id.as_deref(), Some("b-1"));
        assert!(f
            .reporter
            .events
            .lock()
            .iter()
            .any(|e| e.step == MigrationStep::CreateBackup && e.phase == StepPhase::Skipped));
    }

    #[tokio::test]
    async fn test_locked_user_is_reported_busy() {
        let f = fixture(&dataset());
        let _held = f.manager.ctx.locks.try_acquire("u1", "hybrid").unwrap();

        let report = f.manager.start(MigrationOptions::default()).await.unwrap();
        assert_eq!(report.failed_users(), vec!["u1"]);
        assert!(report.failures[0].message.contains("u1"));
    }

    #[tokio::test]
    async fn test_rollback_clears_status() {
        let f = fixture(&dataset());
        let before = f.local.get(crate::store::keys::USERS_KEY).unwrap();
        f.manager.start(MigrationOptions::default()).await.unwrap();

        let report = f.manager.rollback(None).await.unwrap();
        assert_eq!(report.users_restored, 2);
        assert!(f.manager.status().unwrap().is_none());
        assert_eq!(f.local.get(crate::store::keys::USERS_KEY).unwrap(), before);
    }
}
