//! Migration progress tracking and reporting
//!
//! Step transitions are pushed to a [`ProgressReporter`] as they happen;
//! per-record counters live in a [`TransferTracker`] and end up in the
//! [`MigrationReport`] returned by a run.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::model::ExportDataset;
use crate::state::MigrationStep;
use crate::validator::ValidationResult;

use super::verify::VerificationReport;

// ---------------------------------------------------------------------------
// Step progress
// ---------------------------------------------------------------------------

/// What happened to a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Step began
    Started,
    /// Step finished
    Completed,
    /// Step was already complete in a resumed run
    Skipped,
    /// Step failed and the run stopped
    Failed,
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A step transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProgress {
    /// Run the step belongs to
    pub run_id: String,
    /// Step
    pub step: MigrationStep,
    /// Transition
    pub phase: StepPhase,
    /// Run progress after the transition, 0–100
    pub progress: u8,
    /// Optional detail
    pub message: Option<String>,
}

/// Receives step transitions as they happen
pub trait ProgressReporter: Send + Sync {
    /// Called after the status has been persisted
    fn on_step(&self, progress: &StepProgress);
}

/// Reporter that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn on_step(&self, _progress: &StepProgress) {}
}

// ---------------------------------------------------------------------------
// Transfer tracker
// ---------------------------------------------------------------------------

/// Window size for throughput sampling.
const THROUGHPUT_WINDOW: usize = 60;

/// Point-in-time transfer counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    /// Users in scope
    pub users_total: u64,
    /// Users fully transferred
    pub users_migrated: u64,
    /// Users skipped as already migrated
    pub users_skipped: u64,
    /// Users with at least one failed record
    pub users_failed: u64,
    /// Records accepted by the remote store
    pub records_transferred: u64,
    /// Records rejected by the remote store
    pub records_failed: u64,
    /// Records per second over the sampling window
    pub records_per_sec: f64,
    /// Time since the tracker was created
    pub elapsed: Duration,
}

/// Counters for one transfer.
///
/// Counters are atomics so the tracker can be shared by reference; the
/// throughput window sits behind a `parking_lot::RwLock`.
pub struct TransferTracker {
    users_total: AtomicU64,
    users_migrated: AtomicU64,
    users_skipped: AtomicU64,
    users_failed: AtomicU64,
    records_transferred: AtomicU64,
    records_failed: AtomicU64,
    start_time: Instant,
    /// Sliding window of (timestamp, cumulative records) for throughput
    throughput_samples: RwLock<VecDeque<(Instant, u64)>>,
}

impl TransferTracker {
    /// Create a tracker. The clock starts immediately.
    pub fn new() -> Self {
        Self {
            users_total: AtomicU64::new(0),
            users_migrated: AtomicU64::new(0),
            users_skipped: AtomicU64::new(0),
            users_failed: AtomicU64::new(0),
            records_transferred: AtomicU64::new(0),
            records_failed: AtomicU64::new(0),
            start_time: Instant::now(),
            throughput_samples: RwLock::new(VecDeque::with_capacity(THROUGHPUT_WINDOW)),
        }
    }

    /// Set the number of users in scope.
    pub fn set_users_total(&self, total: u64) {
        self.users_total.store(total, Ordering::Relaxed);
    }

    /// Record a fully transferred user.
    pub fn user_migrated(&self) {
        self.users_migrated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a user skipped as already migrated.
    pub fn user_skipped(&self) {
        self.users_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a user with failures.
    pub fn user_failed(&self) {
        self.users_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` accepted records.
    pub fn records_transferred(&self, count: u64) {
        let new_val = self.records_transferred.fetch_add(count, Ordering::Relaxed) + count;
        let mut samples = self.throughput_samples.write();
        samples.push_back((Instant::now(), new_val));
        if samples.len() > THROUGHPUT_WINDOW {
            samples.pop_front();
        }
    }

    /// Record `count` rejected records.
    pub fn records_failed(&self, count: u64) {
        self.records_failed.fetch_add(count, Ordering::Relaxed);
    }

    /// Records per second over the sampling window.
    pub fn throughput_records_per_sec(&self) -> f64 {
        let samples = self.throughput_samples.read();
        let (first, last) = match (samples.front(), samples.back()) {
            (Some(f), Some(l)) if samples.len() >= 2 => (f, l),
            _ => return 0.0,
        };
        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if elapsed < f64::EPSILON {
            return 0.0;
        }
        (last.1 - first.1) as f64 / elapsed
    }

    /// Take a point-in-time snapshot.
    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            users_total: self.users_total.load(Ordering::Relaxed),
            users_migrated: self.users_migrated.load(Ordering::Relaxed),
            users_skipped: self.users_skipped.load(Ordering::Relaxed),
            users_failed: self.users_failed.load(Ordering::Relaxed),
            records_transferred: self.records_transferred.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            records_per_sec: self.throughput_records_per_sec(),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for TransferTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Migration report
// ---------------------------------------------------------------------------

/// Outcome of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// Every user migrated and verified
    Success,
    /// Completed with some users failing
    PartialSuccess,
    /// Stopped after the backup without remote writes
    DryRun,
    /// Run failed
    Failed,
    /// Run was rolled back
    RolledBack,
}

impl std::fmt::Display for MigrationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::PartialSuccess => write!(f, "partial_success"),
            Self::DryRun => write!(f, "dry_run"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// A per-user failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFailure {
    /// User
    pub user_id: String,
    /// Step the failure happened in
    pub step: MigrationStep,
    /// Description
    pub message: String,
}

/// Report produced at the end of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Run identifier
    pub run_id: String,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run ended
    pub completed_at: Option<DateTime<Utc>>,
    /// Whether this was a dry run
    pub dry_run: bool,
    /// Whether a persisted run was resumed
    pub resumed: bool,
    /// Backup protecting the run
    pub backup_id: Option<String>,
    /// Steps completed, in order
    pub completed_steps: Vec<MigrationStep>,
    /// Transfer counters
    pub transfer: TransferSnapshot,
    /// Per-user failures
    pub failures: Vec<UserFailure>,
    /// Remote verification, if run
    pub verification: Option<VerificationReport>,
    /// Exported dataset (dry runs only)
    pub export: Option<ExportDataset>,
    /// Export validation
    pub validation: Option<ValidationResult>,
    /// Final outcome
    pub outcome: MigrationOutcome,
}

impl MigrationReport {
    /// Create a report for `run_id`.
    pub fn new(run_id: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            completed_at: None,
            dry_run,
            resumed: false,
            backup_id: None,
            completed_steps: Vec::new(),
            transfer: TransferSnapshot::default(),
            failures: Vec::new(),
            verification: None,
            export: None,
            validation: None,
            outcome: MigrationOutcome::Failed, // until proven otherwise
        }
    }

    /// Users that failed, deduplicated
    pub fn failed_users(&self) -> Vec<&str> {
        let mut users: Vec<&str> = self.failures.iter().map(|f| f.user_id.as_str()).collect();
        users.sort_unstable();
        users.dedup();
        users
    }

    /// Produce a human-readable summary of the run.
    pub fn summary(&self) -> String {
        let duration = self
            .completed_at
            .map(|end| end - self.started_at)
            .and_then(|d| d.to_std().ok())
            .map(|d| format!("{:.1}s", d.as_secs_f64()))
            .unwrap_or_else(|| "in progress".to_string());

        let verification_line = match &self.verification {
            Some(v) => format!(
                "Verified: {} ({} count mismatches, {} violations)\n",
                if v.passed { "passed" } else { "FAILED" },
                v.count_mismatches().len(),
                v.violations.len()
            ),
            None => String::new(),
        };

        format!(
            "Migration Report [{}]\n\
             Outcome: {}\n\
             Backup: {}\n\
             Duration: {}\n\
             Steps: {}/{}\n\
             Users: {}/{} migrated, {} skipped, {} failed\n\
             Records: {} transferred, {} failed\n\
             {}\
             Errors: {}",
            self.run_id,
            self.outcome,
            self.backup_id.as_deref().unwrap_or("none"),
            duration,
            self.completed_steps.len(),
            MigrationStep::total(),
            self.transfer.users_migrated,
            self.transfer.users_total,
            self.transfer.users_skipped,
            self.transfer.users_failed,
            self.transfer.records_transferred,
            self.transfer.records_failed,
            verification_line,
            self.failures.len(),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_tracker_defaults() {
        let tracker = TransferTracker::new();
        let snap = tracker.snapshot();
        assert_eq!(snap.users_total, 0);
        assert_eq!(snap.records_transferred, 0);
        assert_eq!(snap.records_per_sec, 0.0);
    }

    #[test]
    fn test_user_counters() {
        let tracker = TransferTracker::new();
        tracker.set_users_total(3);
        tracker.user_migrated();
        tracker.user_skipped();
        tracker.user_failed();
        let snap = tracker.snapshot();
        assert_eq!(snap.users_total, 3);
        assert_eq!(snap.users_migrated, 1);
        assert_eq!(snap.users_skipped, 1);
        assert_eq!(snap.users_failed, 1);
    }

    #[test]
    fn test_throughput() {
        let tracker = TransferTracker::new();
        tracker.records_transferred(10);
        thread::sleep(Duration::from_millis(20));
        tracker.records_transferred(10);
        assert!(tracker.throughput_records_per_sec() > 0.0);
        assert_eq!(tracker.snapshot().records_transferred, 20);
    }

    #[test]
    fn test_report_summary() {
        let mut report = MigrationReport::new("run-1", false);
        report.transfer.users_total = 3;
        report.transfer.users_migrated = 3;
        report.outcome = MigrationOutcome::Success;
        report.completed_at = Some(Utc::now());

        let summary = report.summary();
        assert!(summary.contains("success"));
        assert!(summary.contains("3/3 migrated"));
    }

    #[test]
    fn test_failed_users_dedup() {
        let mut report = MigrationReport::new("run-1", false);
        for step in [MigrationStep::MigrateStats, MigrationStep::MigrateSessions] {
            report.failures.push(UserFailure {
                user_id: "u2".into(),
                step,
                message: "rejected".into(),
            });
        }
        assert_eq!(report.failed_users(), vec!["u2"]);
    }

    #[test]
    fn test_display() {
        assert_eq!(MigrationOutcome::RolledBack.to_string(), "rolled_back");
        assert_eq!(StepPhase::Skipped.to_string(), "skipped");
    }
}
