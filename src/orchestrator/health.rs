//! Migration readiness checks
//!
//! Runs four stages in order (local scan, export validation, remote
//! connectivity, backup self-test) and folds them into one status with
//! ranked recommendations. Stage failures become check results, never
//! errors, so a broken remote store still yields a full report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::extractor::{Extractor, ScanHealth, ScanReport};
use crate::recovery::RecoveryManager;
use crate::store::RemoteStore;
use crate::validator::{DatasetValidator, Priority, Recommendation, ValidationOptions};

/// Snapshot event used by the backup self-test
pub const SELF_TEST_EVENT: &str = "health_check";

/// Overall readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Ready to migrate
    Healthy,
    /// Migration possible, but something needs a look
    Issues,
    /// Migration would fail or lose data
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Issues => write!(f, "issues"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Status of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Passed
    Ok,
    /// Passed with reservations
    Warning,
    /// Failed
    Error,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Result of a single check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name
    pub name: String,
    /// Outcome
    pub status: CheckStatus,
    /// Detail
    pub message: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
        }
    }
}

/// Aggregated health check outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Individual checks in run order
    pub checks: Vec<CheckResult>,
    /// Local scan
    pub scan: Option<ScanReport>,
    /// Export validation score, when users were found
    pub validation_score: Option<u8>,
    /// Remote store answered the ping
    pub remote_reachable: bool,
    /// Snapshot create and discard both worked
    pub backup_ok: bool,
    /// Most urgent first
    pub recommendations: Vec<Recommendation>,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Whether a migration may start
    pub fn allows_migration(&self) -> bool {
        self.status != HealthStatus::Critical
    }
}

/// Run every stage, reporting `(stage, percent)` as each one finishes
pub async fn run_health_check(
    extractor: &Extractor,
    validation: &ValidationOptions,
    remote: &dyn RemoteStore,
    recovery: &RecoveryManager,
    progress: impl Fn(&str, u8),
) -> HealthReport {
    let mut checks = Vec::new();
    let mut recommendations = Vec::new();

    // Scan
    let scan = match extractor.scan() {
        Ok(scan) => {
            let status = match scan.health {
                ScanHealth::Healthy => CheckStatus::Ok,
                ScanHealth::Degraded | ScanHealth::Empty => CheckStatus::Warning,
            };
            let issues = scan.issues();
            let message = if issues.is_empty() {
                format!("{} users, {} keys", scan.user_count, scan.app_keys)
            } else {
                issues.join("; ")
            };
            if scan.health == ScanHealth::Degraded {
                recommendations.push(Recommendation::new(
                    Priority::High,
                    "Inspect unreadable or orphaned keys before migrating",
                ));
            }
            if scan.health == ScanHealth::Empty {
                recommendations.push(Recommendation::new(
                    Priority::Low,
                    "No local user data found; nothing to migrate",
                ));
            }
            checks.push(CheckResult::new("local_scan", status, message));
            Some(scan)
        }
        Err(e) => {
            checks.push(CheckResult::new("local_scan", CheckStatus::Error, e.to_string()));
            recommendations.push(Recommendation::new(
                Priority::Critical,
                "Local store cannot be read",
            ));
            None
        }
    };
    progress("scan", 25);

    // Validation
    let mut validation_score = None;
    if scan.as_ref().is_some_and(|s| s.user_count > 0) {
        match extractor.extract_all() {
            Ok(extraction) => {
                let result = DatasetValidator::new(validation.clone()).validate(&extraction.dataset);
                let status = if result.is_valid {
                    CheckStatus::Ok
                } else if result.score >= 50 {
                    CheckStatus::Warning
                } else {
                    CheckStatus::Error
                };
                checks.push(CheckResult::new("validation", status, result.summary()));
                validation_score = Some(result.score);
                recommendations.extend(result.recommendations);
            }
            Err(e) => {
                checks.push(CheckResult::new("validation", CheckStatus::Error, e.to_string()));
                recommendations.push(Recommendation::new(
                    Priority::Critical,
                    "Local data cannot be exported",
                ));
            }
        }
    }
    progress("validation", 50);

    // Connectivity
    let remote_reachable = match remote.ping().await {
        Ok(()) => {
            checks.push(CheckResult::new("remote", CheckStatus::Ok, "reachable"));
            true
        }
        Err(e) => {
            checks.push(CheckResult::new("remote", CheckStatus::Error, e.to_string()));
            recommendations.push(Recommendation::new(
                Priority::Critical,
                "Remote store is unreachable; check connectivity before migrating",
            ));
            false
        }
    };
    progress("connectivity", 75);

    // Backup self-test
    let backup_ok = match recovery.create_snapshot(SELF_TEST_EVENT, None) {
        Ok(snapshot) => match recovery.discard_snapshot(&snapshot.id) {
            Ok(_) => {
                checks.push(CheckResult::new("backup", CheckStatus::Ok, "snapshot round trip"));
                true
            }
            Err(e) => {
                checks.push(CheckResult::new("backup", CheckStatus::Error, e.to_string()));
                false
            }
        },
        Err(e) => {
            checks.push(CheckResult::new("backup", CheckStatus::Error, e.to_string()));
            false
        }
    };
    if !backup_ok {
        recommendations.push(Recommendation::new(
            Priority::Critical,
            "Backups cannot be written; do not migrate without one",
        ));
    }
    progress("backup", 100);

    let status = if checks.iter().any(|c| c.status == CheckStatus::Error) {
        HealthStatus::Critical
    } else if checks.iter().any(|c| c.status == CheckStatus::Warning) {
        HealthStatus::Issues
    } else {
        HealthStatus::Healthy
    };
    recommendations.sort_by_key(|r| r.priority);
    recommendations.dedup();

    for check in &checks {
        debug!(check = %check.name, status = %check.status, message = %check.message, "health check");
    }
    info!(status = %status, checks = checks.len(), "health check finished");

    HealthReport {
        status,
        checks,
        scan,
        validation_score,
        remote_reachable,
        backup_ok,
        recommendations,
        checked_at: Utc::now(),
    }
}
