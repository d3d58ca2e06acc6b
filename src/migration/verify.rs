//! Post-migration remote verification
//!
//! Two checks run after the transfer steps: per-user row counts must reach
//! what the exported dataset holds, and the remote integrity report must
//! contain no `VIOLATION` rows. Remote counts may exceed the export, since
//! mirrored writes can land between export and verification.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::ExportDataset;
use crate::store::{RemoteQuery, RemoteStore, RemoteTable};

/// Integrity row status that fails verification
const VIOLATION: &str = "VIOLATION";

/// Expected vs actual rows for one user and table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountCheck {
    /// Table
    pub table: RemoteTable,
    /// Owner
    pub user_id: String,
    /// Rows in the export
    pub expected: u64,
    /// Rows in the remote store
    pub actual: u64,
}

impl CountCheck {
    /// Whether the remote store holds at least the exported rows
    pub fn passed(&self) -> bool {
        self.actual >= self.expected
    }
}

/// Outcome of remote verification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Every count check
    pub counts: Vec<CountCheck>,
    /// Integrity checks reported as violated, as `check: details`
    pub violations: Vec<String>,
    /// No count shortfalls and no violations
    pub passed: bool,
}

impl VerificationReport {
    /// Count checks that fell short
    pub fn count_mismatches(&self) -> Vec<&CountCheck> {
        self.counts.iter().filter(|c| !c.passed()).collect()
    }

    /// One line per problem
    pub fn problems(&self) -> Vec<String> {
        let mut problems: Vec<String> = self
            .count_mismatches()
            .into_iter()
            .map(|c| {
                format!(
                    "{} for user {}: expected at least {}, found {}",
                    c.table, c.user_id, c.expected, c.actual
                )
            })
            .collect();
        problems.extend(self.violations.iter().cloned());
        problems
    }
}

/// Rows the export holds for `user_id`, per table
pub fn expected_rows(dataset: &ExportDataset, user_id: &str) -> Vec<(RemoteTable, u64)> {
    let Some(user) = dataset.users.get(user_id) else {
        return Vec::new();
    };
    let sessions = dataset.sessions_for(user_id);
    let extra_active = dataset
        .active_sessions
        .get(user_id)
        .filter(|active| !sessions.iter().any(|s| s.id == active.id))
        .map_or(0, |_| 1);

    vec![
        (RemoteTable::Users, 1),
        (RemoteTable::Preferences, u64::from(user.preferences.is_some())),
        (RemoteTable::Stats, u64::from(dataset.stats.contains_key(user_id))),
        (RemoteTable::Sessions, sessions.len() as u64 + extra_active),
        (RemoteTable::Meetings, dataset.meetings_for(user_id).len() as u64),
    ]
}

/// Verify `user_ids` against the remote store
pub async fn verify_remote(
    remote: &dyn RemoteStore,
    dataset: &ExportDataset,
    user_ids: &[String],
) -> Result<VerificationReport> {
    let mut report = VerificationReport::default();

    for user_id in user_ids {
        for (table, expected) in expected_rows(dataset, user_id) {
            let rows = remote
                .execute_query(RemoteQuery::CountRowsForUser(table, user_id.clone()))
                .await?;
            let actual = rows
                .first()
                .and_then(|row| row.get("count"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            report.counts.push(CountCheck {
                table,
                user_id: user_id.clone(),
                expected,
                actual,
            });
        }
    }

    for row in remote.execute_query(RemoteQuery::IntegrityReport).await? {
        let status = row.get("status").and_then(Value::as_str).unwrap_or_default();
        if status.eq_ignore_ascii_case(VIOLATION) {
            let check = row.get("check").and_then(Value::as_str).unwrap_or("unknown");
            let details = row.get("details").and_then(Value::as_str).unwrap_or_default();
            warn!(check, details, "remote integrity violation");
            report.violations.push(format!("{check}: {details}"));
        }
    }

    report.passed = report.violations.is_empty() && report.count_mismatches().is_empty();
    debug!(
        users = user_ids.len(),
        checks = report.counts.len(),
        violations = report.violations.len(),
        passed = report.passed,
        "remote verification finished"
    );
    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{Session, UserProfile};
    use crate::store::MemoryRemoteStore;

    fn dataset() -> ExportDataset {
        let mut dataset = ExportDataset::new("test");
        dataset.users.insert(
            "u1".into(),
            UserProfile {
                id: "u1".into(),
                ..Default::default()
            },
        );
        dataset.sessions.insert(
            "u1".into(),
            vec![Session {
                id: "s1".into(),
                user_id: "u1".into(),
                ..Default::default()
            }],
        );
        dataset
    }

    #[tokio::test]
    async fn test_passes_when_rows_present() {
        let remote = MemoryRemoteStore::new();
        let dataset = dataset();
        remote.upsert_user(&dataset.users["u1"]).await.unwrap();
        remote.upsert_session(&dataset.sessions["u1"][0]).await.unwrap();

        let report = verify_remote(&remote, &dataset, &["u1".to_string()])
            .await
            .unwrap();
        assert!(report.passed, "{:?}", report.problems());
    }

    #[tokio::test]
    async fn test_missing_rows_and_violations_fail() {
        let remote = MemoryRemoteStore::new();
        let dataset = dataset();
        remote.upsert_user(&dataset.users["u1"]).await.unwrap();
        remote.inject_violation("orphan_sessions");

        let report = verify_remote(&remote, &dataset, &["u1".to_string()])
            .await
            .unwrap();
        assert!(!report.passed);
        assert_eq!(report.count_mismatches().len(), 1);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.problems().len(), 2);
    }

    #[test]
    fn test_active_session_counted_once() {
        let mut dataset = dataset();
        let active = dataset.sessions["u1"][0].clone();
        dataset.active_sessions.insert("u1".into(), active);
        let rows = expected_rows(&dataset, "u1");
        assert!(rows.contains(&(RemoteTable::Sessions, 1)));
        assert!(expected_rows(&dataset, "ghost").is_empty());
    }
}
