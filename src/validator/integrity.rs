//! Referential integrity checks
//!
//! Every child record must resolve to a user in the dataset. A record's
//! owner is its embedded `userId`, falling back to the map key it is stored
//! under when the field is empty.

use serde::{Deserialize, Serialize};

use crate::model::ExportDataset;

/// Child record kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildKind {
    /// Session record
    Session,
    /// Stats record
    Stats,
    /// Meeting record
    Meeting,
    /// Active session record
    ActiveSession,
}

impl std::fmt::Display for ChildKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Stats => write!(f, "stats"),
            Self::Meeting => write!(f, "meeting"),
            Self::ActiveSession => write!(f, "active session"),
        }
    }
}

/// A referential finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IntegrityFinding {
    /// A child record whose owner is not a known user
    Orphan {
        /// Record kind
        kind: ChildKind,
        /// Record id (stats use the owner id)
        record_id: String,
        /// Owner the record points at
        owner_id: String,
    },
    /// A child stored under one user but claiming another
    OwnerMismatch {
        /// Record kind
        kind: ChildKind,
        /// Record id
        record_id: String,
        /// Map key the record is stored under
        bucket: String,
        /// Embedded owner id
        owner_id: String,
    },
    /// Stats session counter disagrees with stored sessions
    CountMismatch {
        /// Owner
        user_id: String,
        /// Value recorded in stats
        recorded: i64,
        /// Sessions actually stored
        actual: usize,
    },
}

impl IntegrityFinding {
    /// Whether this finding is an error (as opposed to a warning)
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::CountMismatch { .. })
    }

    /// Human-readable description
    pub fn message(&self) -> String {
        match self {
            Self::Orphan {
                kind,
                record_id,
                owner_id,
            } => format!("{kind} {record_id} references missing user {owner_id}"),
            Self::OwnerMismatch {
                kind,
                record_id,
                bucket,
                owner_id,
            } => format!("{kind} {record_id} is stored under user {bucket} but owned by {owner_id}"),
            Self::CountMismatch {
                user_id,
                recorded,
                actual,
            } => format!(
                "stats for user {user_id} record {recorded} sessions but {actual} are stored"
            ),
        }
    }
}

fn owner<'a>(embedded: &'a str, bucket: &'a str) -> &'a str {
    if embedded.is_empty() {
        bucket
    } else {
        embedded
    }
}

/// Run every referential check over `dataset`
pub fn check_integrity(dataset: &ExportDataset) -> Vec<IntegrityFinding> {
    let mut findings = Vec::new();
    let mut check = |kind: ChildKind, record_id: &str, embedded: &str, bucket: &str| {
        let owner_id = owner(embedded, bucket);
        if !dataset.users.contains_key(owner_id) {
            findings.push(IntegrityFinding::Orphan {
                kind,
                record_id: record_id.to_string(),
                owner_id: owner_id.to_string(),
            });
        } else if owner_id != bucket {
            findings.push(IntegrityFinding::OwnerMismatch {
                kind,
                record_id: record_id.to_string(),
                bucket: bucket.to_string(),
                owner_id: owner_id.to_string(),
            });
        }
    };

    for (bucket, sessions) in &dataset.sessions {
        for session in sessions {
            check(ChildKind::Session, &session.id, &session.user_id, bucket);
        }
    }
    for (bucket, stats) in &dataset.stats {
        check(ChildKind::Stats, bucket, &stats.user_id, bucket);
    }
    for (bucket, meetings) in &dataset.meetings {
        for meeting in meetings {
            check(ChildKind::Meeting, &meeting.id, &meeting.user_id, bucket);
        }
    }
    for (bucket, session) in &dataset.active_sessions {
        check(ChildKind::ActiveSession, &session.id, &session.user_id, bucket);
    }

    for (uid, stats) in &dataset.stats {
        if !dataset.users.contains_key(uid) {
            continue;
        }
        let actual = dataset.sessions_for(uid).len();
        if stats.total_sessions != actual as i64 {
            findings.push(IntegrityFinding::CountMismatch {
                user_id: uid.clone(),
                recorded: stats.total_sessions,
                actual,
            });
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Session, UserProfile, UserStats};

    fn dataset() -> ExportDataset {
        let mut dataset = ExportDataset::new("test");
        dataset.users.insert(
            "u1".into(),
            UserProfile {
                id: "u1".into(),
                ..Default::default()
            },
        );
        dataset
    }

    #[test]
    fn test_clean_dataset() {
        let mut dataset = dataset();
        dataset.sessions.insert(
            "u1".into(),
            vec![Session {
                id: "s1".into(),
                user_id: "u1".into(),
                ..Default::default()
            }],
        );
        dataset.stats.insert(
            "u1".into(),
            UserStats {
                user_id: "u1".into(),
                total_sessions: 1,
                ..Default::default()
            },
        );
        assert!(check_integrity(&dataset).is_empty());
    }

    #[test]
    fn test_orphans_are_errors() {
        let mut dataset = dataset();
        dataset.sessions.insert(
            "ghost".into(),
            vec![Session {
                id: "s9".into(),
                ..Default::default()
            }],
        );
        let findings = check_integrity(&dataset);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].is_error());
        assert!(findings[0].message().contains("missing user ghost"));
    }

    #[test]
    fn test_owner_mismatch_and_count_warning() {
        let mut dataset = dataset();
        dataset.users.insert(
            "u2".into(),
            UserProfile {
                id: "u2".into(),
                ..Default::default()
            },
        );
        dataset.sessions.insert(
            "u1".into(),
            vec![Session {
                id: "s1".into(),
                user_id: "u2".into(),
                ..Default::default()
            }],
        );
        dataset.stats.insert(
            "u1".into(),
            UserStats {
                user_id: "u1".into(),
                total_sessions: 3,
                ..Default::default()
            },
        );

        let findings = check_integrity(&dataset);
        assert!(findings
            .iter()
            .any(|f| matches!(f, IntegrityFinding::OwnerMismatch { .. }) && f.is_error()));
        assert!(findings
            .iter()
            .any(|f| matches!(f, IntegrityFinding::CountMismatch { actual: 1, .. }) && !f.is_error()));
    }
}
