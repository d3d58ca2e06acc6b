//! Cross-field business rules
//!
//! Rules run after the schema pass and only see typed records. Each rule
//! has a stable name that appears in validation issues.

use std::collections::HashMap;

use crate::model::{parse_timestamp, Session, UserProfile, UserStats};

/// Every user has a distinct email address
pub const UNIQUE_EMAIL: &str = "unique_email";
/// A session ends after it starts
pub const VALID_TIME_RANGE: &str = "valid_time_range";
/// Completed and stopped sessions carry their matching timestamp
pub const COMPLETION_TIMESTAMP: &str = "completion_timestamp";
/// Completed counters never exceed total counters
pub const COMPLETED_NOT_EXCEEDING_TOTAL: &str = "completed_not_exceeding_total";
/// The longest streak is at least the current streak
pub const STREAK_CONSISTENCY: &str = "streak_consistency";

/// A failed business rule
#[derive(Debug, Clone, PartialEq)]
pub struct RuleFailure {
    /// Rule name
    pub rule: &'static str,
    /// Field the rule is about
    pub field: &'static str,
    /// Description
    pub message: String,
}

impl RuleFailure {
    fn new(rule: &'static str, field: &'static str, message: String) -> Self {
        Self {
            rule,
            field,
            message,
        }
    }
}

/// Users whose email repeats an earlier user's (case-insensitive)
///
/// The first user to claim an address keeps it; every later claimant is
/// reported, paired with the id of the user it collides with.
pub fn duplicate_emails<'a, I>(users: I) -> Vec<(String, RuleFailure)>
where
    I: IntoIterator<Item = &'a UserProfile>,
{
    let mut seen: HashMap<String, &str> = HashMap::new();
    let mut failures = Vec::new();
    for user in users {
        let email = user.email.trim().to_lowercase();
        if email.is_empty() {
            continue;
        }
        match seen.get(&email) {
            Some(first) => failures.push((
                user.id.clone(),
                RuleFailure::new(
                    UNIQUE_EMAIL,
                    "email",
                    format!("email {} is already used by user {}", user.email, first),
                ),
            )),
            None => {
                seen.insert(email, user.id.as_str());
            }
        }
    }
    failures
}

/// Check every session rule
pub fn check_session(session: &Session) -> Vec<RuleFailure> {
    let mut failures = Vec::new();
    failures.extend(valid_time_range(session));
    failures.extend(completion_timestamp(session));
    failures
}

/// The end time, when present, must be strictly after the start time
pub fn valid_time_range(session: &Session) -> Option<RuleFailure> {
    let end = session.end_time.as_deref()?;
    let start = parse_timestamp(&session.start_time)?;
    let end_ts = parse_timestamp(end)?;
    if end_ts <= start {
        return Some(RuleFailure::new(
            VALID_TIME_RANGE,
            "endTime",
            format!(
                "session {} ends at {} which is not after its start {}",
                session.id, end, session.start_time
            ),
        ));
    }
    None
}

/// Completed sessions need `completedAt`; stopped sessions need `stoppedAt`
pub fn completion_timestamp(session: &Session) -> Option<RuleFailure> {
    let missing = |value: &Option<String>| value.as_deref().map_or(true, |v| v.trim().is_empty());

    if session.is_completed() && missing(&session.completed_at) {
        return Some(RuleFailure::new(
            COMPLETION_TIMESTAMP,
            "completedAt",
            format!("completed session {} has no completedAt", session.id),
        ));
    }
    if session.is_stopped() && missing(&session.stopped_at) {
        return Some(RuleFailure::new(
            COMPLETION_TIMESTAMP,
            "stoppedAt",
            format!("stopped session {} has no stoppedAt", session.id),
        ));
    }
    None
}

/// Check every stats rule
pub fn check_stats(stats: &UserStats) -> Vec<RuleFailure> {
    let mut failures = completed_not_exceeding_total(stats);
    failures.extend(streak_consistency(stats));
    failures
}

/// Completed counters never exceed their totals
pub fn completed_not_exceeding_total(stats: &UserStats) -> Vec<RuleFailure> {
    let mut failures = Vec::new();
    if stats.completed_sessions > stats.total_sessions {
        failures.push(RuleFailure::new(
            COMPLETED_NOT_EXCEEDING_TOTAL,
            "completedSessions",
            format!(
                "completedSessions ({}) exceeds totalSessions ({})",
                stats.completed_sessions, stats.total_sessions
            ),
        ));
    }
    if stats.completed_sessions + stats.stopped_sessions > stats.total_sessions {
        failures.push(RuleFailure::new(
            COMPLETED_NOT_EXCEEDING_TOTAL,
            "stoppedSessions",
            format!(
                "completed ({}) plus stopped ({}) sessions exceed totalSessions ({})",
                stats.completed_sessions, stats.stopped_sessions, stats.total_sessions
            ),
        ));
    }
    if stats.completed_focus_minutes > stats.total_focus_minutes {
        failures.push(RuleFailure::new(
            COMPLETED_NOT_EXCEEDING_TOTAL,
            "completedFocusMinutes",
            format!(
                "completedFocusMinutes ({}) exceeds totalFocusMinutes ({})",
                stats.completed_focus_minutes, stats.total_focus_minutes
            ),
        ));
    }
    failures
}

/// `longestStreak >= currentStreak`
pub fn streak_consistency(stats: &UserStats) -> Option<RuleFailure> {
    if stats.longest_streak < stats.current_streak {
        return Some(RuleFailure::new(
            STREAK_CONSISTENCY,
            "longestStreak",
            format!(
                "longestStreak ({}) is shorter than currentStreak ({})",
                stats.longest_streak, stats.current_streak
            ),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(status: &str) -> Session {
        Session {
            id: "s1".into(),
            user_id: "u1".into(),
            start_time: "2024-01-01T10:00:00Z".into(),
            status: status.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_time_range() {
        let mut s = session("active");
        s.end_time = Some("2024-01-01T09:00:00Z".into());
        assert_eq!(valid_time_range(&s).map(|f| f.rule), Some(VALID_TIME_RANGE));

        s.end_time = Some("2024-01-01T10:00:00Z".into());
        assert!(valid_time_range(&s).is_some());

        s.end_time = Some("2024-01-01T10:25:00Z".into());
        assert!(valid_time_range(&s).is_none());

        s.end_time = None;
        assert!(valid_time_range(&s).is_none());
    }

    #[test]
    fn test_completion_timestamp() {
        let mut completed = session("completed");
        assert!(completion_timestamp(&completed).is_some());
        completed.completed_at = Some("2024-01-01T10:25:00Z".into());
        assert!(completion_timestamp(&completed).is_none());

        let mut stopped = session("stopped");
        stopped.completed_at = Some("2024-01-01T10:25:00Z".into());
        assert_eq!(
            completion_timestamp(&stopped).map(|f| f.field),
            Some("stoppedAt")
        );
        stopped.stopped_at = Some("2024-01-01T10:10:00Z".into());
        assert!(check_session(&stopped).is_empty());
    }

    #[test]
    fn test_stats_rules() {
        let stats = UserStats {
            user_id: "u1".into(),
            total_sessions: 5,
            completed_sessions: 6,
            current_streak: 3,
            longest_streak: 2,
            ..Default::default()
        };
        let failures = check_stats(&stats);
        assert!(failures.iter().any(|f| f.rule == COMPLETED_NOT_EXCEEDING_TOTAL));
        assert!(failures.iter().any(|f| f.rule == STREAK_CONSISTENCY));

        let ok = UserStats {
            total_sessions: 5,
            completed_sessions: 3,
            stopped_sessions: 2,
            current_streak: 1,
            longest_streak: 4,
            ..Default::default()
        };
        assert!(check_stats(&ok).is_empty());
    }

    #[test]
    fn test_duplicate_emails() {
        let users = [
            UserProfile {
                id: "u1".into(),
                email: "Ada@example.com".into(),
                ..Default::default()
            },
            UserProfile {
                id: "u2".into(),
                email: "ada@example.com".into(),
                ..Default::default()
            },
            UserProfile {
                id: "u3".into(),
                email: "bob@example.com".into(),
                ..Default::default()
            },
        ];
        let dupes = duplicate_emails(users.iter());
        assert_eq!(dupes.len(), 1);
        assert_eq!(dupes[0].0, "u2");
        assert!(dupes[0].1.message.contains("u1"));
    }
}
