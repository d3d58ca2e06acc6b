//! Statistics read-merge.

use crate::model::{parse_timestamp, UserStats};

/// Merge local and remote statistics for one user.
///
/// The side with the newer `updatedAt` supplies the non-counter fields
/// (local on ties or missing timestamps). Counters take the maximum of both
/// sides so a merge never moves them backwards.
pub fn merge_stats(local: &UserStats, remote: &UserStats) -> UserStats {
    let remote_newer = match (
        local.updated_at.as_deref().and_then(parse_timestamp),
        remote.updated_at.as_deref().and_then(parse_timestamp),
    ) {
        (Some(l), Some(r)) => r > l,
        (None, Some(_)) => true,
        _ => false,
    };

    let mut merged = if remote_newer {
        remote.clone()
    } else {
        local.clone()
    };
    merged.total_sessions = local.total_sessions.max(remote.total_sessions);
    merged.completed_sessions = local.completed_sessions.max(remote.completed_sessions);
    merged.stopped_sessions = local.stopped_sessions.max(remote.stopped_sessions);
    merged.total_focus_minutes = local.total_focus_minutes.max(remote.total_focus_minutes);
    merged.completed_focus_minutes = local
        .completed_focus_minutes
        .max(remote.completed_focus_minutes);
    merged.longest_streak = local.longest_streak.max(remote.longest_streak);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(total: i64, streak: i64, updated_at: Option<&str>) -> UserStats {
        UserStats {
            user_id: "u1".into(),
            total_sessions: total,
            completed_sessions: total,
            current_streak: streak,
            longest_streak: streak,
            updated_at: updated_at.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_counters_never_regress() {
        let local = stats(10, 2, Some("2024-03-01T00:00:00Z"));
        let remote = stats(7, 5, Some("2024-03-02T00:00:00Z"));

        let merged = merge_stats(&local, &remote);
        assert_eq!(merged.total_sessions, 10);
        assert_eq!(merged.longest_streak, 5);
        // Newer remote supplies the current streak
        assert_eq!(merged.current_streak, 5);
        assert_eq!(merged.updated_at.as_deref(), Some("2024-03-02T00:00:00Z"));
    }

    #[test]
    fn test_local_wins_without_timestamps() {
        let local = stats(3, 1, None);
        let remote = stats(2, 4, None);
        let merged = merge_stats(&local, &remote);
        assert_eq!(merged.current_streak, 1);
        assert_eq!(merged.total_sessions, 3);
        assert_eq!(merged.longest_streak, 4);
    }

    #[test]
    fn test_timestamped_remote_beats_untimestamped_local() {
        let local = stats(3, 1, None);
        let remote = stats(3, 2, Some("2024-03-02T00:00:00Z"));
        assert_eq!(merge_stats(&local, &remote).current_streak, 2);
    }
}
