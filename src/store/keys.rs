//! Local key scheme
//!
//! Application records live under the `app:` prefix, one key per section
//! per user. Engine bookkeeping lives under `kvshift:` and is never part of
//! a backup's restorable data.

/// Prefix shared by every application key
pub const APP_PREFIX: &str = "app:";
/// Prefix shared by every engine-owned key
pub const ENGINE_PREFIX: &str = "kvshift:";

/// User index: object of user id to profile
pub const USERS_KEY: &str = "app:users";
/// Id of the user currently signed in
pub const CURRENT_USER_KEY: &str = "app:current_user";

/// Persisted migration status
pub const STATUS_KEY: &str = "kvshift:status";
/// Per-user migration status map
pub const USER_STATUS_KEY: &str = "kvshift:user_status";
/// Most recent full backup
pub const LATEST_BACKUP_KEY: &str = "kvshift:latest_backup";
/// Index of every full backup taken
pub const BACKUP_INDEX_KEY: &str = "kvshift:backup_index";
/// Snapshot ring buffer
pub const SNAPSHOTS_KEY: &str = "kvshift:snapshots";
/// Bounded textual log
pub const JOURNAL_KEY: &str = "kvshift:log";
/// Deferred remote operations
pub const SYNC_QUEUE_KEY: &str = "kvshift:sync_queue";
/// Hybrid mode flag
pub const HYBRID_KEY: &str = "kvshift:hybrid";
/// Summary of the last finished run
pub const LAST_RUN_KEY: &str = "kvshift:last_run";

const SESSIONS_PREFIX: &str = "app:sessions:";
const STATS_PREFIX: &str = "app:stats:";
const MEETINGS_PREFIX: &str = "app:meetings:";
const ACTIVE_SESSION_PREFIX: &str = "app:active_session:";

/// Key holding a user's session list
pub fn sessions_key(user_id: &str) -> String {
    format!("{SESSIONS_PREFIX}{user_id}")
}

/// Key holding a user's statistics
pub fn stats_key(user_id: &str) -> String {
    format!("{STATS_PREFIX}{user_id}")
}

/// Key holding a user's meeting list
pub fn meetings_key(user_id: &str) -> String {
    format!("{MEETINGS_PREFIX}{user_id}")
}

/// Key holding a user's running session
pub fn active_session_key(user_id: &str) -> String {
    format!("{ACTIVE_SESSION_PREFIX}{user_id}")
}

/// Every per-user section key for `user_id`
pub fn user_section_keys(user_id: &str) -> [String; 4] {
    [
        sessions_key(user_id),
        stats_key(user_id),
        meetings_key(user_id),
        active_session_key(user_id),
    ]
}

/// Whether a key belongs to the application namespace
pub fn is_app_key(key: &str) -> bool {
    key.starts_with(APP_PREFIX)
}

/// Whether a key is engine bookkeeping
pub fn is_engine_key(key: &str) -> bool {
    key.starts_with(ENGINE_PREFIX)
}

/// Classification of a store key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    /// The user index
    UserIndex,
    /// The signed-in user marker
    CurrentUser,
    /// Sessions of a user
    Sessions(String),
    /// Statistics of a user
    Stats(String),
    /// Meetings of a user
    Meetings(String),
    /// Running session of a user
    ActiveSession(String),
    /// Engine bookkeeping
    Engine,
    /// Anything else
    Unknown,
}

impl KeyKind {
    /// Owner of a per-user section key
    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::Sessions(uid)
            | Self::Stats(uid)
            | Self::Meetings(uid)
            | Self::ActiveSession(uid) => Some(uid),
            _ => None,
        }
    }
}

/// Classify a key by the scheme above
pub fn classify(key: &str) -> KeyKind {
    let owned = |prefix: &str| {
        key.strip_prefix(prefix)
            .filter(|uid| !uid.is_empty())
            .map(str::to_string)
    };

    if key == USERS_KEY {
        KeyKind::UserIndex
    } else if key == CURRENT_USER_KEY {
        KeyKind::CurrentUser
    } else if let Some(uid) = owned(SESSIONS_PREFIX) {
        KeyKind::Sessions(uid)
    } else if let Some(uid) = owned(STATS_PREFIX) {
        KeyKind::Stats(uid)
    } else if let Some(uid) = owned(MEETINGS_PREFIX) {
        KeyKind::Meetings(uid)
    } else if let Some(uid) = owned(ACTIVE_SESSION_PREFIX) {
        KeyKind::ActiveSession(uid)
    } else if is_engine_key(key) {
        KeyKind::Engine
    } else {
        KeyKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("app:users"), KeyKind::UserIndex);
        assert_eq!(classify("app:current_user"), KeyKind::CurrentUser);
        assert_eq!(classify("app:sessions:u1"), KeyKind::Sessions("u1".into()));
        assert_eq!(classify("app:stats:u1"), KeyKind::Stats("u1".into()));
        assert_eq!(classify("app:meetings:u1"), KeyKind::Meetings("u1".into()));
        assert_eq!(
            classify("app:active_session:u1"),
            KeyKind::ActiveSession("u1".into())
        );
        assert_eq!(classify("kvshift:status"), KeyKind::Engine);
        assert_eq!(classify("app:sessions:"), KeyKind::Unknown);
        assert_eq!(classify("theme"), KeyKind::Unknown);
    }

    #[test]
    fn test_owner() {
        assert_eq!(classify(&stats_key("abc")).owner(), Some("abc"));
        assert_eq!(classify(USERS_KEY).owner(), None);
    }
}
