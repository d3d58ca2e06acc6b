//! Error types for kvshift
//!
//! Every engine component reports failures through [`MigrationError`]. The
//! first six variants form the run-level taxonomy (configuration, validation,
//! transfer, integrity, backup, conflict); the rest describe store and
//! runtime failures that get wrapped into one of them at the orchestrator.

use std::io;
use thiserror::Error;

/// Main error type for migration and recovery operations
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Missing or invalid required parameters. Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Dataset failed validation before any remote write
    #[error("validation error: {0}")]
    Validation(String),

    /// A single record failed to transfer to the remote store
    #[error("transfer error for user {user_id}: {message}")]
    Transfer {
        /// Owner of the record that failed
        user_id: String,
        /// Remote failure detail
        message: String,
    },

    /// Post-migration integrity check found orphans or mismatches
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Backup creation, checksum or restore failure
    #[error("backup error: {0}")]
    Backup(String),

    /// Conflict that cannot be resolved without user input
    #[error("conflict error: {0}")]
    Conflict(String),

    /// Local key-value store failure
    #[error("store error: {0}")]
    Store(String),

    /// Remote store is unreachable or rejected the call
    #[error("remote error: {0}")]
    Remote(String),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another operation already holds this user's migration lock
    #[error("migration already in progress for user {0}")]
    UserBusy(String),

    /// Another migration operation is already running
    #[error("a migration operation is already running")]
    AlreadyRunning,

    /// Backup, snapshot or user not found
    #[error("not found: {0}")]
    NotFound(String),
}

impl MigrationError {
    /// Stable machine-readable name of the error category
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Validation(_) => "validation_error",
            Self::Transfer { .. } => "transfer_error",
            Self::Integrity(_) => "integrity_error",
            Self::Backup(_) => "backup_error",
            Self::Conflict(_) => "conflict_error",
            Self::Store(_) => "store_error",
            Self::Remote(_) => "remote_error",
            Self::Serialization(_) => "serialization_error",
            Self::Io(_) => "io_error",
            Self::UserBusy(_) => "user_busy",
            Self::AlreadyRunning => "already_running",
            Self::NotFound(_) => "not_found",
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transfer { .. } | Self::Remote(_) | Self::UserBusy(_))
    }
}

/// Result type alias for migration operations
pub type Result<T> = std::result::Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::Transfer {
            user_id: "u1".to_string(),
            message: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "transfer error for user u1: timeout");
        assert_eq!(
            MigrationError::AlreadyRunning.to_string(),
            "a migration operation is already running"
        );
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(
            MigrationError::Conflict("x".into()).kind(),
            "conflict_error"
        );
        assert_eq!(MigrationError::Backup("x".into()).kind(), "backup_error");
    }

    #[test]
    fn test_recoverable() {
        assert!(MigrationError::Remote("down".into()).is_recoverable());
        assert!(!MigrationError::Validation("bad".into()).is_recoverable());
        assert!(!MigrationError::Integrity("orphan".into()).is_recoverable());
    }

    #[test]
    fn test_from_serde() {
        let err: MigrationError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind(), "serialization_error");
    }
}
