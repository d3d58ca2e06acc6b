//! Configuration for kvshift
//!
//! Configuration is loaded from a TOML file. Every section has defaults, so
//! an empty file (or no file at all) yields a working configuration.
//!
//! # Example
//!
//! ```toml
//! [logging]
//! level = "debug"
//! format = "json"
//!
//! [migration]
//! batch_size = 20
//!
//! [hybrid]
//! max_attempts = 5
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Local, remote and backup storage locations
    pub storage: StorageConfig,
    /// Migration run configuration
    pub migration: MigrationConfig,
    /// Validator configuration
    pub validation: ValidationConfig,
    /// Backup and snapshot configuration
    pub recovery: RecoveryConfig,
    /// Hybrid mode configuration
    pub hybrid: HybridConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::Configuration(format!(
                "failed to read config file {:?}: {}",
                path, e
            ))
        })?;

        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| MigrationError::Configuration(format!("failed to parse config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.migration.batch_size == 0 || self.migration.fast_batch_size == 0 {
            return Err(MigrationError::Configuration(
                "migration batch sizes must be greater than 0".to_string(),
            ));
        }

        if self.validation.batch_size == 0 {
            return Err(MigrationError::Configuration(
                "validation batch_size must be greater than 0".to_string(),
            ));
        }

        if self.validation.max_errors == 0 {
            return Err(MigrationError::Configuration(
                "validation max_errors must be greater than 0".to_string(),
            ));
        }

        if self.recovery.max_snapshots == 0 {
            return Err(MigrationError::Configuration(
                "recovery max_snapshots must be greater than 0".to_string(),
            ));
        }

        if self.hybrid.max_attempts == 0 {
            return Err(MigrationError::Configuration(
                "hybrid max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.hybrid.sync_interval_secs == 0 {
            return Err(MigrationError::Configuration(
                "hybrid sync_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.storage.journal_max_entries == 0 {
            return Err(MigrationError::Configuration(
                "storage journal_max_entries must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).map_err(|e| {
            MigrationError::Configuration(format!("failed to serialize config: {}", e))
        })?;

        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, toml_str).map_err(|e| {
            MigrationError::Configuration(format!("failed to write temp config file: {}", e))
        })?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            MigrationError::Configuration(format!("failed to rename config file: {}", e))
        })?;

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format
    pub format: LogFormat,
    /// Log file path (optional)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,
    /// JSON format
    Json,
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file backing the local key-value store
    pub local_path: PathBuf,
    /// JSON file backing the remote store
    pub remote_path: PathBuf,
    /// Directory receiving exported backup copies
    pub backup_dir: PathBuf,
    /// Maximum entries kept in the persisted migration log
    pub journal_max_entries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_path: PathBuf::from("./data/local.json"),
            remote_path: PathBuf::from("./data/remote.json"),
            backup_dir: PathBuf::from("./data/backups"),
            journal_max_entries: 500,
        }
    }
}

/// Migration run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Users per batch for the safe strategy
    pub batch_size: usize,
    /// Users per batch for the fast strategy
    pub fast_batch_size: usize,
    /// Continue even if export validation fails
    pub ignore_validation_errors: bool,
    /// Enable hybrid mode after a successful safe migration
    pub enable_hybrid_after: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            fast_batch_size: 50,
            ignore_validation_errors: false,
            enable_hybrid_after: false,
        }
    }
}

/// Validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Records validated per batch
    pub batch_size: usize,
    /// Stop recording errors after this many
    pub max_errors: usize,
    /// Record count above which batching is recommended
    pub large_dataset_threshold: usize,
    /// Treat warnings as errors
    pub strict: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_errors: 1000,
            large_dataset_threshold: 1000,
            strict: false,
        }
    }
}

/// Backup and snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Snapshot ring buffer capacity
    pub max_snapshots: usize,
    /// Gzip full backups
    pub compress: bool,
    /// Compute CRC-32 checksums for backups
    pub checksum: bool,
    /// Write a file copy of each full backup to the backup sink
    pub export_copies: bool,
    /// Take a snapshot before every rollback so it can be undone
    pub snapshot_before_rollback: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 10,
            compress: true,
            checksum: true,
            export_copies: true,
            snapshot_before_rollback: true,
        }
    }
}

/// Hybrid mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    /// Seconds between sync queue drains
    pub sync_interval_secs: u64,
    /// Attempts before a queued operation is permanently failed
    pub max_attempts: u32,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 30,
            max_attempts: 3,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.migration.batch_size, 10);
        assert_eq!(config.recovery.max_snapshots, 10);
        assert_eq!(config.hybrid.max_attempts, 3);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
            [logging]
            level = "debug"
            format = "json"

            [migration]
            batch_size = 25

            [hybrid]
            max_attempts = 5
        "#;

        let config = Config::parse_str(toml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.migration.batch_size, 25);
        assert_eq!(config.migration.fast_batch_size, 50);
        assert_eq!(config.hybrid.max_attempts, 5);
    }

    #[test]
    fn test_parse_invalid() {
        let err = Config::parse_str("[migration]\nbatch_size = \"ten\"").unwrap_err();
        assert!(matches!(err, MigrationError::Configuration(_)));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut config = Config::default();
        config.migration.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.hybrid.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.recovery.max_snapshots = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvshift.toml");

        let mut config = Config::default();
        config.validation.max_errors = 42;
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.validation.max_errors, 42);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/kvshift.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
