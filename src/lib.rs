//! # kvshift
//!
//! Migration and recovery engine for moving one user's application data
//! from a local key-value store into a remote relational store without
//! losing anything on the way.
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`extractor`] | Scans and exports the local namespace |
//! | [`validator`] | Structural, schema, business-rule and integrity checks |
//! | [`recovery`] | Backups, snapshots, full and per-user rollback |
//! | [`migration`] | Ordered, resumable transfer to the remote store |
//! | [`hybrid`] | Dual-store writes and the deferred sync queue |
//! | [`orchestrator`] | Strategies, health checks and the event feed |
//! | [`store`] | Local, remote and backup storage interfaces |
//! | [`state`] | Persisted run status, user status, journal and locks |
//!
//! ## Quick Start
//!
//! ```ignore
//! use kvshift::{Config, MigrationRequest, Orchestrator};
//!
//! let orchestrator = Orchestrator::from_config(Config::default())?;
//! let health = orchestrator.perform_health_check().await;
//! let result = orchestrator.start_migration(MigrationRequest::default()).await;
//! ```

pub mod config;
pub mod error;
pub mod extractor;
pub mod hybrid;
pub mod migration;
pub mod model;
pub mod orchestrator;
pub mod recovery;
pub mod state;
pub mod store;
pub mod validator;

pub use config::Config;
pub use error::{MigrationError, Result};
pub use extractor::{Extraction, Extractor, ScanReport};
pub use hybrid::{HybridManager, UserMigrationOptions, UserMigrationOutcome, WriteOutcome};
pub use migration::{MigrationManager, MigrationOptions, MigrationOutcome, MigrationReport};
pub use model::ExportDataset;
pub use orchestrator::{
    MigrationRequest, MigrationStrategy, OperationResult, Orchestrator, OrchestratorEvent,
};
pub use recovery::{BackupSource, ConflictStrategy, RecoveryManager, RollbackOptions};
pub use state::EngineContext;
pub use validator::{validate_dataset, DatasetValidator, ValidationOptions, ValidationResult};
