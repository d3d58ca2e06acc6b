//! Migration Manager
//!
//! Ordered, resumable transfer of the local dataset into the remote store.
//!
//! # Features
//!
//! - Persisted step status with monotonic progress
//! - Batched per-user transfer with skip-and-report failures
//! - Dry runs that stop before the first remote write
//! - Post-transfer remote verification
//!
//! # Example
//!
//! ```ignore
//! use kvshift::migration::{MigrationManager, MigrationOptions};
//!
//! let manager = MigrationManager::new(ctx, recovery, validation);
//! let report = manager.start(MigrationOptions::default()).await?;
//! println!("{}", report.summary());
//! ```

pub mod manager;
pub mod progress;
pub mod verify;

pub use manager::{MigrationManager, MigrationOptions};
pub use progress::{
    MigrationOutcome, MigrationReport, NoopReporter, ProgressReporter, StepPhase, StepProgress,
    TransferSnapshot, TransferTracker, UserFailure,
};
pub use verify::{expected_rows, verify_remote, CountCheck, VerificationReport};
