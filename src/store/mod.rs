//! Storage collaborators
//!
//! The engine talks to three stores: the local key-value namespace it
//! migrates from, the remote relational store it migrates into, and a sink
//! that keeps exported backup copies.

pub mod keys;
pub mod local;
pub mod remote;
pub mod sink;

pub use local::{write_dataset, FileKvStore, KeyValueStore, KeyValueStoreExt, MemoryKvStore};
pub use remote::{
    BulkOutcome, ChangeEvent, ChangeKind, MemoryRemoteStore, RemoteQuery, RemoteStore,
    RemoteTable,
};
pub use sink::{BackupSink, DirectorySink, MemorySink};
