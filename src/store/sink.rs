//! Backup file sinks
//!
//! A sink receives a retrievable copy of every exported backup.
//! [`DirectorySink`] writes files under a base directory; [`MemorySink`]
//! keeps them in memory.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs;
use tracing::debug;

use crate::error::{MigrationError, Result};

/// Destination for backup file copies
#[async_trait]
pub trait BackupSink: Send + Sync {
    /// Store a blob under `name`
    async fn store(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Retrieve a blob
    async fn retrieve(&self, name: &str) -> Result<Bytes>;

    /// List stored names
    async fn list(&self) -> Result<Vec<String>>;
}

/// Sink writing into a directory
pub struct DirectorySink {
    base_dir: PathBuf,
}

impl DirectorySink {
    /// Create a sink rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn file_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(MigrationError::Backup(format!("invalid backup file name: {name}")));
        }
        Ok(self.base_dir.join(name))
    }
}

#[async_trait]
impl BackupSink for DirectorySink {
    async fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.file_path(name)?;
        fs::create_dir_all(&self.base_dir).await?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, data).await?;
        fs::rename(&temp_path, &path).await?;
        debug!(path = ?path, size = data.len(), "backup file written");
        Ok(())
    }

    async fn retrieve(&self, name: &str) -> Result<Bytes> {
        let path = self.file_path(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MigrationError::NotFound(format!("backup file {name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".tmp") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// In-memory sink
#[derive(Default)]
pub struct MemorySink {
    files: Mutex<BTreeMap<String, Bytes>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupSink for MemorySink {
    async fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        self.files
            .lock()
            .insert(name.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn retrieve(&self, name: &str) -> Result<Bytes> {
        self.files
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| MigrationError::NotFound(format!("backup file {name}")))
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.files.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_directory_sink() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path().join("backups"));

        assert!(sink.list().await.unwrap().is_empty());
        sink.store("b1.json", b"{}").await.unwrap();
        sink.store("b2.json", b"[]").await.unwrap();

        assert_eq!(sink.list().await.unwrap(), vec!["b1.json", "b2.json"]);
        assert_eq!(&sink.retrieve("b2.json").await.unwrap()[..], b"[]");
        assert!(matches!(
            sink.retrieve("missing.json").await,
            Err(MigrationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_sink_rejects_paths() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path());
        assert!(sink.store("../escape", b"x").await.is_err());
        assert!(sink.store("", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.store("a", b"1").await.unwrap();
        assert_eq!(&sink.retrieve("a").await.unwrap()[..], b"1");
        assert_eq!(sink.list().await.unwrap(), vec!["a"]);
    }
}
