//! Backup format
//!
//! A [`Backup`] is an immutable copy of the application namespace (or, for
//! verification, of the remote tables). Entries are stored verbatim as the
//! raw strings read from the store so a restore writes back exactly what was
//! captured. The payload is optionally gzip-compressed and the checksum is a
//! CRC-32 over the canonical JSON encoding of the uncompressed entries.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{MigrationError, Result};
use crate::store::keys::{self, USERS_KEY};
use crate::store::remote::RemoteTable;

/// Prefix of backup files written to a sink
const FILE_PREFIX: &str = "kvshift-backup-";
/// Suffix of backup files written to a sink
const FILE_SUFFIX: &str = ".json";

/// Where a backup was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupSource {
    /// The local key-value namespace
    Local,
    /// The remote tables
    Remote,
}

impl std::fmt::Display for BackupSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Full backup or ring-buffered snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Explicit full backup
    Full,
    /// Event-triggered snapshot
    Snapshot,
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Backup payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "payload", rename_all = "lowercase")]
pub enum BackupData {
    /// Entries stored as-is
    Plain(BTreeMap<String, String>),
    /// Base64 of gzip-compressed canonical JSON
    Compressed(String),
}

/// Options for a full backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOptions {
    /// Embed the current snapshot ring in the backup file
    pub include_snapshots: bool,
    /// Gzip the payload
    pub compress: bool,
    /// Compute a checksum
    pub checksum: bool,
    /// Write a copy to the backup sink
    pub export_copy: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            include_snapshots: false,
            compress: true,
            checksum: true,
            export_copy: true,
        }
    }
}

/// An immutable namespace copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    /// Unique id
    pub id: String,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Where the entries came from
    pub source: BackupSource,
    /// Full backup or snapshot
    pub kind: BackupKind,
    /// Event that triggered a snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Captured entries
    pub data: BackupData,
    /// CRC-32 of the uncompressed entries, lowercase hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Whether `data` is compressed
    pub compressed: bool,
    /// Number of captured entries
    pub entry_count: usize,
    /// Users present in the captured index
    #[serde(default)]
    pub user_ids: Vec<String>,
    /// Snapshot ring at capture time, when requested
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<Backup>,
}

impl Backup {
    /// Build a backup from raw entries
    pub fn capture(
        source: BackupSource,
        kind: BackupKind,
        entries: BTreeMap<String, String>,
        compress: bool,
        checksum: bool,
    ) -> Result<Self> {
        let user_ids = match source {
            BackupSource::Local => entries
                .get(USERS_KEY)
                .map(|raw| index_user_ids(raw))
                .unwrap_or_default(),
            BackupSource::Remote => entries
                .get(&RemoteTable::Users.to_string())
                .map(|raw| index_user_ids(raw))
                .unwrap_or_default(),
        };
        let checksum = if checksum {
            Some(compute_checksum(&entries)?)
        } else {
            None
        };
        let entry_count = entries.len();
        let data = if compress {
            BackupData::Compressed(compress_entries(&entries)?)
        } else {
            BackupData::Plain(entries)
        };

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source,
            kind,
            event: None,
            description: None,
            data,
            checksum,
            compressed: compress,
            entry_count,
            user_ids,
            snapshots: Vec::new(),
        })
    }

    /// Attach the triggering event
    pub fn with_event(mut self, event: impl Into<String>, description: Option<String>) -> Self {
        self.event = Some(event.into());
        self.description = description;
        self
    }

    /// Decode the captured entries
    pub fn entries(&self) -> Result<BTreeMap<String, String>> {
        match &self.data {
            BackupData::Plain(entries) => Ok(entries.clone()),
            BackupData::Compressed(encoded) => decompress_entries(encoded),
        }
    }

    /// Check the payload decodes, the checksum matches and the shape is sane
    pub fn validate(&self) -> BackupValidation {
        let mut issues = Vec::new();

        let entries = match self.entries() {
            Ok(entries) => entries,
            Err(e) => {
                return BackupValidation {
                    valid: false,
                    issues: vec![format!("payload cannot be decoded: {e}")],
                }
            }
        };

        if let Some(expected) = &self.checksum {
            match compute_checksum(&entries) {
                Ok(actual) if &actual == expected => {}
                Ok(actual) => issues.push(format!(
                    "checksum mismatch: expected {expected}, computed {actual}"
                )),
                Err(e) => issues.push(format!("checksum cannot be computed: {e}")),
            }
        }

        if entries.len() != self.entry_count {
            issues.push(format!(
                "entry count mismatch: header says {}, payload has {}",
                self.entry_count,
                entries.len()
            ));
        }

        match self.source {
            BackupSource::Local => {
                if let Some(key) = entries.keys().find(|k| !keys::is_app_key(k)) {
                    issues.push(format!("unexpected key outside the application namespace: {key}"));
                }
                if !self.user_ids.is_empty() {
                    match entries.get(USERS_KEY) {
                        Some(raw) if index_user_ids(raw) == self.user_ids => {}
                        Some(_) => issues.push("user index does not match the header".to_string()),
                        None => issues.push("user index is missing".to_string()),
                    }
                }
            }
            BackupSource::Remote => {
                for table in RemoteTable::ALL {
                    if !entries.contains_key(&table.to_string()) {
                        issues.push(format!("table {table} is missing"));
                    }
                }
            }
        }

        BackupValidation {
            valid: issues.is_empty(),
            issues,
        }
    }

    /// Summary for listings
    pub fn info(&self) -> BackupInfo {
        BackupInfo {
            id: self.id.clone(),
            timestamp: self.timestamp,
            source: self.source,
            kind: self.kind,
            event: self.event.clone(),
            description: self.description.clone(),
            entry_count: self.entry_count,
            user_count: self.user_ids.len(),
            compressed: self.compressed,
            has_checksum: self.checksum.is_some(),
        }
    }

    /// Encode for a backup sink
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode from a backup sink
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| MigrationError::Backup(format!("corrupt backup file: {e}")))
    }
}

/// Outcome of [`Backup::validate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupValidation {
    /// No issues found
    pub valid: bool,
    /// What is wrong
    pub issues: Vec<String>,
}

/// Backup listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Backup id
    pub id: String,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Source
    pub source: BackupSource,
    /// Kind
    pub kind: BackupKind,
    /// Triggering event
    pub event: Option<String>,
    /// Description
    pub description: Option<String>,
    /// Number of entries
    pub entry_count: usize,
    /// Number of users captured
    pub user_count: usize,
    /// Whether compressed
    pub compressed: bool,
    /// Whether a checksum is present
    pub has_checksum: bool,
}

/// CRC-32 of the canonical JSON encoding of `entries`
pub fn compute_checksum(entries: &BTreeMap<String, String>) -> Result<String> {
    let canonical = serde_json::to_vec(entries)?;
    Ok(format!("{:08x}", crc32fast::hash(&canonical)))
}

fn compress_entries(entries: &BTreeMap<String, String>) -> Result<String> {
    let raw = serde_json::to_vec(entries)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .map_err(|e| MigrationError::Backup(format!("compression failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| MigrationError::Backup(format!("compression failed: {e}")))?;
    Ok(BASE64.encode(compressed))
}

fn decompress_entries(encoded: &str) -> Result<BTreeMap<String, String>> {
    let compressed = BASE64
        .decode(encoded)
        .map_err(|e| MigrationError::Backup(format!("invalid base64 payload: {e}")))?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| MigrationError::Backup(format!("decompression failed: {e}")))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// User ids in a raw users index (object keyed by id, or array of profiles)
pub fn index_user_ids(raw: &str) -> Vec<String> {
    let mut ids: Vec<String> = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(index)) => index.keys().cloned().collect(),
        Ok(Value::Array(list)) => list
            .iter()
            .filter_map(|entry| match entry {
                Value::String(id) => Some(id.clone()),
                other => other.get("id").and_then(Value::as_str).map(str::to_string),
            })
            .collect(),
        _ => Vec::new(),
    };
    ids.sort();
    ids.dedup();
    ids
}

/// File name of a backup in a sink
pub fn sink_file_name(id: &str) -> String {
    format!("{FILE_PREFIX}{id}{FILE_SUFFIX}")
}

/// Backup id encoded in a sink file name
pub fn parse_sink_file_name(name: &str) -> Option<&str> {
    name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entries() -> BTreeMap<String, String> {
        let mut entries = BTreeMap::new();
        entries.insert(
            USERS_KEY.to_string(),
            r#"{"u1":{"id":"u1"},"u2":{"id":"u2"}}"#.to_string(),
        );
        entries.insert(keys::sessions_key("u1"), "[]".to_string());
        entries
    }

    #[test]
    fn test_capture_compressed() {
        let backup =
            Backup::capture(BackupSource::Local, BackupKind::Full, entries(), true, true).unwrap();
        assert!(backup.compressed);
        assert!(matches!(backup.data, BackupData::Compressed(_)));
        assert_eq!(backup.entries().unwrap(), entries());
        assert_eq!(backup.user_ids, vec!["u1", "u2"]);
        assert_eq!(backup.checksum.as_ref().map(String::len), Some(8));
        assert!(backup.validate().valid);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut backup =
            Backup::capture(BackupSource::Local, BackupKind::Full, entries(), false, true).unwrap();
        if let BackupData::Plain(entries) = &mut backup.data {
            entries.insert(keys::sessions_key("u1"), r#"[{"id":"s1"}]"#.to_string());
        }
        let validation = backup.validate();
        assert!(!validation.valid);
        assert!(validation.issues[0].contains("checksum mismatch"));
    }

    #[test]
    fn test_engine_keys_rejected() {
        let mut raw = entries();
        raw.insert(keys::STATUS_KEY.to_string(), "{}".to_string());
        let backup =
            Backup::capture(BackupSource::Local, BackupKind::Full, raw, false, false).unwrap();
        assert!(!backup.validate().valid);
    }

    #[test]
    fn test_file_bytes() {
        let backup = Backup::capture(BackupSource::Local, BackupKind::Snapshot, entries(), true, true)
            .unwrap()
            .with_event("pre_rollback", Some("before restore".into()));
        let decoded = Backup::from_bytes(&backup.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, backup);
        assert!(Backup::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_sink_file_names() {
        let name = sink_file_name("abc");
        assert_eq!(name, "kvshift-backup-abc.json");
        assert_eq!(parse_sink_file_name(&name), Some("abc"));
        assert_eq!(parse_sink_file_name("other.json"), None);
    }

    #[test]
    fn test_index_user_ids_array_form() {
        let ids = index_user_ids(r#"[{"id":"b"},"a",{"name":"x"}]"#);
        assert_eq!(ids, vec!["a", "b"]);
        assert!(index_user_ids("garbage").is_empty());
    }
}
