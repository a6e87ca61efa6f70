//! Data models for library synchronization
//!
//! - `FileRecord`: one file or directory, local or remote
//! - `ChangeEvent`: an immutable description of one mutation
//! - `SyncState`: the coordinator's published state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One file or directory in a library
///
/// `relative_path` uses POSIX separators and is unique within a library
/// root. `content_hash` is absent for directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(rename = "path")]
    pub relative_path: String,

    #[serde(rename = "isDirectory", default)]
    pub is_directory: bool,

    #[serde(default)]
    pub size: u64,

    #[serde(rename = "modifiedTime", default)]
    pub modified_time: DateTime<Utc>,

    #[serde(rename = "hash", default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl FileRecord {
    /// Create a record for a regular file
    pub fn file(
        relative_path: impl Into<String>,
        size: u64,
        modified_time: DateTime<Utc>,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            is_directory: false,
            size,
            modified_time,
            content_hash: Some(content_hash.into()),
        }
    }

    /// Create a record for a directory
    pub fn directory(relative_path: impl Into<String>, modified_time: DateTime<Utc>) -> Self {
        Self {
            relative_path: relative_path.into(),
            is_directory: true,
            size: 0,
            modified_time,
            content_hash: None,
        }
    }

    /// Create a path-only record, as carried by deletions
    pub fn deleted(relative_path: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            is_directory: false,
            size: 0,
            modified_time: Utc::now(),
            content_hash: None,
        }
    }

    /// Check whether this record has the given content hash
    pub fn has_hash(&self, hash: &str) -> bool {
        self.content_hash.as_deref() == Some(hash)
    }
}

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "create")]
    Created,
    #[serde(rename = "update")]
    Updated,
    #[serde(rename = "delete")]
    Deleted,
}

/// A single change to one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: FileRecord,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, record: FileRecord) -> Self {
        Self { kind, record }
    }

    pub fn deleted(relative_path: impl Into<String>) -> Self {
        Self::new(ChangeKind::Deleted, FileRecord::deleted(relative_path))
    }

    pub fn path(&self) -> &str {
        &self.record.relative_path
    }
}

/// Synchronization phase of a library root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    OutOfSync,
    Synchronizing,
    Synchronized,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SyncPhase::OutOfSync => "out of sync",
            SyncPhase::Synchronizing => "synchronizing",
            SyncPhase::Synchronized => "synchronized",
        };
        f.write_str(label)
    }
}

/// Published state of one library root
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub phase: SyncPhase,
    /// Set only on a transition into `Synchronized`
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Display-level description of the most recent failure
    pub last_error: Option<String>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            phase: SyncPhase::OutOfSync,
            last_synced_at: None,
            last_error: None,
        }
    }
}

impl SyncState {
    /// Move to a new phase, stamping `last_synced_at` on entry to `Synchronized`
    pub fn transition(&mut self, phase: SyncPhase) -> bool {
        if self.phase == phase {
            return false;
        }
        self.phase = phase;
        if phase == SyncPhase::Synchronized {
            self.last_synced_at = Some(Utc::now());
            self.last_error = None;
        }
        true
    }
}
