//! Conflict resolution
//!
//! A conflict is a path whose content differs on both sides while the
//! modification times do not say which side is newer. The engine asks a
//! `ConflictDecider` for a `Resolution` and applies it; the decider may be
//! a fixed policy or any front end answering requests from a
//! `ConflictPort`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::SyncResult;
use crate::library::LocalEntry;
use crate::models::FileRecord;
use crate::transfer::TransferClient;

/// Marker inserted into the name of a preserved local copy
pub const CONFLICT_MARKER: &str = "conflict";

/// What the decision-maker is shown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub path: String,
    pub local_modified: DateTime<Utc>,
    pub remote_modified: DateTime<Utc>,
    pub local_size: u64,
    pub remote_size: u64,
    #[serde(skip)]
    pub remote: FileRecord,
}

impl Conflict {
    pub fn new(local: &LocalEntry, remote: &FileRecord) -> Self {
        Self {
            path: local.relative_path.clone(),
            local_modified: local.modified_time,
            remote_modified: remote.modified_time,
            local_size: local.size,
            remote_size: remote.size,
            remote: remote.clone(),
        }
    }
}

/// How to settle a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Upload local content over the remote
    KeepLocal,
    /// Download remote content over the local file
    KeepRemote,
    /// Preserve the local file under a conflict name, then download
    KeepBoth,
}

/// Decision port for conflicts
///
/// Returning `None` leaves the file out of sync.
#[async_trait]
pub trait ConflictDecider: Send + Sync {
    async fn decide(&self, conflict: &Conflict) -> Option<Resolution>;
}

/// Answers every conflict the same way
#[derive(Debug, Clone, Copy)]
pub struct FixedPolicy(pub Resolution);

#[async_trait]
impl ConflictDecider for FixedPolicy {
    async fn decide(&self, _conflict: &Conflict) -> Option<Resolution> {
        Some(self.0)
    }
}

/// A pending decision handed to a front end
#[derive(Debug)]
pub struct ConflictRequest {
    pub conflict: Conflict,
    responder: oneshot::Sender<Resolution>,
}

impl ConflictRequest {
    /// Answer the request; ignored if the engine stopped waiting
    pub fn respond(self, resolution: Resolution) {
        let _ = self.responder.send(resolution);
    }
}

/// Channel-backed decider
///
/// Each conflict is sent as a `ConflictRequest` to the receiver returned by
/// `conflict_port`. Dropping a request without answering leaves the conflict
/// unresolved.
#[derive(Debug, Clone)]
pub struct ConflictPort {
    request_tx: mpsc::Sender<ConflictRequest>,
}

/// Create a decision port and the receiver a front end should drain
pub fn conflict_port(buffer: usize) -> (ConflictPort, mpsc::Receiver<ConflictRequest>) {
    let (request_tx, request_rx) = mpsc::channel(buffer);
    (ConflictPort { request_tx }, request_rx)
}

#[async_trait]
impl ConflictDecider for ConflictPort {
    async fn decide(&self, conflict: &Conflict) -> Option<Resolution> {
        let (responder, response) = oneshot::channel();
        let request = ConflictRequest {
            conflict: conflict.clone(),
            responder,
        };
        if self.request_tx.send(request).await.is_err() {
            warn!("No conflict handler is listening");
            return None;
        }
        response.await.ok()
    }
}

/// Name of the preserved local copy: `<stem>.conflict.<YYYYMMDDHHMMSS><ext>`
pub fn conflict_copy_path(relative: &str, at: DateTime<Utc>) -> String {
    conflict_copy_path_numbered(relative, at, 0)
}

fn conflict_copy_path_numbered(relative: &str, at: DateTime<Utc>, n: u32) -> String {
    let (dir, name) = match relative.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, relative),
    };

    // A leading dot is part of the stem, not an extension
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };

    let stamp = at.format("%Y%m%d%H%M%S");
    let suffix = if n == 0 {
        String::new()
    } else {
        format!("-{}", n)
    };
    let file = format!("{}.{}.{}{}{}", stem, CONFLICT_MARKER, stamp, suffix, ext);

    match dir {
        Some(dir) => format!("{}/{}", dir, file),
        None => file,
    }
}

/// What carrying out a resolution changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    /// Hash of the remote content written over the conflicted path
    pub written: Option<String>,
    /// Records sent to the server
    pub uploaded: Vec<FileRecord>,
}

/// Carry out a resolution
pub async fn apply_resolution(
    transfer: &TransferClient,
    conflict: &Conflict,
    resolution: Resolution,
) -> SyncResult<Resolved> {
    let mut resolved = Resolved::default();
    match resolution {
        Resolution::KeepLocal => {
            resolved.uploaded.push(transfer.upload(&conflict.path).await?);
        }
        Resolution::KeepRemote => {
            let hash = transfer
                .download(&conflict.path, Some(&conflict.remote))
                .await?;
            resolved.written = Some(hash);
        }
        Resolution::KeepBoth => {
            let library = transfer.library();
            let now = Utc::now();
            let mut n = 0;
            let mut copy_path = conflict_copy_path(&conflict.path, now);
            while library.exists(&copy_path) {
                n += 1;
                copy_path = conflict_copy_path_numbered(&conflict.path, now, n);
            }

            library.copy(&conflict.path, &copy_path)?;
            info!("Preserved local {} as {}", conflict.path, copy_path);

            let hash = transfer
                .download(&conflict.path, Some(&conflict.remote))
                .await?;
            resolved.written = Some(hash);

            match transfer.upload(&copy_path).await {
                Ok(record) => resolved.uploaded.push(record),
                Err(e) => warn!("Could not upload conflict copy {}: {}", copy_path, e),
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher;
    use crate::library::LocalLibrary;
    use crate::remote::memory::MemoryRemote;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 9, 8, 7, 6).unwrap()
    }

    #[test]
    fn test_conflict_copy_naming() {
        assert_eq!(
            conflict_copy_path("c.md", stamp()),
            "c.conflict.20240709080706.md"
        );
        assert_eq!(
            conflict_copy_path("notes/deep/c.md", stamp()),
            "notes/deep/c.conflict.20240709080706.md"
        );
        assert_eq!(
            conflict_copy_path("Makefile", stamp()),
            "Makefile.conflict.20240709080706"
        );
        assert_eq!(
            conflict_copy_path(".hidden", stamp()),
            ".hidden.conflict.20240709080706"
        );
        assert_eq!(
            conflict_copy_path("a.tar.gz", stamp()),
            "a.tar.conflict.20240709080706.gz"
        );
        assert_eq!(
            conflict_copy_path_numbered("c.md", stamp(), 2),
            "c.conflict.20240709080706-2.md"
        );
    }

    async fn conflicted(temp_dir: &TempDir) -> (Arc<MemoryRemote>, TransferClient, Conflict) {
        let remote = Arc::new(MemoryRemote::new());
        let transfer = TransferClient::new(LocalLibrary::new(temp_dir.path()), remote.clone());

        transfer
            .library()
            .write_atomic("c.md", b"local version", None)
            .unwrap();
        remote.put_file("c.md", b"remote version", Utc::now());

        let entry = transfer.library().entry("c.md").unwrap().unwrap();
        let conflict = Conflict::new(&entry, &remote.record("c.md").unwrap());
        (remote, transfer, conflict)
    }

    #[tokio::test]
    async fn test_keep_both_preserves_local_content() {
        let temp_dir = TempDir::new().unwrap();
        let (remote, transfer, conflict) = conflicted(&temp_dir).await;

        let resolved = apply_resolution(&transfer, &conflict, Resolution::KeepBoth)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(temp_dir.path().join("c.md")).unwrap(),
            b"remote version"
        );
        assert_eq!(
            resolved.written.as_deref(),
            Some(hasher::hash_bytes(b"remote version").as_str())
        );

        let copies: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("c.conflict."))
            .collect();
        assert_eq!(copies.len(), 1);

        let copy = &copies[0];
        assert!(copy.ends_with(".md"));
        let stamp = &copy["c.conflict.".len()..copy.len() - ".md".len()];
        assert_eq!(stamp.len(), 14);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(
            std::fs::read(temp_dir.path().join(copy)).unwrap(),
            b"local version"
        );
        assert_eq!(remote.content(copy).unwrap(), b"local version");
        assert_eq!(resolved.uploaded.len(), 1);
        assert_eq!(&resolved.uploaded[0].relative_path, copy);
    }

    #[tokio::test]
    async fn test_keep_local_uploads() {
        let temp_dir = TempDir::new().unwrap();
        let (remote, transfer, conflict) = conflicted(&temp_dir).await;

        let resolved = apply_resolution(&transfer, &conflict, Resolution::KeepLocal)
            .await
            .unwrap();
        assert_eq!(remote.content("c.md").unwrap(), b"local version");
        assert!(resolved.written.is_none());
        assert_eq!(resolved.uploaded.len(), 1);
        assert!(resolved.uploaded[0].has_hash(&hasher::hash_bytes(b"local version")));
    }

    #[tokio::test]
    async fn test_keep_remote_downloads() {
        let temp_dir = TempDir::new().unwrap();
        let (_remote, transfer, conflict) = conflicted(&temp_dir).await;

        let resolved = apply_resolution(&transfer, &conflict, Resolution::KeepRemote)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(temp_dir.path().join("c.md")).unwrap(),
            b"remote version"
        );
        assert!(resolved.uploaded.is_empty());
        assert!(resolved.written.is_some());
    }

    #[tokio::test]
    async fn test_keep_both_download_failure_keeps_copy() {
        let temp_dir = TempDir::new().unwrap();
        let (remote, transfer, conflict) = conflicted(&temp_dir).await;
        remote.fail_path("c.md");

        assert!(apply_resolution(&transfer, &conflict, Resolution::KeepBoth)
            .await
            .is_err());
        assert_eq!(
            std::fs::read(temp_dir.path().join("c.md")).unwrap(),
            b"local version"
        );
    }

    #[tokio::test]
    async fn test_conflict_port_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let (_remote, _transfer, conflict) = conflicted(&temp_dir).await;
        let (port, mut requests) = conflict_port(4);

        let handler = tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            assert_eq!(request.conflict.path, "c.md");
            request.respond(Resolution::KeepRemote);
        });

        assert_eq!(port.decide(&conflict).await, Some(Resolution::KeepRemote));
        handler.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_request_is_unresolved() {
        let temp_dir = TempDir::new().unwrap();
        let (_remote, _transfer, conflict) = conflicted(&temp_dir).await;
        let (port, mut requests) = conflict_port(4);

        tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            drop(request);
        });
        assert_eq!(port.decide(&conflict).await, None);

        let (port, requests) = conflict_port(1);
        drop(requests);
        assert_eq!(port.decide(&conflict).await, None);
    }
}
