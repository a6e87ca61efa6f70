//! In-memory remote store for tests
//!
//! Records every operation so tests can assert on network traffic.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::RemoteStore;
use crate::error::{SyncError, SyncResult};
use crate::hasher;
use crate::models::FileRecord;

/// One recorded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    Catalog,
    Metadata(String),
    Upload(String),
    Download(String),
    Delete(String),
}

#[derive(Default)]
struct Inner {
    files: BTreeMap<String, (FileRecord, Vec<u8>)>,
    ops: Vec<RemoteOp>,
    failing: HashSet<String>,
    catalog_fails: bool,
    metadata_fails: bool,
}

#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_file(&self, path: &str, content: &[u8], modified: DateTime<Utc>) {
        let record = FileRecord::file(
            path,
            content.len() as u64,
            modified,
            hasher::hash_bytes(content),
        );
        self.inner
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), (record, content.to_vec()));
    }

    pub fn put_directory(&self, path: &str, modified: DateTime<Utc>) {
        self.inner.lock().unwrap().files.insert(
            path.to_string(),
            (FileRecord::directory(path, modified), Vec::new()),
        );
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|(_, c)| c.clone())
    }

    pub fn record(&self, path: &str) -> Option<FileRecord> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|(r, _)| r.clone())
    }

    pub fn ops(&self) -> Vec<RemoteOp> {
        self.inner.lock().unwrap().ops.clone()
    }

    /// Operations that moved file content over the network
    pub fn transfers(&self) -> Vec<RemoteOp> {
        self.ops()
            .into_iter()
            .filter(|op| matches!(op, RemoteOp::Upload(_) | RemoteOp::Download(_)))
            .collect()
    }

    pub fn clear_ops(&self) {
        self.inner.lock().unwrap().ops.clear();
    }

    /// Make every per-file operation on `path` fail with a network error
    pub fn fail_path(&self, path: &str) {
        self.inner.lock().unwrap().failing.insert(path.to_string());
    }

    pub fn fail_catalog(&self, fails: bool) {
        self.inner.lock().unwrap().catalog_fails = fails;
    }

    pub fn fail_metadata(&self, fails: bool) {
        self.inner.lock().unwrap().metadata_fails = fails;
    }

    fn check(&self, inner: &Inner, operation: &str, path: &str) -> SyncResult<()> {
        if inner.failing.contains(path) {
            Err(SyncError::network(operation, format!("injected failure for {}", path)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_catalog(&self) -> SyncResult<Vec<FileRecord>> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(RemoteOp::Catalog);
        if inner.catalog_fails {
            return Err(SyncError::network("catalog fetch", "injected failure"));
        }
        Ok(inner.files.values().map(|(r, _)| r.clone()).collect())
    }

    async fn file_metadata(&self, path: &str) -> SyncResult<Option<FileRecord>> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(RemoteOp::Metadata(path.to_string()));
        if inner.metadata_fails {
            return Err(SyncError::network("metadata lookup", "injected failure"));
        }
        Ok(inner.files.get(path).map(|(r, _)| r.clone()))
    }

    async fn upload(&self, record: &FileRecord, content: Vec<u8>) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(RemoteOp::Upload(record.relative_path.clone()));
        self.check(&inner, "upload", &record.relative_path)?;
        inner
            .files
            .insert(record.relative_path.clone(), (record.clone(), content));
        Ok(())
    }

    async fn download(&self, path: &str) -> SyncResult<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(RemoteOp::Download(path.to_string()));
        self.check(&inner, "download", path)?;
        inner
            .files
            .get(path)
            .map(|(_, c)| c.clone())
            .ok_or_else(|| SyncError::protocol("download", format!("{} not found", path)))
    }

    async fn delete(&self, path: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(RemoteOp::Delete(path.to_string()));
        self.check(&inner, "delete", path)?;
        inner.files.remove(path);
        Ok(())
    }
}
