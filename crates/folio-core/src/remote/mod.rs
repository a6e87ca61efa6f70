//! Remote side of a library
//!
//! `RemoteStore` is the request/response surface of the server: catalog
//! listing, per-file metadata, upload, download and delete. `HttpRemote`
//! talks to the real server; tests use an in-memory store.

mod http;
#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::models::FileRecord;

pub use http::HttpRemote;

/// Operations against the server's copy of the library
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the authoritative listing of all files and directories
    async fn fetch_catalog(&self) -> SyncResult<Vec<FileRecord>>;

    /// Look up one path, `None` if the server does not have it
    async fn file_metadata(&self, path: &str) -> SyncResult<Option<FileRecord>>;

    /// Store content for `record.relative_path`
    async fn upload(&self, record: &FileRecord, content: Vec<u8>) -> SyncResult<()>;

    /// Fetch raw content for a path
    async fn download(&self, path: &str) -> SyncResult<Vec<u8>>;

    /// Remove a path; deleting something already absent is not an error
    async fn delete(&self, path: &str) -> SyncResult<()>;
}
