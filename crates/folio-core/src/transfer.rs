//! Transfer client
//!
//! Joins the local library with a remote store. Each operation acts on a
//! single relative path and fails independently of any other.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::SyncResult;
use crate::hasher;
use crate::library::LocalLibrary;
use crate::models::FileRecord;
use crate::remote::RemoteStore;

/// Moves file content between the local library and the server
#[derive(Clone)]
pub struct TransferClient {
    library: LocalLibrary,
    remote: Arc<dyn RemoteStore>,
}

impl TransferClient {
    pub fn new(library: LocalLibrary, remote: Arc<dyn RemoteStore>) -> Self {
        Self { library, remote }
    }

    pub fn library(&self) -> &LocalLibrary {
        &self.library
    }

    /// Fetch the remote catalog
    pub async fn fetch_catalog(&self) -> SyncResult<Vec<FileRecord>> {
        self.remote.fetch_catalog().await
    }

    /// Look up the server's record for one path
    pub async fn remote_metadata(&self, relative: &str) -> SyncResult<Option<FileRecord>> {
        self.remote.file_metadata(relative).await
    }

    /// Read, hash and upload a local file
    ///
    /// Returns the record that was sent.
    pub async fn upload(&self, relative: &str) -> SyncResult<FileRecord> {
        let (record, content) = self.library.read(relative)?;
        self.remote.upload(&record, content).await?;
        info!("Uploaded {}", relative);
        Ok(record)
    }

    /// Download a remote file and write it atomically
    ///
    /// When the remote record is known its modification time is applied to
    /// the local copy. Returns the hash of the content written.
    pub async fn download(
        &self,
        relative: &str,
        remote: Option<&FileRecord>,
    ) -> SyncResult<String> {
        self.library.resolve(relative)?;
        let content = self.remote.download(relative).await?;
        let modified = remote.map(|r| r.modified_time);
        self.library.write_atomic(relative, &content, modified)?;
        info!("Downloaded {}", relative);
        Ok(hasher::hash_bytes(&content))
    }

    /// Delete a remote path
    pub async fn delete(&self, relative: &str) -> SyncResult<()> {
        self.remote.delete(relative).await?;
        debug!("Deleted remote {}", relative);
        Ok(())
    }
}
