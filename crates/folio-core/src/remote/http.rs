//! HTTP remote store
//!
//! Endpoints, relative to the configured server URL:
//!
//! - `GET    /api/files`                 catalog (JSON array of records)
//! - `GET    /api/files/metadata?path=`  one record, 404 when absent
//! - `POST   /api/files`                 multipart upload
//! - `GET    /api/files/content?path=`   raw bytes
//! - `DELETE /api/files?path=`           idempotent delete

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::debug;

use super::RemoteStore;
use crate::error::{SyncError, SyncResult};
use crate::models::FileRecord;

/// Remote store backed by the library server's HTTP API
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpRemote {
    /// Create a client for the given server
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        request_timeout: Duration,
    ) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::network("client setup", e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/files{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> SyncResult<Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| SyncError::from_reqwest(operation, e))
    }
}

/// Turn a non-success status into a classified error
fn check_status(operation: &str, response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(SyncError::from_status(
            operation,
            status.as_u16(),
            format!("server returned {}", status),
        ))
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn fetch_catalog(&self) -> SyncResult<Vec<FileRecord>> {
        const OP: &str = "catalog fetch";
        let response = self.send(OP, self.client.get(self.endpoint(""))).await?;
        let records: Vec<FileRecord> = check_status(OP, response)?
            .json()
            .await
            .map_err(|e| SyncError::protocol(OP, e.to_string()))?;

        debug!("Fetched catalog with {} entries", records.len());
        Ok(records)
    }

    async fn file_metadata(&self, path: &str) -> SyncResult<Option<FileRecord>> {
        const OP: &str = "metadata lookup";
        let request = self
            .client
            .get(self.endpoint("/metadata"))
            .query(&[("path", path)]);
        let response = self.send(OP, request).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let record = check_status(OP, response)?
            .json()
            .await
            .map_err(|e| SyncError::protocol(OP, e.to_string()))?;
        Ok(Some(record))
    }

    async fn upload(&self, record: &FileRecord, content: Vec<u8>) -> SyncResult<()> {
        const OP: &str = "upload";
        let file_name = record
            .relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&record.relative_path)
            .to_string();

        let mut form = Form::new()
            .text("path", record.relative_path.clone())
            .text("modifiedTime", record.modified_time.to_rfc3339())
            .part("file", Part::bytes(content).file_name(file_name));
        if let Some(hash) = &record.content_hash {
            form = form.text("hash", hash.clone());
        }

        let response = self
            .send(OP, self.client.post(self.endpoint("")).multipart(form))
            .await?;
        check_status(OP, response)?;
        Ok(())
    }

    async fn download(&self, path: &str) -> SyncResult<Vec<u8>> {
        const OP: &str = "download";
        let request = self
            .client
            .get(self.endpoint("/content"))
            .query(&[("path", path)]);
        let response = check_status(OP, self.send(OP, request).await?)?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SyncError::from_reqwest(OP, e))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, path: &str) -> SyncResult<()> {
        const OP: &str = "delete";
        let request = self.client.delete(self.endpoint("")).query(&[("path", path)]);
        let response = self.send(OP, request).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(OP, response)?;
        Ok(())
    }
}
