//! Object-store client (§4.10, §6): `{bucket}/{request_id}/{artefact}`.
//!
//! A generic [`ObjectStore`] trait rather than a cloud-specific SDK —
//! the contract only requires a bucket/key PUT, not an S3 API surface.
//! The filesystem backend uses the same write-temp-then-atomic-rename
//! discipline the teacher's persistent append log uses, so a crash
//! mid-write can never leave a half-written artefact visible under its
//! final name.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::ClientError;

/// A bucket-and-key blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` to `{bucket}/{request_id}/{artefact}`, atomically
    /// from the perspective of any concurrent reader.
    async fn put(&self, request_id: &str, artefact: &str, bytes: &[u8]) -> Result<(), ClientError>;
}

/// Local-filesystem [`ObjectStore`]: the default backend, and the one
/// used by tests.
pub struct FilesystemObjectStore {
    root: PathBuf,
    bucket: String,
}

impl FilesystemObjectStore {
    /// `root` is the local directory artefacts are written under;
    /// `bucket` is the first path segment, matching the remote layout.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    fn final_path(&self, request_id: &str, artefact: &str) -> PathBuf {
        self.root.join(&self.bucket).join(request_id).join(artefact)
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn put(&self, request_id: &str, artefact: &str, bytes: &[u8]) -> Result<(), ClientError> {
        let final_path = self.final_path(request_id, artefact);
        let dir = final_path
            .parent()
            .ok_or_else(|| ClientError::Storage("artefact path has no parent".to_string()))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ClientError::Storage(e.to_string()))?;

        let tmp_path = dir.join(format!(
            ".{}.tmp",
            final_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("artefact")
        ));
        {
            let mut file = tokio::fs::File::create(&tmp_path)
                .await
                .map_err(|e| ClientError::Storage(e.to_string()))?;
            file.write_all(bytes)
                .await
                .map_err(|e| ClientError::Storage(e.to_string()))?;
            file.sync_all()
                .await
                .map_err(|e| ClientError::Storage(e.to_string()))?;
        }
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| ClientError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Remote [`ObjectStore`] backend using a bulk HTTP PUT endpoint rather
/// than a cloud-provider SDK.
pub struct HttpPutObjectStore {
    http: reqwest::Client,
    base_url: String,
    bucket: String,
}

impl HttpPutObjectStore {
    /// PUTs land at `{base_url}/{bucket}/{request_id}/{artefact}`.
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpPutObjectStore {
    async fn put(&self, request_id: &str, artefact: &str, bytes: &[u8]) -> Result<(), ClientError> {
        let url = format!(
            "{}/{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.bucket,
            request_id,
            artefact
        );
        self.http
            .put(url)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(ClientError::from)?
            .error_for_status()
            .map_err(ClientError::from)?;
        Ok(())
    }
}

/// `true` if `path` exists under `root` (test helper for asserting an
/// artefact landed at its expected location).
#[must_use]
pub fn artefact_exists(root: &Path, bucket: &str, request_id: &str, artefact: &str) -> bool {
    root.join(bucket).join(request_id).join(artefact).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filesystem_store_writes_under_bucket_request_artefact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path(), "gateway-artefacts");
        store.put("req-1", "response.json", b"{}").await.unwrap();
        assert!(artefact_exists(
            dir.path(),
            "gateway-artefacts",
            "req-1",
            "response.json"
        ));
        let contents = tokio::fs::read(
            dir.path()
                .join("gateway-artefacts")
                .join("req-1")
                .join("response.json"),
        )
        .await
        .unwrap();
        assert_eq!(contents, b"{}");
    }

    #[tokio::test]
    async fn filesystem_store_leaves_no_temp_file_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path(), "b");
        store.put("req-1", "a.json", b"x").await.unwrap();
        let mut entries = tokio::fs::read_dir(dir.path().join("b").join("req-1"))
            .await
            .unwrap();
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["a.json"]);
    }
}
