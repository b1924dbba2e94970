//! Filesystem-backed media handler and the in-memory file metadata store.
//!
//! This is the variant loaded when no external blob storage is configured:
//! blobs land under a configured root directory, metadata lives in process
//! memory. Both sit behind the same traits an external backend would use.

use crate::media::{
    FileDef, FileStore, HeadersRequest, HeadersResponse, MediaError, MediaHandler, StoreError,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// URL path under which stored files are served.
pub const SERVE_PREFIX: &str = "/v0/file/s";

/// In-memory [`FileStore`].
#[derive(Default)]
pub struct MemFileStore {
    files: Mutex<HashMap<String, StoredFile>>,
}

struct StoredFile {
    fdef: FileDef,
    finalized: bool,
}

impl MemFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FileStore for MemFileStore {
    fn start_upload(&self, fdef: &FileDef) -> Result<(), StoreError> {
        self.files.lock().insert(
            fdef.id.clone(),
            StoredFile {
                fdef: fdef.clone(),
                finalized: false,
            },
        );
        Ok(())
    }

    fn finish_upload(
        &self,
        fdef: &FileDef,
        success: bool,
        size: u64,
    ) -> Result<FileDef, StoreError> {
        let mut files = self.files.lock();
        if !success {
            // Discarding a failed upload; the record simply goes away.
            files.remove(&fdef.id);
            return Ok(fdef.clone());
        }
        let entry = files.get_mut(&fdef.id).ok_or(StoreError::NotFound)?;
        entry.fdef.location = fdef.location.clone();
        entry.fdef.size = size;
        entry.fdef.updated_at = Utc::now();
        entry.finalized = true;
        Ok(entry.fdef.clone())
    }

    fn get(&self, id: &str) -> Result<FileDef, StoreError> {
        self.files
            .lock()
            .get(id)
            .filter(|f| f.finalized)
            .map(|f| f.fdef.clone())
            .ok_or(StoreError::NotFound)
    }

    fn delete_unused(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut files = self.files.lock();
        let doomed: Vec<String> = files
            .values()
            .filter(|f| f.finalized && f.fdef.updated_at < older_than)
            .take(limit)
            .map(|f| f.fdef.id.clone())
            .collect();
        let mut locations = Vec::with_capacity(doomed.len());
        for id in doomed {
            if let Some(f) = files.remove(&id) {
                locations.push(f.fdef.location);
            }
        }
        Ok(locations)
    }
}

/// Media handler storing blobs as flat files under a root directory.
pub struct FsMediaHandler {
    root: PathBuf,
    files: Arc<dyn FileStore>,
}

impl FsMediaHandler {
    pub fn new(root: impl Into<PathBuf>, files: Arc<dyn FileStore>) -> Self {
        Self {
            root: root.into(),
            files,
        }
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}

/// Extract the file id from a download URL: the last path segment, with any
/// query string stripped.
fn file_id_from_url(url: &str) -> Option<&str> {
    let path = url.split('?').next()?;
    let id = path.rsplit('/').next()?;
    // Refuse anything that could escape the blob root.
    if id.is_empty() || id.contains("..") || id.contains(std::path::MAIN_SEPARATOR) {
        return None;
    }
    Some(id)
}

#[async_trait]
impl MediaHandler for FsMediaHandler {
    async fn headers(
        &self,
        _req: &HeadersRequest,
        _serve: bool,
    ) -> Result<HeadersResponse, MediaError> {
        // Local storage never redirects; permissive CORS for the media
        // endpoints only.
        Ok(HeadersResponse {
            headers: vec![
                ("Access-Control-Allow-Origin".to_string(), "*".to_string()),
                (
                    "Access-Control-Allow-Headers".to_string(),
                    "X-Tinode-APIKey, X-Tinode-Auth, Authorization, Content-Type".to_string(),
                ),
                (
                    "Access-Control-Allow-Methods".to_string(),
                    "GET, HEAD, POST, PUT, OPTIONS".to_string(),
                ),
            ],
            status: 0,
        })
    }

    async fn upload(&self, fdef: &mut FileDef, data: Bytes) -> Result<(String, u64), MediaError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| MediaError::Internal(e.to_string()))?;
        let path = self.blob_path(&fdef.id);
        let size = data.len() as u64;
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| MediaError::Internal(e.to_string()))?;
        fdef.location = path.to_string_lossy().into_owned();
        self.files
            .start_upload(fdef)
            .map_err(|e| MediaError::Internal(e.to_string()))?;
        Ok((format!("{SERVE_PREFIX}/{}", fdef.id), size))
    }

    async fn download(&self, url: &str) -> Result<(FileDef, Bytes), MediaError> {
        let id = file_id_from_url(url).ok_or(MediaError::NotFound)?;
        let fdef = self.files.get(id).map_err(|err| match err {
            StoreError::NotFound => MediaError::NotFound,
            other => MediaError::Internal(other.to_string()),
        })?;
        let data = tokio::fs::read(self.blob_path(id)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MediaError::NotFound
            } else {
                MediaError::Internal(e.to_string())
            }
        })?;
        Ok((fdef, Bytes::from(data)))
    }

    async fn delete(&self, locations: &[String]) -> Result<(), MediaError> {
        for location in locations {
            if Path::new(location).parent() != Some(self.root.as_path()) {
                tracing::warn!("media fs: refusing to delete outside root: {location}");
                continue;
            }
            if let Err(err) = tokio::fs::remove_file(location).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("media fs: delete {location} failed: {err}");
                }
            }
        }
        Ok(())
    }
}
