use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};

use crate::error::ServerError;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` at `path` and return its public URL.
    async fn put(&self, path: &str, data: &[u8]) -> Result<String, ServerError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, ServerError>;
}

/// Resolve a relative blob path under `base`, rejecting traversal.
fn ensure_within(base: &Path, relative: &str) -> Result<PathBuf, ServerError> {
    let mut resolved = base.to_path_buf();
    let mut depth = 0;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(c) => {
                resolved.push(c);
                depth += 1;
            }
            Component::CurDir => {}
            _ => return Err(ServerError::bad_request("Invalid blob path")),
        }
    }
    if depth == 0 {
        return Err(ServerError::bad_request("Invalid blob path"));
    }
    Ok(resolved)
}

/// Blobs on the local filesystem, served back under `base_url`.
#[derive(Debug, Clone)]
pub struct DiskBlobStore {
    base_path: PathBuf,
    base_url: String,
    max_size: usize,
}

impl DiskBlobStore {
    pub async fn new(base_path: PathBuf, base_url: String, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::Internal(format!(
                "Failed to create blob directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Blob store initialized");

        Ok(Self {
            base_path,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_size,
        })
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn put(&self, path: &str, data: &[u8]) -> Result<String, ServerError> {
        if data.is_empty() {
            return Err(ServerError::bad_request("The upload is empty"));
        }
        if data.len() > self.max_size {
            return Err(ServerError::bad_request(format!(
                "The upload is larger than {} bytes",
                self.max_size
            )));
        }

        let target = ensure_within(&self.base_path, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ServerError::Internal(format!("Failed to create {path}: {e}")))?;
        }
        fs::write(&target, data)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to write blob {path}: {e}")))?;

        debug!(path, size = data.len(), "Stored blob");
        Ok(format!("{}/{}", self.base_url, path))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, ServerError> {
        let target = ensure_within(&self.base_path, path)?;
        match fs::read(&target).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ServerError::not_found()),
            Err(e) => Err(ServerError::Internal(format!("Failed to read blob {path}: {e}"))),
        }
    }
}

/// Random blob name under `prefix`.
pub fn blob_path(prefix: &str) -> String {
    format!("{}/{}", prefix.trim_matches('/'), uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (DiskBlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = DiskBlobStore::new(dir.path().to_path_buf(), "http://blobs/".into(), 1024)
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _dir) = test_store().await;
        let url = store.put("avatars/u1/abc", b"png-bytes").await.unwrap();
        assert_eq!(url, "http://blobs/avatars/u1/abc");
        assert_eq!(store.get("avatars/u1/abc").await.unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (store, _dir) = test_store().await;
        assert!(store.put("../escape", b"x").await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
        assert!(store.get("").await.is_err());
    }

    #[tokio::test]
    async fn test_limits() {
        let (store, _dir) = test_store().await;
        assert!(store.put("a", b"").await.is_err());
        assert!(store.put("a", &[0u8; 2048]).await.is_err());
        assert!(store.get("missing").await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_blob_path_is_random() {
        let a = blob_path("avatars/x");
        assert!(a.starts_with("avatars/x/"));
        assert_ne!(a, blob_path("avatars/x"));
    }
}
