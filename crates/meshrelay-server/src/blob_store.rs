use std::path::PathBuf;

use tokio::fs;
use tracing::{debug, info};

use crate::error::ServerError;

/// Length of a content handle: BLAKE3 digest, hex-encoded.
const HANDLE_LEN: usize = 64;

/// Content-addressed store for opaque ciphertext. A blob's handle is the
/// BLAKE3 hash of its bytes, so uploading the same content twice yields
/// the same handle and a single file.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl BlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::BlobStorage(format!(
                "Failed to create blob directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Blob store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub async fn store_blob(&self, data: &[u8]) -> Result<String, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty blob".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::BlobTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let handle = blake3::hash(data).to_hex().to_string();
        let path = self.base_path.join(&handle);

        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!(handle = %handle, "Blob already stored");
            return Ok(handle);
        }

        // Readers never see a half-written blob under its final name
        let staging = self.base_path.join(format!("{handle}.part"));
        fs::write(&staging, data).await.map_err(|e| {
            ServerError::BlobStorage(format!("Failed to write blob {handle}: {e}"))
        })?;
        fs::rename(&staging, &path).await.map_err(|e| {
            ServerError::BlobStorage(format!("Failed to commit blob {handle}: {e}"))
        })?;

        debug!(handle = %handle, size = data.len(), "Stored blob");
        Ok(handle)
    }

    pub async fn get_blob(&self, handle: &str) -> Result<Vec<u8>, ServerError> {
        validate_handle(handle)?;
        let path = self.base_path.join(handle);

        match fs::read(&path).await {
            Ok(data) => {
                debug!(handle = %handle, size = data.len(), "Retrieved blob");
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::BlobNotFound(handle.to_string()))
            }
            Err(e) => Err(ServerError::BlobStorage(format!(
                "Failed to read blob {handle}: {e}"
            ))),
        }
    }
}

/// Handles are lowercase hex of a fixed length, which also keeps them
/// from naming anything outside the store directory.
pub fn validate_handle(handle: &str) -> Result<(), ServerError> {
    let well_formed = handle.len() == HANDLE_LEN
        && handle
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if well_formed {
        Ok(())
    } else {
        Err(ServerError::BadRequest(format!("Malformed blob handle: {handle}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (BlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf(), 1024).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let (store, _dir) = test_store().await;
        let data = b"encrypted-blob-data";

        let handle = store.store_blob(data).await.unwrap();
        assert_eq!(handle, blake3::hash(data).to_hex().to_string());
        assert_eq!(store.get_blob(&handle).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_identical_content_is_stored_once() {
        let (store, dir) = test_store().await;

        let first = store.store_blob(b"same bytes").await.unwrap();
        let second = store.store_blob(b"same bytes").await.unwrap();
        assert_eq!(first, second);

        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn test_not_found() {
        let (store, _dir) = test_store().await;
        let missing = blake3::hash(b"never uploaded").to_hex().to_string();
        assert!(matches!(
            store.get_blob(&missing).await,
            Err(ServerError::BlobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_and_oversized_rejected() {
        let (store, _dir) = test_store().await;
        assert!(matches!(
            store.store_blob(b"").await,
            Err(ServerError::BadRequest(_))
        ));
        assert!(matches!(
            store.store_blob(&[0u8; 2048]).await,
            Err(ServerError::BlobTooLarge { size: 2048, max: 1024 })
        ));
    }

    #[test]
    fn test_handle_validation() {
        assert!(validate_handle(&"ab".repeat(32)).is_ok());
        assert!(validate_handle("../etc/passwd").is_err());
        assert!(validate_handle(&"AB".repeat(32)).is_err());
        assert!(validate_handle("abcd").is_err());
    }
}
