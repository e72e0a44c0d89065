// rust/fedsim-core/src/storage/async_local.rs

//! Async local filesystem storage backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::async_traits::AsyncStorageBackend;
use crate::error::{Result, SimError};

/// Async local filesystem storage rooted at a base directory.
pub struct AsyncLocalStorage {
    base_path: PathBuf,
}

impl AsyncLocalStorage {
    /// Creates the backend, creating `base_path` if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub async fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();

        if !base_path.exists() {
            fs::create_dir_all(&base_path).await.map_err(|e| {
                SimError::storage_with_source(&base_path, "failed to create base directory", e)
            })?;
        }

        Ok(Self { base_path })
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !fs::try_exists(parent).await.unwrap_or(false) {
                fs::create_dir_all(parent).await.map_err(|e| {
                    SimError::storage_with_source(parent, "failed to create parent directories", e)
                })?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AsyncStorageBackend for AsyncLocalStorage {
    async fn exists(&self, path: &Path) -> Result<bool> {
        let full_path = self.resolve_path(path);
        Ok(fs::try_exists(&full_path).await.unwrap_or(false))
    }

    async fn read(&self, path: &Path) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        let data = fs::read(&full_path)
            .await
            .map_err(|e| SimError::storage_with_source(&full_path, "failed to read file", e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path).await?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .await
            .map_err(|e| SimError::storage_with_source(&full_path, "failed to create file", e))?;

        file.write_all(data)
            .await
            .map_err(|e| SimError::storage_with_source(&full_path, "failed to write data", e))?;

        // Sync to disk
        file.sync_all().await.map_err(|e| {
            SimError::storage_with_source(&full_path, "failed to sync file to disk", e)
        })
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);

        let meta = fs::metadata(&full_path).await.map_err(|e| {
            SimError::storage_with_source(&full_path, "failed to read metadata", e)
        })?;

        if meta.is_dir() {
            fs::remove_dir_all(&full_path).await.map_err(|e| {
                SimError::storage_with_source(&full_path, "failed to delete directory", e)
            })
        } else {
            fs::remove_file(&full_path).await.map_err(|e| {
                SimError::storage_with_source(&full_path, "failed to delete file", e)
            })
        }
    }

    async fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        let full_path = self.resolve_path(prefix);

        if !fs::try_exists(&full_path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full_path).await.map_err(|e| {
            SimError::storage_with_source(&full_path, "failed to read directory", e)
        })?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| {
            SimError::storage_with_source(&full_path, "failed to read directory entry", e)
        })? {
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        Self::ensure_parent(&to_path).await?;

        fs::rename(&from_path, &to_path).await.map_err(|e| {
            SimError::storage_with_source(
                &from_path,
                format!("failed to rename to {}", to_path.display()),
                e,
            )
        })
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn supports_atomic_rename(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_storage() -> (AsyncLocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = AsyncLocalStorage::new(temp_dir.path()).await.unwrap();
        (storage, temp_dir)
    }

    #[tokio::test]
    async fn test_new_creates_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let new_base = temp_dir.path().join("new_subdir");

        let _storage = AsyncLocalStorage::new(&new_base).await.unwrap();
        assert!(new_base.exists());
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (storage, _temp) = create_test_storage().await;

        assert!(!storage.exists(Path::new("a/b.state")).await.unwrap());
        storage.write(Path::new("a/b.state"), b"hello").await.unwrap();
        assert!(storage.exists(Path::new("a/b.state")).await.unwrap());

        let content = storage.read(Path::new("a/b.state")).await.unwrap();
        assert_eq!(content.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_write_replaces() {
        let (storage, _temp) = create_test_storage().await;

        storage.write(Path::new("x"), b"first, longer").await.unwrap();
        storage.write(Path::new("x"), b"second").await.unwrap();
        assert_eq!(storage.read(Path::new("x")).await.unwrap().as_ref(), b"second");
    }

    #[tokio::test]
    async fn test_rename_replaces_destination() {
        let (storage, _temp) = create_test_storage().await;

        storage.write(Path::new("dst"), b"old").await.unwrap();
        storage.write(Path::new("tmp"), b"new").await.unwrap();
        storage.rename(Path::new("tmp"), Path::new("dst")).await.unwrap();

        assert!(!storage.exists(Path::new("tmp")).await.unwrap());
        assert_eq!(storage.read(Path::new("dst")).await.unwrap().as_ref(), b"new");
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (storage, _temp) = create_test_storage().await;

        storage.write(Path::new("dir/b"), b"").await.unwrap();
        storage.write(Path::new("dir/a"), b"").await.unwrap();
        assert_eq!(storage.list(Path::new("dir")).await.unwrap(), vec!["a", "b"]);

        storage.delete(Path::new("dir/a")).await.unwrap();
        assert_eq!(storage.list(Path::new("dir")).await.unwrap(), vec!["b"]);
        assert!(storage.list(Path::new("missing")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_missing_is_storage_error() {
        let (storage, _temp) = create_test_storage().await;
        let err = storage.read(Path::new("nope")).await.unwrap_err();
        assert!(matches!(err, SimError::Storage { .. }));
    }
}
