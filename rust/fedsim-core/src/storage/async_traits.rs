// rust/fedsim-core/src/storage/async_traits.rs

//! Async storage trait used by the persisted client state store.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Whole-object async storage.
///
/// Objects are small (one serialized client state each), so reads and writes
/// move the full payload instead of exposing streaming handles.
#[async_trait]
pub trait AsyncStorageBackend: Send + Sync {
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Reads the full object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object doesn't exist or cannot be read.
    async fn read(&self, path: &Path) -> Result<Bytes>;

    /// Writes `data` to `path`, replacing any existing object. Parent
    /// directories are created as needed. The data is synced before this
    /// returns.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    async fn delete(&self, path: &Path) -> Result<()>;

    /// Lists entry names directly under `prefix`, sorted.
    async fn list(&self, prefix: &Path) -> Result<Vec<String>>;

    /// Renames an object, replacing the destination if it exists.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Returns a short name for log messages.
    fn backend_type(&self) -> &'static str;

    /// Returns true if `rename` atomically replaces the destination.
    fn supports_atomic_rename(&self) -> bool {
        false
    }
}
