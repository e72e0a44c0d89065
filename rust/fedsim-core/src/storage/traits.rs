// rust/fedsim-core/src/storage/traits.rs

//! Read-side storage traits for dataset files.

use std::path::Path;

use crate::error::Result;

/// A handle for reading one stored object.
pub trait StorageReader: Send {
    /// Reads the whole object.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    fn read_all(&mut self) -> Result<Vec<u8>>;
}

/// Read-only storage backend.
///
/// This trait is object-safe and can be used as `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync {
    /// Opens an object for reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the object doesn't exist or cannot be opened.
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;
}
