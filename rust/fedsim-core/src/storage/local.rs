// rust/fedsim-core/src/storage/local.rs

//! Local filesystem storage for dataset record files.
//!
//! Small files are read through a buffered reader; files at or above the
//! mmap threshold are memory-mapped.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::traits::{StorageBackend, StorageReader};
use crate::error::{Result, SimError};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_MMAP_THRESHOLD: u64 = 1024 * 1024;

/// Local filesystem storage backend rooted at a base directory.
pub struct LocalStorage {
    base_path: PathBuf,
    buffer_size: usize,
    /// File size threshold above which to use mmap.
    mmap_threshold: u64,
}

impl LocalStorage {
    /// Creates a backend rooted at `base_path`. The directory need not exist
    /// yet; reads from a missing directory fail with a storage error.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
        }
    }

    #[must_use]
    pub fn with_mmap_threshold(mut self, threshold: u64) -> Self {
        self.mmap_threshold = threshold;
        self
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }
}

impl StorageBackend for LocalStorage {
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path)
            .map_err(|e| SimError::storage_with_source(&full_path, "failed to open file", e))?;

        let size = file
            .metadata()
            .map_err(|e| {
                SimError::storage_with_source(&full_path, "failed to read file metadata", e)
            })?
            .len();

        if size >= self.mmap_threshold && size > 0 {
            // SAFETY: The file is opened read-only and the Mmap is owned by
            // the reader for its whole lifetime.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                SimError::storage_with_source(&full_path, "failed to memory-map file", e)
            })?;
            Ok(Box::new(MmapReader { mmap }))
        } else {
            Ok(Box::new(LocalReader {
                reader: BufReader::with_capacity(self.buffer_size, file),
                size,
                path: full_path,
            }))
        }
    }
}

/// Buffered file reader.
struct LocalReader {
    reader: BufReader<File>,
    size: u64,
    path: PathBuf,
}

impl StorageReader for LocalReader {
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(usize::try_from(self.size).unwrap_or(0));
        self.reader.read_to_end(&mut buf).map_err(|e| {
            SimError::storage_with_source(&self.path, "failed to read file", e)
        })?;
        Ok(buf)
    }
}

/// Memory-mapped file reader.
struct MmapReader {
    mmap: Mmap,
}

impl StorageReader for MmapReader {
    fn read_all(&mut self) -> Result<Vec<u8>> {
        Ok(self.mmap.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, data: &[u8]) {
        std::fs::write(dir.path().join(name), data).unwrap();
    }

    #[test]
    fn test_buffered_read_all() {
        let temp = TempDir::new().unwrap();
        write_file(&temp, "data.bin", b"hello world");
        let storage = LocalStorage::new(temp.path());

        let mut reader = storage.open_read(Path::new("data.bin")).unwrap();
        assert_eq!(reader.read_all().unwrap(), b"hello world");
    }

    #[test]
    fn test_mmap_read_all() {
        let temp = TempDir::new().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        write_file(&temp, "large.bin", &data);
        let storage = LocalStorage::new(temp.path()).with_mmap_threshold(1024);

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        assert_eq!(reader.read_all().unwrap(), data);
    }

    #[test]
    fn test_empty_file_not_mapped() {
        let temp = TempDir::new().unwrap();
        write_file(&temp, "empty.txt", b"");
        let storage = LocalStorage::new(temp.path()).with_mmap_threshold(0);

        let mut reader = storage.open_read(Path::new("empty.txt")).unwrap();
        assert!(reader.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_absolute_path_bypasses_base() {
        let temp = TempDir::new().unwrap();
        write_file(&temp, "abs.txt", b"x");
        let storage = LocalStorage::new("/nonexistent-base");

        let mut reader = storage.open_read(&temp.path().join("abs.txt")).unwrap();
        assert_eq!(reader.read_all().unwrap(), b"x");
    }

    #[test]
    fn test_open_missing_file() {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp.path());
        let err = storage.open_read(Path::new("missing.txt")).err().unwrap();
        assert!(matches!(err, SimError::Storage { .. }));
    }
}
