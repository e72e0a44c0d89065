// rust/fedsim-core/src/storage/mod.rs

//! Storage backends used by the simulation engine.
//!
//! # Sync vs Async
//!
//! - **Sync traits** (`StorageBackend`, `StorageReader`): read-only access to
//!   dataset record files. Large files are memory-mapped.
//!
//! - **Async trait** (`AsyncStorageBackend`): whole-object reads and writes
//!   used by the persisted client state store, which runs on the worker pool's
//!   tokio runtime.
//!
//! # Example (Async)
//!
//! ```no_run
//! use fedsim_core::storage::{AsyncLocalStorage, AsyncStorageBackend};
//! use std::path::Path;
//!
//! # async fn example() -> fedsim_core::Result<()> {
//! let storage = AsyncLocalStorage::new("./client_state").await?;
//!
//! storage.write(Path::new("clients/a.state"), b"payload").await?;
//! let content = storage.read(Path::new("clients/a.state")).await?;
//! assert_eq!(content.as_ref(), b"payload");
//! # Ok(())
//! # }
//! ```

// Sync storage
mod local;
mod traits;

pub use local::LocalStorage;
pub use traits::{StorageBackend, StorageReader};

// Async storage
mod async_local;
mod async_traits;

pub use async_local::AsyncLocalStorage;
pub use async_traits::AsyncStorageBackend;
