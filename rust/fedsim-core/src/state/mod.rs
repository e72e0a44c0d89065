// rust/fedsim-core/src/state/mod.rs

//! Per-client state held across non-contiguous activations.
//!
//! A [`ClientStateStore`] maps each logical client id to one [`ClientState`].
//! The store never sees concurrent access for the same id: the virtual client
//! proxy allows at most one invocation per id at a time. Different ids proceed
//! independently.
//!
//! Two backends are provided:
//!
//! - [`MemoryStateStore`]: transient, lost when the process exits.
//! - [`FileStateStore`]: one object per client on an [`AsyncStorageBackend`],
//!   durable across restarts.
//!
//! [`AsyncStorageBackend`]: crate::storage::AsyncStorageBackend

mod file;
mod memory;

pub use file::{FileStateStore, StateHeader};
pub use memory::MemoryStateStore;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::ClientId;
use crate::config::{StateBackendType, StateConfig};
use crate::error::Result;
use crate::storage::AsyncLocalStorage;

/// Opaque, versioned state owned by one logical client.
///
/// Replaced wholesale at the end of each completed invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    version: u64,
    entries: BTreeMap<String, Vec<u8>>,
    metrics: BTreeMap<String, f64>,
}

impl ClientState {
    /// Number of completed invocations this state has gone through.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    pub fn entry(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn set_entry(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove_entry(&mut self, key: &str) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn set_metric(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.insert(name.into(), value);
    }

    pub fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    /// True for a state no invocation has ever written.
    pub fn is_fresh(&self) -> bool {
        self.version == 0 && self.entries.is_empty() && self.metrics.is_empty()
    }
}

/// Keyed store for client states.
#[async_trait]
pub trait ClientStateStore: Send + Sync {
    /// Returns the state for `id`, or a fresh default if none was written.
    async fn get(&self, id: &ClientId) -> Result<ClientState>;

    /// Replaces the state for `id`.
    async fn put(&self, id: &ClientId, state: ClientState) -> Result<()>;

    /// Number of clients with a stored state.
    async fn len(&self) -> Result<usize>;

    fn backend_type(&self) -> StateBackendType;
}

/// Opens the store selected by `config`.
///
/// # Errors
///
/// Returns an error if the filesystem backend's base directory cannot be
/// created.
pub async fn open_state_store(config: &StateConfig) -> Result<Arc<dyn ClientStateStore>> {
    match config.backend {
        StateBackendType::Memory => Ok(Arc::new(MemoryStateStore::new())),
        StateBackendType::Filesystem => {
            let storage = AsyncLocalStorage::new(&config.base_path).await?;
            Ok(Arc::new(FileStateStore::new(
                Arc::new(storage),
                config.atomic_writes,
            )))
        }
    }
}
