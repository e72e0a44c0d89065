// rust/fedsim-core/src/state/memory.rs

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ClientState, ClientStateStore};
use crate::client::ClientId;
use crate::config::StateBackendType;
use crate::error::Result;

const SHARDS: usize = 16;

/// In-process state store.
///
/// Ids are spread over independently locked shards, so writers for different
/// clients rarely touch the same lock. Locks are held only for the map
/// operation itself, never across an await.
pub struct MemoryStateStore {
    shards: Vec<Mutex<HashMap<ClientId, ClientState>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, id: &ClientId) -> &Mutex<HashMap<ClientId, ClientState>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientStateStore for MemoryStateStore {
    async fn get(&self, id: &ClientId) -> Result<ClientState> {
        let shard = self.shard(id).lock().unwrap_or_else(|e| e.into_inner());
        Ok(shard.get(id).cloned().unwrap_or_default())
    }

    async fn put(&self, id: &ClientId, state: ClientState) -> Result<()> {
        let mut shard = self.shard(id).lock().unwrap_or_else(|e| e.into_inner());
        tracing::trace!("Stored state for client {} (version {})", id, state.version());
        shard.insert(id.clone(), state);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self
            .shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum())
    }

    fn backend_type(&self) -> StateBackendType {
        StateBackendType::Memory
    }
}
