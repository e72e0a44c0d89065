// rust/fedsim-core/src/state/file.rs

//! Durable client state store.
//!
//! Each client's state is one object at `clients/<escaped id>.state`:
//! ```text
//! +-------------------+
//! | Header (bincode)  |  <- StateHeader: magic, version, length, checksum
//! +-------------------+
//! | Payload (bincode) |  <- ClientState
//! +-------------------+
//! ```

use std::fmt::Write as _;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use super::{ClientState, ClientStateStore};
use crate::client::ClientId;
use crate::config::StateBackendType;
use crate::error::{Result, SimError};
use crate::storage::AsyncStorageBackend;

const CLIENTS_DIR: &str = "clients";
const STATE_SUFFIX: &str = ".state";

/// Header written in front of every persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHeader {
    /// Magic bytes identifying a client state object ("FSST")
    pub magic: [u8; 4],
    pub version: u32,
    /// Length of the payload in bytes
    pub payload_len: u64,
    /// XXHash64 checksum of the payload
    pub checksum: u64,
}

impl StateHeader {
    pub const MAGIC: [u8; 4] = *b"FSST";
    pub const VERSION: u32 = 1;

    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            payload_len: payload.len() as u64,
            checksum: checksum(payload),
        }
    }
}

fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// Maps a client id onto a file name that is safe on every filesystem and
/// unique per id. Bytes outside `[A-Za-z0-9_-]` are written as `%XX`.
fn escape_id(id: &ClientId) -> String {
    let mut out = String::with_capacity(id.as_str().len());
    for byte in id.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

fn encode(state: &ClientState) -> Result<Vec<u8>> {
    let payload = bincode::serialize(state)
        .map_err(|e| SimError::serialization(format!("failed to encode client state: {e}")))?;
    let header = StateHeader::for_payload(&payload);
    let mut out = bincode::serialize(&header)
        .map_err(|e| SimError::serialization(format!("failed to encode state header: {e}")))?;
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(path: &Path, data: &[u8]) -> Result<ClientState> {
    let mut cursor = data;
    let header: StateHeader = bincode::deserialize_from(&mut cursor)
        .map_err(|e| SimError::storage(path, format!("unreadable state header: {e}")))?;

    if header.magic != StateHeader::MAGIC {
        return Err(SimError::storage(path, "not a client state object (bad magic)"));
    }
    if header.version != StateHeader::VERSION {
        return Err(SimError::storage(
            path,
            format!("unsupported state format version {}", header.version),
        ));
    }
    if header.payload_len != cursor.len() as u64 {
        return Err(SimError::storage(
            path,
            format!(
                "truncated state: expected {} payload bytes, found {}",
                header.payload_len,
                cursor.len()
            ),
        ));
    }
    if checksum(cursor) != header.checksum {
        return Err(SimError::storage(path, "state checksum mismatch"));
    }

    bincode::deserialize(cursor)
        .map_err(|e| SimError::storage(path, format!("unreadable state payload: {e}")))
}

/// A temporary object written ahead of a rename. Unless disarmed, it is
/// deleted when dropped, including when the write that owns it is cancelled.
struct TempObject {
    storage: Arc<dyn AsyncStorageBackend>,
    path: PathBuf,
    armed: bool,
}

impl TempObject {
    fn disarm(mut self) {
        self.armed = false;
    }

    async fn discard(mut self) {
        self.armed = false;
        let _ = self.storage.delete(&self.path).await;
    }
}

impl Drop for TempObject {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let storage = self.storage.clone();
        let path = std::mem::take(&mut self.path);
        runtime.spawn(async move {
            if let Err(e) = storage.delete(&path).await {
                tracing::debug!("Could not remove abandoned state object {}: {}", path.display(), e);
            }
        });
    }
}

/// State store persisting one object per client through an async backend.
pub struct FileStateStore {
    storage: Arc<dyn AsyncStorageBackend>,
    atomic_writes: bool,
}

impl FileStateStore {
    pub fn new(storage: Arc<dyn AsyncStorageBackend>, atomic_writes: bool) -> Self {
        Self {
            storage,
            atomic_writes,
        }
    }

    fn state_path(id: &ClientId) -> PathBuf {
        Path::new(CLIENTS_DIR).join(format!("{}{}", escape_id(id), STATE_SUFFIX))
    }
}

#[async_trait]
impl ClientStateStore for FileStateStore {
    async fn get(&self, id: &ClientId) -> Result<ClientState> {
        let path = Self::state_path(id);
        if !self.storage.exists(&path).await? {
            return Ok(ClientState::default());
        }
        let data = self.storage.read(&path).await?;
        decode(&path, &data)
    }

    async fn put(&self, id: &ClientId, state: ClientState) -> Result<()> {
        let path = Self::state_path(id);
        let data = encode(&state)?;

        if self.atomic_writes && self.storage.supports_atomic_rename() {
            let temp = TempObject {
                storage: self.storage.clone(),
                path: path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple())),
                armed: true,
            };
            self.storage.write(&temp.path, &data).await?;
            if let Err(e) = self.storage.rename(&temp.path, &path).await {
                temp.discard().await;
                return Err(e);
            }
            temp.disarm();
        } else {
            self.storage.write(&path, &data).await?;
        }

        tracing::trace!(
            "Persisted state for client {} (version {}, {} bytes) via {}",
            id,
            state.version(),
            data.len(),
            self.storage.backend_type()
        );
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let names = self.storage.list(Path::new(CLIENTS_DIR)).await?;
        Ok(names.iter().filter(|n| n.ends_with(STATE_SUFFIX)).count())
    }

    fn backend_type(&self) -> StateBackendType {
        StateBackendType::Filesystem
    }
}
