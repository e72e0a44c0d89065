// rust/fedsim-core/src/client.rs

//! The client-side contract: identities, payloads and the compute step.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::SlotId;
use crate::state::ClientState;

/// Stable identifier of a logical client, unique within a run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<usize> for ClientId {
    fn from(id: usize) -> Self {
        Self(id.to_string())
    }
}

/// Input handed to a client for one round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub round: u64,
    /// Opaque global parameters.
    pub parameters: Bytes,
    pub config: BTreeMap<String, String>,
}

impl Instruction {
    pub fn new(round: u64) -> Self {
        Self {
            round,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: impl Into<Bytes>) -> Self {
        self.parameters = parameters.into();
        self
    }

    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// Result of one successful client invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Number of examples the client used; weights aggregation.
    pub num_examples: u64,
    pub metrics: BTreeMap<String, f64>,
    pub parameters: Bytes,
}

impl Reply {
    pub fn new(num_examples: u64) -> Self {
        Self {
            num_examples,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: impl Into<Bytes>) -> Self {
        self.parameters = parameters.into();
        self
    }
}

/// Everything a client's compute step may see about itself.
///
/// The state is owned by the context for the duration of one invocation and
/// written back wholesale if the invocation succeeds.
#[derive(Debug)]
pub struct ClientContext {
    client_id: ClientId,
    partition_index: usize,
    slot: SlotId,
    state: ClientState,
}

impl ClientContext {
    pub(crate) fn new(
        client_id: ClientId,
        partition_index: usize,
        slot: SlotId,
        state: ClientState,
    ) -> Self {
        Self {
            client_id,
            partition_index,
            slot,
            state,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Index of this client's data partition (its position in the launch
    /// order).
    pub fn partition_index(&self) -> usize {
        self.partition_index
    }

    /// Slot the invocation was scheduled on.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ClientState {
        &mut self.state
    }

    pub(crate) fn into_state(self) -> ClientState {
        self.state
    }
}

/// Error reported by a client's compute step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ClientError {
    pub message: String,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<crate::error::SimError> for ClientError {
    fn from(err: crate::error::SimError) -> Self {
        Self::new(err.to_string())
    }
}

/// The opaque per-client compute step.
///
/// One implementation is shared by all logical clients of a run; per-client
/// behavior comes from the context (id, partition, state).
#[async_trait]
pub trait ClientApp: Send + Sync {
    async fn run(&self, ctx: &mut ClientContext, input: Instruction) -> Result<Reply, ClientError>;
}
