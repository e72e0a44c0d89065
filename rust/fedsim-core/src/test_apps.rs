// rust/fedsim-core/src/test_apps.rs

//! Client apps shared by unit tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use crate::client::{ClientApp, ClientContext, ClientError, ClientId, Instruction, Reply};

/// Announces each start, then holds its slot until the test adds a permit.
pub(crate) struct GateApp {
    started: mpsc::UnboundedSender<ClientId>,
    gate: Arc<Semaphore>,
}

impl GateApp {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ClientId>, Arc<Semaphore>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let app = Arc::new(Self {
            started: tx,
            gate: gate.clone(),
        });
        (app, rx, gate)
    }
}

#[async_trait]
impl ClientApp for GateApp {
    async fn run(&self, ctx: &mut ClientContext, _input: Instruction) -> Result<Reply, ClientError> {
        let _ = self.started.send(ctx.client_id().clone());
        self.gate
            .acquire()
            .await
            .map_err(|_| ClientError::new("gate closed"))?
            .forget();
        Ok(Reply::new(1))
    }
}

/// Counts its own invocations in the client state.
///
/// Selected ids can be made to fail, panic or stall.
#[derive(Default)]
pub(crate) struct CountingApp {
    failing: HashSet<ClientId>,
    panicking: HashSet<ClientId>,
    stalling: HashSet<ClientId>,
}

pub(crate) const COUNT_KEY: &str = "count";

pub(crate) fn read_count(bytes: Option<&[u8]>) -> u64 {
    bytes
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

impl CountingApp {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing<I: Into<ClientId>>(mut self, ids: impl IntoIterator<Item = I>) -> Self {
        self.failing.extend(ids.into_iter().map(Into::into));
        self
    }

    pub(crate) fn panicking<I: Into<ClientId>>(mut self, ids: impl IntoIterator<Item = I>) -> Self {
        self.panicking.extend(ids.into_iter().map(Into::into));
        self
    }

    pub(crate) fn stalling<I: Into<ClientId>>(mut self, ids: impl IntoIterator<Item = I>) -> Self {
        self.stalling.extend(ids.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl ClientApp for CountingApp {
    async fn run(&self, ctx: &mut ClientContext, input: Instruction) -> Result<Reply, ClientError> {
        let id = ctx.client_id().clone();
        if self.stalling.contains(&id) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.panicking.contains(&id) {
            panic!("client {id} blew up");
        }

        // Mutate state before failing so tests can check it is discarded
        let count = read_count(ctx.state().entry(COUNT_KEY)) + 1;
        ctx.state_mut().set_entry(COUNT_KEY, count.to_le_bytes().to_vec());

        if self.failing.contains(&id) {
            return Err(ClientError::new(format!("client {id} failed in round {}", input.round)));
        }

        Ok(Reply::new(10)
            .with_metric(COUNT_KEY, count as f64)
            .with_metric("partition", ctx.partition_index() as f64))
    }
}
