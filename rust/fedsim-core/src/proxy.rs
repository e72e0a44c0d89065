// rust/fedsim-core/src/proxy.rs

//! Virtual client proxies: the unit the round coordinator addresses.
//!
//! A proxy binds one logical client id to its partition, requirement and
//! state, and turns an invocation into fetch state → pool submission →
//! persist state. It never holds a physical worker between invocations.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::client::{ClientApp, ClientId, Instruction, Reply};
use crate::error::ClientFailure;
use crate::pool::{WorkItem, WorkerPool};
use crate::resources::ResourceVector;
use crate::state::ClientStateStore;

/// Lifecycle of a proxy's current invocation.
///
/// `Idle → Dispatched → Running → {Completed, Failed} → Idle`. The terminal
/// phases are transient; a proxy is back to `Idle` once `invoke` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxyPhase {
    Idle = 0,
    /// Selected and waiting for a slot.
    Dispatched = 1,
    /// Assigned a slot; the compute step is executing.
    Running = 2,
    Completed = 3,
    Failed = 4,
}

impl ProxyPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Dispatched,
            2 => Self::Running,
            3 => Self::Completed,
            4 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for ProxyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
struct PhaseCell(AtomicU8);

impl PhaseCell {
    fn load(&self) -> ProxyPhase {
        ProxyPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, phase: ProxyPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    fn transition(&self, from: ProxyPhase, to: ProxyPhase) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Puts the proxy back to `Idle` however the invocation ends, including
/// when its future is dropped by a round timeout.
struct BackToIdle(Arc<PhaseCell>);

impl Drop for BackToIdle {
    fn drop(&mut self) {
        self.0.store(ProxyPhase::Idle);
    }
}

/// Stand-in for one logical client.
pub struct VirtualClientProxy {
    id: ClientId,
    partition_index: usize,
    requirement: ResourceVector,
    app: Arc<dyn ClientApp>,
    store: Arc<dyn ClientStateStore>,
    pool: WorkerPool,
    phase: Arc<PhaseCell>,
}

impl VirtualClientProxy {
    pub fn new(
        id: ClientId,
        partition_index: usize,
        requirement: ResourceVector,
        app: Arc<dyn ClientApp>,
        store: Arc<dyn ClientStateStore>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            id,
            partition_index,
            requirement,
            app,
            store,
            pool,
            phase: Arc::new(PhaseCell(AtomicU8::new(ProxyPhase::Idle as u8))),
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn partition_index(&self) -> usize {
        self.partition_index
    }

    pub fn requirement(&self) -> &ResourceVector {
        &self.requirement
    }

    pub fn phase(&self) -> ProxyPhase {
        self.phase.load()
    }

    /// Runs one invocation of this client.
    ///
    /// The stored state is replaced only if the compute step succeeds; on
    /// any failure it is left as it was. A second call while one is in
    /// flight fails with a `Busy` failure.
    ///
    /// Once the state write has started it runs to completion even if this
    /// future is dropped, and the proxy stays out of `Idle` until it ends.
    pub async fn invoke(&self, input: Instruction) -> Result<Reply, ClientFailure> {
        if !self
            .phase
            .transition(ProxyPhase::Idle, ProxyPhase::Dispatched)
        {
            return Err(ClientFailure::busy(format!(
                "client {} already has an invocation in flight ({})",
                self.id,
                self.phase.load()
            )));
        }
        let idle = BackToIdle(self.phase.clone());

        let (result, idle) = self.dispatch(input, idle).await;
        if let Err(failure) = &result {
            tracing::debug!("Client {} failed: {}", self.id, failure);
        }
        if let Some(_idle) = idle {
            self.phase.store(match &result {
                Ok(_) => ProxyPhase::Completed,
                Err(_) => ProxyPhase::Failed,
            });
        }
        result
    }

    /// Returns the guard unless it was lost with a panicked persist task.
    async fn dispatch(
        &self,
        input: Instruction,
        idle: BackToIdle,
    ) -> (Result<Reply, ClientFailure>, Option<BackToIdle>) {
        let state = match self.store.get(&self.id).await {
            Ok(state) => state,
            Err(e) => {
                let failure =
                    ClientFailure::store(format!("failed to fetch state of client {}: {e}", self.id));
                return (Err(failure), Some(idle));
            }
        };

        let phase = self.phase.clone();
        let item = WorkItem::new(self.id.clone(), self.requirement.clone(), self.app.clone())
            .with_partition(self.partition_index)
            .with_state(state)
            .with_input(input)
            .on_start(move |_| phase.store(ProxyPhase::Running));

        let handle = match self.pool.submit(item) {
            Ok(handle) => handle,
            Err(e) => return (Err(ClientFailure::from_submit_error(&e)), Some(idle)),
        };
        let mut outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(failure) => return (Err(failure), Some(idle)),
        };
        outcome.state.bump_version();

        let store = self.store.clone();
        let id = self.id.clone();
        let persist = tokio::spawn(async move {
            let version = outcome.state.version();
            let result = match store.put(&id, outcome.state).await {
                Ok(()) => {
                    tracing::trace!(
                        "Client {} completed on {} (state version {})",
                        id,
                        outcome.slot,
                        version
                    );
                    Ok(outcome.reply)
                }
                Err(e) => Err(ClientFailure::store(format!(
                    "failed to persist state of client {id}: {e}"
                ))),
            };
            (result, idle)
        });

        match persist.await {
            Ok((result, idle)) => (result, Some(idle)),
            Err(e) => (
                Err(ClientFailure::store(format!(
                    "persisting state of client {} did not finish: {e}",
                    self.id
                ))),
                None,
            ),
        }
    }
}

impl fmt::Debug for VirtualClientProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualClientProxy")
            .field("id", &self.id)
            .field("partition_index", &self.partition_index)
            .field("requirement", &self.requirement)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, StateBackendType};
    use crate::error::{FailureKind, Result, SimError};
    use crate::resources::NUM_CPUS;
    use crate::state::{ClientState, MemoryStateStore};
    use crate::test_apps::{read_count, CountingApp, GateApp, COUNT_KEY};
    use async_trait::async_trait;
    use std::time::Duration;

    fn proxy_with(
        id: &str,
        app: Arc<dyn ClientApp>,
        store: Arc<dyn ClientStateStore>,
        pool: &WorkerPool,
    ) -> VirtualClientProxy {
        VirtualClientProxy::new(
            ClientId::new(id),
            0,
            ResourceVector::cpus(1.0),
            app,
            store,
            pool.clone(),
        )
    }

    fn pool(slots: usize) -> WorkerPool {
        WorkerPool::open(&PoolConfig::uniform(slots, ResourceVector::cpus(1.0))).unwrap()
    }

    #[tokio::test]
    async fn test_state_carries_across_invocations() {
        let pool = pool(1);
        let store = Arc::new(MemoryStateStore::new());
        let proxy = proxy_with("a", Arc::new(CountingApp::new()), store.clone(), &pool);

        for round in 1..=3u64 {
            let reply = proxy.invoke(Instruction::new(round)).await.unwrap();
            assert_eq!(reply.metrics[COUNT_KEY], round as f64);
            assert_eq!(proxy.phase(), ProxyPhase::Idle);
        }

        let state = store.get(&ClientId::new("a")).await.unwrap();
        assert_eq!(state.version(), 3);
        assert_eq!(read_count(state.entry(COUNT_KEY)), 3);
    }

    #[tokio::test]
    async fn test_failure_leaves_state_untouched() {
        let pool = pool(1);
        let store = Arc::new(MemoryStateStore::new());
        let id = ClientId::new("a");

        let mut prior = ClientState::default();
        prior.set_entry(COUNT_KEY, 5u64.to_le_bytes().to_vec());
        store.put(&id, prior.clone()).await.unwrap();

        let app = Arc::new(CountingApp::new().failing(["a"]));
        let proxy = proxy_with("a", app, store.clone(), &pool);

        let failure = proxy.invoke(Instruction::new(1)).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Invocation);
        assert_eq!(store.get(&id).await.unwrap(), prior);
        assert_eq!(proxy.phase(), ProxyPhase::Idle);
    }

    #[tokio::test]
    async fn test_second_dispatch_is_busy() {
        let pool = pool(1);
        let (app, mut started, gate) = GateApp::new();
        let proxy = Arc::new(proxy_with("a", app, Arc::new(MemoryStateStore::new()), &pool));

        let first = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.invoke(Instruction::new(1)).await }
        });
        started.recv().await.unwrap();
        assert_eq!(proxy.phase(), ProxyPhase::Running);

        let busy = proxy.invoke(Instruction::new(1)).await.unwrap_err();
        assert_eq!(busy.kind, FailureKind::Busy);

        gate.add_permits(1);
        assert!(first.await.unwrap().is_ok());
        assert_eq!(proxy.phase(), ProxyPhase::Idle);
        assert_eq!(pool.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_waiting_for_slot_is_dispatched() {
        let pool = pool(1);
        let (app, mut started, gate) = GateApp::new();
        let store: Arc<dyn ClientStateStore> = Arc::new(MemoryStateStore::new());
        let a = Arc::new(proxy_with("a", app.clone(), store.clone(), &pool));
        let b = Arc::new(proxy_with("b", app, store, &pool));

        let run_a = tokio::spawn({
            let a = a.clone();
            async move { a.invoke(Instruction::new(1)).await }
        });
        started.recv().await.unwrap();
        let run_b = tokio::spawn({
            let b = b.clone();
            async move { b.invoke(Instruction::new(1)).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(b.phase(), ProxyPhase::Dispatched);

        gate.add_permits(2);
        assert!(run_a.await.unwrap().is_ok());
        assert!(run_b.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_oversized_requirement_is_resource_exhausted() {
        let pool = pool(1);
        let proxy = VirtualClientProxy::new(
            ClientId::new("big"),
            0,
            ResourceVector::cpus(2.0),
            Arc::new(CountingApp::new()),
            Arc::new(MemoryStateStore::new()),
            pool.clone(),
        );

        let failure = proxy.invoke(Instruction::new(1)).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::ResourceExhausted);
        assert_eq!(proxy.phase(), ProxyPhase::Idle);
    }

    #[tokio::test]
    async fn test_closed_pool() {
        let pool = pool(1);
        pool.close().await;
        let proxy = proxy_with(
            "a",
            Arc::new(CountingApp::new()),
            Arc::new(MemoryStateStore::new()),
            &pool,
        );

        let failure = proxy.invoke(Instruction::new(1)).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Closed);
    }

    struct BrokenStore;

    #[async_trait]
    impl ClientStateStore for BrokenStore {
        async fn get(&self, _id: &ClientId) -> Result<ClientState> {
            Err(SimError::storage("/broken", "disk on fire"))
        }

        async fn put(&self, _id: &ClientId, _state: ClientState) -> Result<()> {
            Err(SimError::storage("/broken", "disk on fire"))
        }

        async fn len(&self) -> Result<usize> {
            Ok(0)
        }

        fn backend_type(&self) -> StateBackendType {
            StateBackendType::Filesystem
        }
    }

    #[tokio::test]
    async fn test_store_error_is_store_failure() {
        let pool = pool(1);
        let proxy = proxy_with("a", Arc::new(CountingApp::new()), Arc::new(BrokenStore), &pool);

        let failure = proxy.invoke(Instruction::new(1)).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Store);
        assert!(failure.message.contains("disk on fire"));
        // Nothing was submitted
        assert_eq!(pool.stats().completed, 0);
    }

    /// Delays every write so an invocation can be dropped mid-persist.
    struct SlowStore {
        inner: MemoryStateStore,
        delay: Duration,
    }

    #[async_trait]
    impl ClientStateStore for SlowStore {
        async fn get(&self, id: &ClientId) -> Result<ClientState> {
            self.inner.get(id).await
        }

        async fn put(&self, id: &ClientId, state: ClientState) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.put(id, state).await
        }

        async fn len(&self) -> Result<usize> {
            self.inner.len().await
        }

        fn backend_type(&self) -> StateBackendType {
            StateBackendType::Memory
        }
    }

    #[tokio::test]
    async fn test_dropped_during_persist_finishes_write_before_idle() {
        let pool = pool(1);
        let store = Arc::new(SlowStore {
            inner: MemoryStateStore::new(),
            delay: Duration::from_millis(200),
        });
        let proxy = proxy_with("a", Arc::new(CountingApp::new()), store.clone(), &pool);

        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), proxy.invoke(Instruction::new(1))).await;
        assert!(timed_out.is_err());

        // The write is still in flight, so the client is not reusable yet
        assert_ne!(proxy.phase(), ProxyPhase::Idle);
        let busy = proxy.invoke(Instruction::new(2)).await.unwrap_err();
        assert_eq!(busy.kind, FailureKind::Busy);
        assert_eq!(pool.slots()[0].available.get(NUM_CPUS), 1.0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(proxy.phase(), ProxyPhase::Idle);
        let state = store.get(&ClientId::new("a")).await.unwrap();
        assert_eq!(state.version(), 1);
        assert_eq!(read_count(state.entry(COUNT_KEY)), 1);

        // The next invocation sees the completed write
        let reply = proxy.invoke(Instruction::new(2)).await.unwrap();
        assert_eq!(reply.metrics[COUNT_KEY], 2.0);
    }

    #[tokio::test]
    async fn test_dropped_invocation_releases_slot() {
        let pool = pool(1);
        let app = Arc::new(CountingApp::new().stalling(["slow"]));
        let proxy = proxy_with("slow", app, Arc::new(MemoryStateStore::new()), &pool);

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), proxy.invoke(Instruction::new(1))).await;
        assert!(timed_out.is_err());

        assert_eq!(proxy.phase(), ProxyPhase::Idle);
        assert_eq!(pool.slots()[0].available.get(NUM_CPUS), 1.0);
        assert_eq!(pool.stats().cancelled, 1);
    }
}
