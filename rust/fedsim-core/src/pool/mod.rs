// rust/fedsim-core/src/pool/mod.rs

//! Resource-constrained worker pool.
//!
//! The pool owns a fixed set of slots, each with a capacity vector. Submitted
//! work waits in a FIFO queue until the oldest item fits on a single slot (and
//! the optional in-flight cap allows it), then runs as a task on the tokio
//! runtime the pool was opened on.
//!
//! The queue, the running table and the capacity ledger share one mutex, so
//! every reservation and release is a single atomic step. Capacity is released
//! exactly once per item: whichever of completion, cancellation or task
//! teardown removes the running entry first gives the capacity back.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fedsim_core::config::PoolConfig;
//! use fedsim_core::pool::{WorkItem, WorkerPool};
//! use fedsim_core::resources::ResourceVector;
//! # use fedsim_core::client::ClientApp;
//! # async fn example(app: Arc<dyn ClientApp>) -> fedsim_core::Result<()> {
//! let pool = WorkerPool::open(&PoolConfig::uniform(2, ResourceVector::cpus(1.0)))?;
//! let handle = pool.submit(WorkItem::new("client-0", ResourceVector::cpus(1.0), app))?;
//! let outcome = handle.await;
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

mod ledger;

pub use ledger::{SlotId, SlotSnapshot};

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use futures::FutureExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;

use crate::client::{ClientApp, ClientContext, ClientId, Instruction, Reply};
use crate::config::PoolConfig;
use crate::error::{ClientFailure, Result, SimError};
use crate::resources::ResourceVector;
use crate::state::ClientState;
use ledger::CapacityLedger;

/// Identifier of a submitted work item, unique per pool.
pub type WorkId = u64;

/// Result delivered for one work item.
pub type WorkResult = std::result::Result<TaskOutcome, ClientFailure>;

type StartHook = Box<dyn FnOnce(SlotId) + Send>;

/// One unit of scheduled work: a client invocation with its requirement.
pub struct WorkItem {
    pub client_id: ClientId,
    pub partition_index: usize,
    pub requirement: ResourceVector,
    pub app: Arc<dyn ClientApp>,
    /// State attached to the invocation; returned in the outcome on success.
    pub state: ClientState,
    pub input: Instruction,
    on_start: Option<StartHook>,
}

impl WorkItem {
    pub fn new(
        client_id: impl Into<ClientId>,
        requirement: ResourceVector,
        app: Arc<dyn ClientApp>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            partition_index: 0,
            requirement,
            app,
            state: ClientState::default(),
            input: Instruction::default(),
            on_start: None,
        }
    }

    #[must_use]
    pub fn with_partition(mut self, partition_index: usize) -> Self {
        self.partition_index = partition_index;
        self
    }

    #[must_use]
    pub fn with_state(mut self, state: ClientState) -> Self {
        self.state = state;
        self
    }

    #[must_use]
    pub fn with_input(mut self, input: Instruction) -> Self {
        self.input = input;
        self
    }

    /// Registers a hook that runs once a slot has been assigned, before the
    /// compute step starts.
    #[must_use]
    pub fn on_start(mut self, hook: impl FnOnce(SlotId) + Send + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("client_id", &self.client_id)
            .field("partition_index", &self.partition_index)
            .field("requirement", &self.requirement)
            .finish_non_exhaustive()
    }
}

/// Successful outcome of a work item.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub reply: Reply,
    /// The client state as left by the compute step.
    pub state: ClientState,
    pub slot: SlotId,
}

/// Counters describing the pool's current load and history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

struct Pending {
    id: WorkId,
    item: WorkItem,
    reply: oneshot::Sender<WorkResult>,
}

struct Assignment {
    slot: SlotId,
    requirement: ResourceVector,
    abort: Option<AbortHandle>,
}

struct Scheduler {
    ledger: CapacityLedger,
    max_in_flight: Option<usize>,
    pending: VecDeque<Pending>,
    running: HashMap<WorkId, Assignment>,
    next_id: WorkId,
    closed: bool,
    stats: PoolStats,
}

impl Scheduler {
    fn outstanding(&self) -> usize {
        self.pending.len() + self.running.len()
    }

    /// Removes a running entry and returns its capacity. `None` if the entry
    /// was already gone.
    fn release(&mut self, id: WorkId) -> Option<Assignment> {
        let assignment = self.running.remove(&id)?;
        self.ledger.release(assignment.slot, &assignment.requirement);
        tracing::debug!(
            "Released {} from {} for work item {}",
            assignment.requirement,
            assignment.slot,
            id
        );
        Some(assignment)
    }
}

struct PoolInner {
    scheduler: Mutex<Scheduler>,
    runtime: Handle,
    outstanding: watch::Sender<usize>,
}

/// How a running entry is being removed.
#[derive(Debug, Clone, Copy)]
enum Exit {
    Completed,
    Failed,
    Cancelled,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, sched: &Scheduler) {
        self.outstanding.send_replace(sched.outstanding());
    }

    /// Starts pending items in FIFO order while the head item fits.
    fn schedule(self: &Arc<Self>, sched: &mut Scheduler) {
        loop {
            if let Some(max) = sched.max_in_flight {
                if sched.running.len() >= max {
                    break;
                }
            }
            let Some(front) = sched.pending.front() else {
                break;
            };
            let Some(slot) = sched.ledger.try_reserve(&front.item.requirement) else {
                break;
            };
            let Some(pending) = sched.pending.pop_front() else {
                break;
            };

            let id = pending.id;
            tracing::debug!(
                "Assigned work item {} (client {}, {}) to {}",
                id,
                pending.item.client_id,
                pending.item.requirement,
                slot
            );
            sched.running.insert(
                id,
                Assignment {
                    slot,
                    requirement: pending.item.requirement.clone(),
                    abort: None,
                },
            );

            // The task cannot finish before its abort handle is recorded: it
            // needs this lock to do so.
            let task = run_item(Arc::downgrade(self), id, slot, pending);
            let join = self.runtime.spawn(task);
            if let Some(entry) = sched.running.get_mut(&id) {
                entry.abort = Some(join.abort_handle());
            }
        }
    }

    /// Removes a running entry, updates counters and starts queued work.
    fn finish(self: &Arc<Self>, id: WorkId, exit: Exit) -> bool {
        let mut sched = self.lock();
        let removed = sched.release(id).is_some();
        if removed {
            match exit {
                Exit::Completed => sched.stats.completed += 1,
                Exit::Failed => sched.stats.failed += 1,
                Exit::Cancelled => sched.stats.cancelled += 1,
            }
            self.schedule(&mut sched);
            self.publish(&sched);
        }
        removed
    }

    fn cancel(self: &Arc<Self>, id: WorkId) -> bool {
        let mut sched = self.lock();

        if let Some(pos) = sched.pending.iter().position(|p| p.id == id) {
            // Dropping the entry drops its reply sender.
            sched.pending.remove(pos);
            sched.stats.cancelled += 1;
            tracing::debug!("Cancelled pending work item {}", id);
            // The head may have been the blocker.
            self.schedule(&mut sched);
            self.publish(&sched);
            return true;
        }

        if let Some(assignment) = sched.release(id) {
            if let Some(abort) = assignment.abort {
                abort.abort();
            }
            sched.stats.cancelled += 1;
            tracing::debug!("Cancelled running work item {}", id);
            self.schedule(&mut sched);
            self.publish(&sched);
            return true;
        }

        false
    }
}

/// Releases the running entry if the task is torn down without reporting,
/// e.g. when it is aborted or the runtime shuts down.
struct ReleaseGuard {
    pool: Weak<PoolInner>,
    id: WorkId,
    armed: bool,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Some(inner) = self.pool.upgrade() {
                inner.finish(self.id, Exit::Cancelled);
            }
        }
    }
}

async fn run_item(pool: Weak<PoolInner>, id: WorkId, slot: SlotId, pending: Pending) {
    let mut guard = ReleaseGuard {
        pool,
        id,
        armed: true,
    };
    let Pending { item, reply, .. } = pending;
    let WorkItem {
        client_id,
        partition_index,
        app,
        state,
        input,
        on_start,
        ..
    } = item;

    if let Some(hook) = on_start {
        hook(slot);
    }

    let mut ctx = ClientContext::new(client_id, partition_index, slot, state);
    let result = AssertUnwindSafe(app.run(&mut ctx, input))
        .catch_unwind()
        .await;

    let (outcome, exit) = match result {
        Ok(Ok(reply)) => (
            Ok(TaskOutcome {
                reply,
                state: ctx.into_state(),
                slot,
            }),
            Exit::Completed,
        ),
        Ok(Err(e)) => (Err(ClientFailure::invocation(e.message)), Exit::Failed),
        Err(panic) => (
            Err(ClientFailure::invocation(format!(
                "client panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Exit::Failed,
        ),
    };

    guard.armed = false;
    let Some(inner) = guard.pool.upgrade() else {
        return;
    };
    // Capacity goes back before the submitter can observe the result.
    if inner.finish(id, exit) {
        let _ = reply.send(outcome);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A fixed set of execution slots shared by all logical clients.
///
/// Cloning is cheap and yields another handle to the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Opens a pool on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid or if called
    /// outside a tokio runtime.
    pub fn open(config: &PoolConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| {
            SimError::config_with_source("worker pool must be opened inside a tokio runtime", e)
        })?;

        let (outstanding, _) = watch::channel(0);
        let scheduler = Scheduler {
            ledger: CapacityLedger::new(&config.slots),
            max_in_flight: config.max_in_flight,
            pending: VecDeque::new(),
            running: HashMap::new(),
            next_id: 0,
            closed: false,
            stats: PoolStats::default(),
        };

        tracing::debug!(
            "Opened worker pool with {} slot(s), max in flight: {:?}",
            scheduler.ledger.len(),
            config.max_in_flight
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                scheduler: Mutex::new(scheduler),
                runtime,
                outstanding,
            }),
        })
    }

    /// Queues `item` and returns a handle resolving to its result.
    ///
    /// Dropping the handle before it resolves cancels the item.
    ///
    /// # Errors
    ///
    /// - [`SimError::Closed`] after [`WorkerPool::close`] was called.
    /// - A configuration error if the requirement holds an invalid amount or
    ///   exceeds every slot's capacity, since such an item could never be
    ///   scheduled.
    pub fn submit(&self, item: WorkItem) -> Result<WorkHandle> {
        let mut sched = self.inner.lock();

        if sched.closed {
            return Err(SimError::Closed);
        }
        item.requirement
            .validate(&format!("requirement of client {}", item.client_id))?;
        if !sched.ledger.can_ever_fit(&item.requirement) {
            return Err(SimError::config(format!(
                "requirement {} of client {} exceeds the capacity of every pool slot",
                item.requirement, item.client_id
            )));
        }

        let id = sched.next_id;
        sched.next_id += 1;
        let (tx, rx) = oneshot::channel();
        sched.pending.push_back(Pending {
            id,
            item,
            reply: tx,
        });

        self.inner.schedule(&mut sched);
        self.inner.publish(&sched);

        Ok(WorkHandle {
            id,
            rx,
            pool: Arc::downgrade(&self.inner),
            done: false,
        })
    }

    /// Cancels a pending or running item and releases its capacity before
    /// returning. Returns false if the item already finished.
    pub fn cancel(&self, id: WorkId) -> bool {
        self.inner.cancel(id)
    }

    /// Stops accepting work and waits for pending and running items to
    /// finish. Idempotent.
    pub async fn close(&self) {
        let mut outstanding = {
            let mut sched = self.inner.lock();
            if !sched.closed {
                tracing::debug!(
                    "Closing worker pool ({} item(s) outstanding)",
                    sched.outstanding()
                );
            }
            sched.closed = true;
            self.inner.outstanding.subscribe()
        };

        let _ = outstanding.wait_for(|n| *n == 0).await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let sched = self.inner.lock();
        PoolStats {
            pending: sched.pending.len(),
            running: sched.running.len(),
            ..sched.stats
        }
    }

    pub fn slots(&self) -> Vec<SlotSnapshot> {
        self.inner.lock().ledger.snapshot()
    }

    /// True if some slot could ever hold `requirement`.
    pub fn can_ever_fit(&self, requirement: &ResourceVector) -> bool {
        self.inner.lock().ledger.can_ever_fit(requirement)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Future resolving to a work item's result.
///
/// Resolves to a `Cancelled` failure if the item was cancelled. Dropping an
/// unresolved handle cancels the item.
#[derive(Debug)]
pub struct WorkHandle {
    id: WorkId,
    rx: oneshot::Receiver<WorkResult>,
    pool: Weak<PoolInner>,
    done: bool,
}

impl WorkHandle {
    pub fn id(&self) -> WorkId {
        self.id
    }

    /// Cancels the item. Returns false if it had already finished.
    pub fn cancel(mut self) -> bool {
        self.done = true;
        match self.pool.upgrade() {
            Some(inner) => inner.cancel(self.id),
            None => false,
        }
    }
}

impl Future for WorkHandle {
    type Output = WorkResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                self.done = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                self.done = true;
                Poll::Ready(Err(ClientFailure::cancelled(format!(
                    "work item {} was cancelled before completing",
                    self.id
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for WorkHandle {
    fn drop(&mut self) {
        if !self.done {
            if let Some(inner) = self.pool.upgrade() {
                inner.cancel(self.id);
            }
        }
    }
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolInner").finish_non_exhaustive()
    }
}
