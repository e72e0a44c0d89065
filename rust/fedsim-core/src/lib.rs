// rust/fedsim-core/src/lib.rs

//! Federated Learning Simulation - Core Library
//!
//! This crate runs many logical clients of a federated learning workload on
//! one machine. Clients are virtual: each is a lightweight proxy whose
//! compute step is scheduled onto a bounded worker pool only when a round
//! selects it, and whose state survives between rounds in a state store.
//!
//! The main entry points are [`Simulation`] (or [`start_simulation`]) for a
//! whole run, and [`FederatedDataset`] for partitioning a dataset across
//! clients.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod dataset;
pub mod error;
pub mod history;
pub mod pool;
pub mod proxy;
pub mod resources;
pub mod simulation;
pub mod state;
pub mod storage;
pub mod strategy;

#[cfg(test)]
mod test_apps;

// Re-export commonly used types for convenience
pub use client::{ClientApp, ClientContext, ClientError, ClientId, Instruction, Reply};
pub use config::{PoolConfig, RoundConfig, SimulationConfig, StateBackendType, StateConfig};
pub use error::{ClientFailure, FailureKind, Result, SimError};
pub use resources::ResourceVector;

pub use coordinator::RoundCoordinator;
pub use history::{ClientOutcome, History, RoundRecord};
pub use pool::{SlotId, WorkHandle, WorkItem, WorkerPool};
pub use proxy::{ProxyPhase, VirtualClientProxy};
pub use simulation::{start_simulation, Simulation};
pub use state::{open_state_store, ClientState, ClientStateStore};
pub use strategy::{Aggregate, Strategy, UniformSampling};

pub use dataset::{FederatedDataset, IidPartitioner, Partition, Rows};
