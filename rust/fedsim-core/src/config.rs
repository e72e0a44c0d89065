// rust/fedsim-core/src/config.rs

//! Configuration management for simulation runs.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::resources::{ResourceVector, NUM_CPUS};

// Top-level simulation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub rounds: RoundConfig,
    pub pool: PoolConfig,
    pub client: ClientConfig,
    pub state: StateConfig,
    pub dataset: DatasetConfig,
}

/// Round loop options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Number of rounds to run.
    pub num_rounds: u64,
    /// Per-round deadline in milliseconds. No deadline when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_timeout_ms: Option<u64>,
    /// Stop the run after a round in which every dispatched client failed.
    pub abort_on_total_failure: bool,
}

impl RoundConfig {
    pub fn round_timeout(&self) -> Option<Duration> {
        self.round_timeout_ms.map(Duration::from_millis)
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on simultaneously running items, regardless of resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
    /// Capacity of each physical slot.
    pub slots: Vec<ResourceVector>,
}

impl PoolConfig {
    /// A pool of `count` identical slots.
    pub fn uniform(count: usize, capacity: ResourceVector) -> Self {
        Self {
            max_in_flight: None,
            slots: vec![capacity; count],
        }
    }

    /// Returns true if `requirement` fits at least one slot on its own.
    pub fn can_ever_fit(&self, requirement: &ResourceVector) -> bool {
        self.slots.iter().any(|slot| requirement.fits_within(slot))
    }

    pub fn validate(&self) -> Result<()> {
        if self.slots.is_empty() {
            return Err(SimError::config("pool.slots must contain at least one slot"));
        }
        for (i, slot) in self.slots.iter().enumerate() {
            slot.validate(&format!("pool.slots[{i}]"))?;
        }
        if self.max_in_flight == Some(0) {
            return Err(SimError::config(
                "pool.max_in_flight must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Per-client options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Resources a single client invocation reserves.
    pub resources: ResourceVector,
}

/// Client state backend type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendType {
    /// Held in process memory; lost on exit.
    #[default]
    Memory,
    /// Persisted as one object per client under `base_path`.
    Filesystem,
}

impl FromStr for StateBackendType {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "filesystem" | "fs" => Ok(Self::Filesystem),
            other => Err(SimError::config(format!(
                "unknown state backend '{other}'. Expected 'memory' or 'filesystem'"
            ))),
        }
    }
}

/// Client state store options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackendType,
    // Root directory for the filesystem backend.
    pub base_path: PathBuf,
    // Whether to write to a temporary object and rename into place.
    pub atomic_writes: bool,
}

/// Federated dataset options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    // Dataset name used in log messages and errors.
    pub name: String,
    // Directory that split files are resolved against.
    pub base_path: PathBuf,
    // Record format: "newline", "fixed:N" or "length-prefixed".
    pub format: String,
    // Optional seed for shuffled partitioning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    // Split name to file path.
    pub splits: BTreeMap<String, PathBuf>,
    // Split name to number of partitions.
    pub partitioners: BTreeMap<String, usize>,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            num_rounds: 1,
            round_timeout_ms: None,
            abort_on_total_failure: false,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_in_flight: None,
            slots: vec![ResourceVector::new().with(NUM_CPUS, cores as f64)],
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            resources: ResourceVector::cpus(1.0),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackendType::Memory,
            base_path: PathBuf::from("./client_state"),
            atomic_writes: true,
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: "dataset".to_string(),
            base_path: PathBuf::from("./data"),
            format: "newline".to_string(),
            seed: None,
            splits: BTreeMap::new(),
            partitioners: BTreeMap::new(),
        }
    }
}

impl FromStr for SimulationConfig {
    type Err = SimError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| SimError::config_with_source("failed to parse TOML config", e))
    }
}

impl SimulationConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SimError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `FEDSIM_`. For example:
    // - `FEDSIM_NUM_ROUNDS` overrides `rounds.num_rounds`
    // - `FEDSIM_STATE_BACKEND` overrides `state.backend` ("memory" or "filesystem")
    // - `FEDSIM_DATASET_SEED` overrides `dataset.seed`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Round overrides
        if let Ok(val) = std::env::var("FEDSIM_NUM_ROUNDS") {
            if let Ok(v) = val.parse() {
                self.rounds.num_rounds = v;
            }
        }
        if let Ok(val) = std::env::var("FEDSIM_ROUND_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.rounds.round_timeout_ms = Some(v);
            }
        }
        if let Ok(val) = std::env::var("FEDSIM_ABORT_ON_TOTAL_FAILURE") {
            if let Ok(v) = val.parse() {
                self.rounds.abort_on_total_failure = v;
            }
        }

        // Pool overrides
        if let Ok(val) = std::env::var("FEDSIM_POOL_MAX_IN_FLIGHT") {
            if let Ok(v) = val.parse() {
                self.pool.max_in_flight = Some(v);
            }
        }

        // State overrides
        if let Ok(val) = std::env::var("FEDSIM_STATE_BACKEND") {
            if let Ok(v) = val.parse() {
                self.state.backend = v;
            }
        }
        if let Ok(val) = std::env::var("FEDSIM_STATE_BASE_PATH") {
            self.state.base_path = PathBuf::from(val);
        }

        // Dataset overrides
        if let Ok(val) = std::env::var("FEDSIM_DATASET_BASE_PATH") {
            self.dataset.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("FEDSIM_DATASET_SEED") {
            if let Ok(v) = val.parse() {
                self.dataset.seed = Some(v);
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.rounds.num_rounds == 0 {
            return Err(SimError::config(
                "rounds.num_rounds must be greater than 0",
            ));
        }
        if self.rounds.round_timeout_ms == Some(0) {
            return Err(SimError::config(
                "rounds.round_timeout_ms must be greater than 0",
            ));
        }

        self.pool.validate()?;
        self.client.resources.validate("client.resources")?;

        if !self.pool.can_ever_fit(&self.client.resources) {
            return Err(SimError::config(format!(
                "client.resources {} exceed the capacity of every pool slot",
                self.client.resources
            )));
        }

        if self.state.backend == StateBackendType::Filesystem
            && self.state.base_path.as_os_str().is_empty()
        {
            return Err(SimError::config(
                "state.base_path is required for the filesystem backend",
            ));
        }

        for (split, count) in &self.dataset.partitioners {
            if *count == 0 {
                return Err(SimError::config(format!(
                    "dataset.partitioners.{split} must be greater than 0"
                )));
            }
        }

        Ok(())
    }
}
