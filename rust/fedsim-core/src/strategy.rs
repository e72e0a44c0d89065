// rust/fedsim-core/src/strategy.rs

//! Client selection and result aggregation policies.

use std::collections::BTreeMap;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::client::{ClientId, Instruction, Reply};
use crate::error::{ClientFailure, Result, SimError};

/// Aggregated outcome of one round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Total examples over completed clients.
    pub num_examples: u64,
    pub metrics: BTreeMap<String, f64>,
    /// New global parameters, if the strategy produces any.
    pub parameters: Bytes,
}

/// Policy deciding who participates in each round and how their results
/// are combined.
///
/// The coordinator calls `configure_round` then, once every selected client
/// has completed or failed, `aggregate` with both sets.
pub trait Strategy: Send {
    /// Picks the clients for `round` from `available` and the instruction
    /// each receives. Returning nobody is allowed and yields an empty round.
    fn configure_round(&mut self, round: u64, available: &[ClientId])
        -> Vec<(ClientId, Instruction)>;

    fn aggregate(
        &mut self,
        round: u64,
        results: &[(ClientId, Reply)],
        failures: &[(ClientId, ClientFailure)],
    ) -> Aggregate;
}

/// Samples a fixed fraction of clients uniformly at random and averages
/// their metrics weighted by example count.
#[derive(Debug)]
pub struct UniformSampling {
    fraction: f64,
    min_clients: usize,
    rng: StdRng,
    parameters: Bytes,
    config: BTreeMap<String, String>,
}

impl UniformSampling {
    /// # Errors
    ///
    /// Returns a configuration error unless `0 < fraction <= 1`.
    pub fn new(fraction: f64) -> Result<Self> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(SimError::config(format!(
                "sampling fraction must be in (0, 1], got {fraction}"
            )));
        }
        Ok(Self {
            fraction,
            min_clients: 1,
            rng: StdRng::from_entropy(),
            parameters: Bytes::new(),
            config: BTreeMap::new(),
        })
    }

    /// Selects every client each round.
    pub fn all() -> Self {
        Self {
            fraction: 1.0,
            min_clients: 1,
            rng: StdRng::from_entropy(),
            parameters: Bytes::new(),
            config: BTreeMap::new(),
        }
    }

    /// Makes sampling reproducible.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    #[must_use]
    pub fn with_min_clients(mut self, min_clients: usize) -> Self {
        self.min_clients = min_clients;
        self
    }

    /// Initial global parameters sent to clients.
    #[must_use]
    pub fn with_parameters(mut self, parameters: impl Into<Bytes>) -> Self {
        self.parameters = parameters.into();
        self
    }

    /// Adds a key passed to every client in its instruction.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Number of clients selected out of `available`.
    pub fn sample_size(&self, available: usize) -> usize {
        let wanted = (self.fraction * available as f64).ceil() as usize;
        wanted.max(self.min_clients).min(available)
    }
}

impl Strategy for UniformSampling {
    fn configure_round(
        &mut self,
        round: u64,
        available: &[ClientId],
    ) -> Vec<(ClientId, Instruction)> {
        let n = self.sample_size(available.len());
        let mut selected: Vec<ClientId> = available
            .choose_multiple(&mut self.rng, n)
            .cloned()
            .collect();
        selected.sort();

        selected
            .into_iter()
            .map(|id| {
                let instruction = Instruction {
                    round,
                    parameters: self.parameters.clone(),
                    config: self.config.clone(),
                };
                (id, instruction)
            })
            .collect()
    }

    fn aggregate(
        &mut self,
        _round: u64,
        results: &[(ClientId, Reply)],
        _failures: &[(ClientId, ClientFailure)],
    ) -> Aggregate {
        let num_examples: u64 = results.iter().map(|(_, r)| r.num_examples).sum();

        // metric name -> (weighted sum, total weight)
        let mut sums: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
        for (_, reply) in results {
            // Without any examples every reply counts equally
            let weight = if num_examples == 0 {
                1.0
            } else {
                reply.num_examples as f64
            };
            for (name, value) in &reply.metrics {
                let entry = sums.entry(name.as_str()).or_insert((0.0, 0.0));
                entry.0 += value * weight;
                entry.1 += weight;
            }
        }

        let metrics = sums
            .into_iter()
            .filter(|(_, (_, weight))| *weight > 0.0)
            .map(|(name, (sum, weight))| (name.to_string(), sum / weight))
            .collect();

        Aggregate {
            num_examples,
            metrics,
            parameters: self.parameters.clone(),
        }
    }
}
