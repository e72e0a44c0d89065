// rust/fedsim-core/src/simulation.rs

//! The simulation launch call.
//!
//! Everything that can be wrong with the arguments is checked before the
//! state store or the worker pool is created, so a bad launch allocates
//! nothing and runs no client code.

use std::collections::HashSet;
use std::sync::Arc;

use crate::client::{ClientApp, ClientId};
use crate::config::SimulationConfig;
use crate::coordinator::RoundCoordinator;
use crate::dataset::FederatedDataset;
use crate::error::{Result, SimError};
use crate::history::History;
use crate::pool::WorkerPool;
use crate::proxy::VirtualClientProxy;
use crate::resources::ResourceVector;
use crate::state::{open_state_store, ClientStateStore};
use crate::strategy::{Strategy, UniformSampling};

/// Resolves the logical client ids of a run.
///
/// Explicit ids win; `num_clients` alone yields `"0".."n-1"`. When both are
/// given their counts must agree.
///
/// # Errors
///
/// Returns a configuration error if neither is given, the counts disagree,
/// no client remains, or an id repeats.
pub fn resolve_client_ids(
    num_clients: Option<usize>,
    client_ids: Option<Vec<ClientId>>,
) -> Result<Vec<ClientId>> {
    let ids = match (num_clients, client_ids) {
        (Some(n), Some(ids)) if n != ids.len() => {
            return Err(SimError::config(format!(
                "number of client_ids ({}) does not match num_clients ({n})",
                ids.len()
            )));
        }
        (_, Some(ids)) => ids,
        (Some(n), None) => (0..n).map(ClientId::from).collect(),
        (None, None) => {
            return Err(SimError::config(
                "either num_clients or client_ids must be given",
            ));
        }
    };

    if ids.is_empty() {
        return Err(SimError::config(
            "no selectable clients: at least one client is required",
        ));
    }
    let mut seen = HashSet::with_capacity(ids.len());
    for id in &ids {
        if !seen.insert(id) {
            return Err(SimError::config(format!("duplicate client id '{id}'")));
        }
    }
    Ok(ids)
}

/// Builder for one simulation run.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use fedsim_core::simulation::Simulation;
/// use fedsim_core::strategy::UniformSampling;
/// # use fedsim_core::client::ClientApp;
///
/// # async fn example(app: Arc<dyn ClientApp>) -> fedsim_core::Result<()> {
/// let history = Simulation::builder(app)
///     .num_clients(100)
///     .strategy(UniformSampling::new(0.1)?.with_seed(42))
///     .run()
///     .await?;
/// println!("ran {} rounds", history.len());
/// # Ok(())
/// # }
/// ```
pub struct Simulation {
    app: Arc<dyn ClientApp>,
    num_clients: Option<usize>,
    client_ids: Option<Vec<ClientId>>,
    config: SimulationConfig,
    resources: Option<ResourceVector>,
    strategy: Option<Box<dyn Strategy>>,
    store: Option<Arc<dyn ClientStateStore>>,
    dataset: Option<(Arc<FederatedDataset>, String)>,
}

impl Simulation {
    pub fn builder(app: Arc<dyn ClientApp>) -> Self {
        Self {
            app,
            num_clients: None,
            client_ids: None,
            config: SimulationConfig::default(),
            resources: None,
            strategy: None,
            store: None,
            dataset: None,
        }
    }

    #[must_use]
    pub fn num_clients(mut self, n: usize) -> Self {
        self.num_clients = Some(n);
        self
    }

    #[must_use]
    pub fn client_ids<I: Into<ClientId>>(mut self, ids: impl IntoIterator<Item = I>) -> Self {
        self.client_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn config(mut self, config: SimulationConfig) -> Self {
        self.config = config;
        self
    }

    /// Per-client requirement; overrides `client.resources` of the config.
    #[must_use]
    pub fn client_resources(mut self, resources: ResourceVector) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Defaults to selecting every client each round.
    #[must_use]
    pub fn strategy(mut self, strategy: impl Strategy + 'static) -> Self {
        self.strategy = Some(Box::new(strategy));
        self
    }

    /// Uses `store` instead of the backend selected by `state.backend`.
    #[must_use]
    pub fn state_store(mut self, store: Arc<dyn ClientStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Declares that clients read partitions of `split`; the launch then
    /// requires one partition per client.
    #[must_use]
    pub fn partitioned_split(mut self, dataset: Arc<FederatedDataset>, split: impl Into<String>) -> Self {
        self.dataset = Some((dataset, split.into()));
        self
    }

    /// Validates the launch, runs every round and returns the history.
    ///
    /// # Errors
    ///
    /// Only configuration or setup errors. Client failures are recorded in
    /// the history instead.
    pub async fn run(self) -> Result<History> {
        let Self {
            app,
            num_clients,
            client_ids,
            mut config,
            resources,
            strategy,
            store,
            dataset,
        } = self;

        let ids = resolve_client_ids(num_clients, client_ids)?;
        if let Some(resources) = resources {
            config.client.resources = resources;
        }
        config.validate()?;
        if let Some((dataset, split)) = &dataset {
            check_partitions(dataset, split, ids.len())?;
        }

        let store = match store {
            Some(store) => store,
            None => open_state_store(&config.state).await?,
        };
        let pool = WorkerPool::open(&config.pool)?;

        let proxies = ids
            .iter()
            .enumerate()
            .map(|(index, id)| {
                Arc::new(VirtualClientProxy::new(
                    id.clone(),
                    index,
                    config.client.resources.clone(),
                    app.clone(),
                    store.clone(),
                    pool.clone(),
                ))
            })
            .collect();
        let coordinator = RoundCoordinator::new(proxies, config.rounds.clone())?;

        tracing::info!(
            "Launching simulation: {} client(s), {} round(s), {} slot(s), {:?} state, {} per client",
            ids.len(),
            config.rounds.num_rounds,
            config.pool.slots.len(),
            store.backend_type(),
            config.client.resources
        );

        let mut strategy = strategy.unwrap_or_else(|| Box::new(UniformSampling::all()));
        let history = coordinator.run(strategy.as_mut()).await;
        pool.close().await;

        tracing::info!(
            "Simulation {} finished: {} round(s), {} client failure(s)",
            history.run_id(),
            history.len(),
            history.total_failures()
        );
        Ok(history)
    }
}

fn check_partitions(dataset: &FederatedDataset, split: &str, clients: usize) -> Result<()> {
    if !dataset.splits().iter().any(|s| s == split) {
        return Err(SimError::SplitNotFound {
            split: split.to_string(),
            available: dataset.splits(),
        });
    }
    let Some(partitioner) = dataset.partitioner(split) else {
        return Err(SimError::NoPartitioner {
            split: split.to_string(),
            available: dataset.partitioned_splits(),
        });
    };
    if partitioner.num_partitions() != clients {
        return Err(SimError::config(format!(
            "split '{split}' has {} partition(s) but the run has {clients} client(s)",
            partitioner.num_partitions()
        )));
    }
    Ok(())
}

/// Runs a simulation with the default strategy.
///
/// Shorthand for [`Simulation::builder`] with `num_clients`, `client_ids`
/// and `config` set.
pub async fn start_simulation(
    app: Arc<dyn ClientApp>,
    num_clients: Option<usize>,
    client_ids: Option<Vec<ClientId>>,
    config: SimulationConfig,
) -> Result<History> {
    let mut builder = Simulation::builder(app).config(config);
    builder.num_clients = num_clients;
    builder.client_ids = client_ids;
    builder.run().await
}
