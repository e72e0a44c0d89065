//! Federated Learning Simulation Launcher
//!
//! Runs a simulation of many virtual clients with the demo mean-computing
//! client app and prints one summary line per round.
//!
//! # Usage
//!
//! ```bash
//! # 100 clients, 10% sampled per round, 5 rounds
//! fedsim --num-clients 100 --fraction 0.1 --rounds 5
//!
//! # Named clients, state kept on disk between rounds
//! fedsim --client-ids alice,bob,carol --state-backend filesystem --state-dir /tmp/fedsim
//!
//! # Start from a configuration file
//! fedsim --config simulation.toml
//! ```

mod demo;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use demo::{synthetic_dataset, MeanApp};
use fedsim_core::simulation::resolve_client_ids;
use fedsim_core::{
    ClientId, ClientOutcome, FederatedDataset, History, Simulation, SimulationConfig,
    StateBackendType, UniformSampling,
};

/// Federated learning simulation launcher
#[derive(Parser, Debug)]
#[command(name = "fedsim")]
#[command(about = "Runs virtual federated clients on a bounded local worker pool")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Number of clients, named "0".."n-1" unless --client-ids is given
    #[arg(short, long)]
    num_clients: Option<usize>,

    /// Comma-separated client ids
    #[arg(long, value_delimiter = ',')]
    client_ids: Option<Vec<String>>,

    /// Number of rounds
    #[arg(short, long)]
    rounds: Option<u64>,

    /// Per-round deadline in milliseconds
    #[arg(long)]
    round_timeout_ms: Option<u64>,

    /// Fraction of clients selected each round
    #[arg(short, long, default_value = "1.0")]
    fraction: f64,

    /// Seed for client sampling and data partitioning
    #[arg(long)]
    seed: Option<u64>,

    /// Client state backend (memory, filesystem)
    #[arg(long)]
    state_backend: Option<String>,

    /// Directory for the filesystem state backend
    #[arg(long)]
    state_dir: Option<String>,

    /// Split that clients read their partition of
    #[arg(long, default_value = "train")]
    split: String,

    /// Rows in the synthetic split when no dataset splits are configured
    #[arg(long, default_value = "1000")]
    data_rows: usize,

    /// Make every n-th client fail (0 disables)
    #[arg(long, default_value = "0")]
    fail_every: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => SimulationConfig::from_file(path)?,
        None => SimulationConfig::default(),
    }
    .with_env_overrides();

    if let Some(rounds) = args.rounds {
        config.rounds.num_rounds = rounds;
    }
    if let Some(timeout) = args.round_timeout_ms {
        config.rounds.round_timeout_ms = Some(timeout);
    }
    if let Some(backend) = &args.state_backend {
        config.state.backend = backend.parse::<StateBackendType>()?;
    }
    if let Some(dir) = &args.state_dir {
        config.state.base_path = dir.into();
    }
    if args.seed.is_some() {
        config.dataset.seed = args.seed;
    }

    let client_ids = resolve_client_ids(
        args.num_clients,
        args.client_ids
            .clone()
            .map(|ids| ids.into_iter().map(ClientId::from).collect()),
    )?;

    let dataset = if config.dataset.splits.is_empty() {
        tracing::info!(
            "No dataset splits configured, using {} synthetic rows",
            args.data_rows
        );
        synthetic_dataset(&args.split, args.data_rows, client_ids.len(), config.dataset.seed)?
    } else {
        FederatedDataset::from_config(&config.dataset)?
    };
    let dataset = Arc::new(dataset);

    let mut strategy = UniformSampling::new(args.fraction)?;
    if let Some(seed) = args.seed {
        strategy = strategy.with_seed(seed);
    }

    let app = MeanApp::new(dataset.clone(), args.split.clone()).with_fail_every(args.fail_every);

    tracing::info!("Starting fedsim");
    tracing::info!("  Clients: {}", client_ids.len());
    tracing::info!("  Rounds: {}", config.rounds.num_rounds);
    tracing::info!("  Fraction: {}", args.fraction);
    tracing::info!("  State backend: {:?}", config.state.backend);

    let history = Simulation::builder(Arc::new(app))
        .client_ids(client_ids)
        .config(config)
        .strategy(strategy)
        .partitioned_split(dataset, args.split)
        .run()
        .await?;

    print_summary(&history);
    Ok(())
}

fn print_summary(history: &History) {
    println!("run {}", history.run_id());
    for record in history {
        let mean = record
            .aggregate
            .metrics
            .get("mean")
            .map(|m| format!("{m:.4}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "round {:>3}: {:>4} selected, {:>4} completed, {:>4} failed, mean {}, {} ms",
            record.round,
            record.participants.len(),
            record.completed(),
            record.failed(),
            mean,
            record.duration_ms
        );
        for (id, outcome) in &record.outcomes {
            if let ClientOutcome::Failed(failure) = outcome {
                println!("           {id}: {failure}");
            }
        }
    }
    if let Some(round) = history.aborted_after() {
        println!("aborted after round {round}: every selected client failed");
    }
}
