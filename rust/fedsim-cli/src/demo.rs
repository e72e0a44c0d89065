// rust/fedsim-cli/src/demo.rs

//! A small client app for exercising the engine from the command line.
//!
//! Each client reads its partition of numeric rows, reports the local mean
//! and remembers how many rounds it has taken part in.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fedsim_core::{
    ClientApp, ClientContext, ClientError, FederatedDataset, IidPartitioner, Instruction, Reply,
};

const ROUNDS_KEY: &str = "rounds_seen";

pub struct MeanApp {
    dataset: Arc<FederatedDataset>,
    split: String,
    fail_every: usize,
}

impl MeanApp {
    pub fn new(dataset: Arc<FederatedDataset>, split: impl Into<String>) -> Self {
        Self {
            dataset,
            split: split.into(),
            fail_every: 0,
        }
    }

    /// Every `n`-th client (by partition) reports an error. Zero disables.
    pub fn with_fail_every(mut self, n: usize) -> Self {
        self.fail_every = n;
        self
    }
}

#[async_trait]
impl ClientApp for MeanApp {
    async fn run(&self, ctx: &mut ClientContext, input: Instruction) -> Result<Reply, ClientError> {
        if self.fail_every > 0 && (ctx.partition_index() + 1) % self.fail_every == 0 {
            return Err(ClientError::new(format!(
                "injected failure for client {} in round {}",
                ctx.client_id(),
                input.round
            )));
        }

        let rows = self.dataset.load_partition(ctx.partition_index(), &self.split)?;
        let mut sum = 0.0;
        let mut count = 0u64;
        for row in rows.iter() {
            let value = std::str::from_utf8(row)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .ok_or_else(|| ClientError::new("row is not a number"))?;
            sum += value;
            count += 1;
        }
        let mean = if count == 0 { 0.0 } else { sum / count as f64 };

        let seen = ctx
            .state()
            .entry(ROUNDS_KEY)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .unwrap_or(0)
            + 1;
        ctx.state_mut().set_entry(ROUNDS_KEY, seen.to_le_bytes().to_vec());
        ctx.state_mut().set_metric("last_mean", mean);

        tracing::debug!(
            "Client {} on {}: {} rows, mean {:.3}",
            ctx.client_id(),
            ctx.slot(),
            count,
            mean
        );

        Ok(Reply::new(count)
            .with_metric("mean", mean)
            .with_metric(ROUNDS_KEY, seen as f64)
            .with_parameters(Bytes::copy_from_slice(&mean.to_le_bytes())))
    }
}

/// An in-memory split named `split` of `rows` numbers, partitioned across
/// `clients`.
pub fn synthetic_dataset(
    split: &str,
    rows: usize,
    clients: usize,
    seed: Option<u64>,
) -> fedsim_core::Result<FederatedDataset> {
    let partitioner = IidPartitioner::new(clients)?.with_seed(seed);
    Ok(FederatedDataset::new("synthetic")
        .with_split_rows(split, (0..rows).map(|i| i.to_string()))
        .with_partitioner(split, partitioner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsim_core::{Simulation, SimulationConfig};

    #[tokio::test]
    async fn test_mean_app_runs_every_client() {
        let dataset = Arc::new(synthetic_dataset("train", 100, 4, Some(7)).unwrap());
        let app = Arc::new(MeanApp::new(dataset.clone(), "train"));

        let mut config = SimulationConfig::default();
        config.rounds.num_rounds = 2;
        let history = Simulation::builder(app)
            .num_clients(4)
            .config(config)
            .partitioned_split(dataset, "train")
            .run()
            .await
            .unwrap();

        assert_eq!(history.len(), 2);
        let last = history.last().unwrap();
        assert_eq!(last.completed(), 4);
        assert_eq!(last.aggregate.num_examples, 100);
        assert_eq!(last.aggregate.metrics.get(ROUNDS_KEY), Some(&2.0));
        // Weighted mean of 0..100
        let mean = last.aggregate.metrics["mean"];
        assert!((mean - 49.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_synthetic_dataset_uses_requested_split() {
        let dataset = Arc::new(synthetic_dataset("eval", 12, 3, None).unwrap());
        assert_eq!(dataset.splits(), vec!["eval".to_string()]);

        let app = Arc::new(MeanApp::new(dataset.clone(), "eval"));
        let history = Simulation::builder(app)
            .num_clients(3)
            .partitioned_split(dataset, "eval")
            .run()
            .await
            .unwrap();
        assert_eq!(history.last().unwrap().completed(), 3);
        assert_eq!(history.last().unwrap().aggregate.num_examples, 12);
    }

    #[tokio::test]
    async fn test_fail_every_injects_failures() {
        let dataset = Arc::new(synthetic_dataset("train", 40, 4, None).unwrap());
        let app = Arc::new(MeanApp::new(dataset.clone(), "train").with_fail_every(2));

        let history = Simulation::builder(app)
            .num_clients(4)
            .partitioned_split(dataset, "train")
            .run()
            .await
            .unwrap();

        let record = history.last().unwrap();
        assert_eq!(record.completed(), 2);
        assert_eq!(record.failed(), 2);
    }
}
