// rust/fedsim-core/src/coordinator.rs

//! The round loop: select, dispatch concurrently, collect within a deadline,
//! aggregate, record.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::client::{ClientId, Reply};
use crate::config::RoundConfig;
use crate::error::{ClientFailure, Result, SimError};
use crate::history::{ClientOutcome, History, RoundRecord};
use crate::proxy::VirtualClientProxy;
use crate::strategy::Strategy;

/// Drives rounds over a fixed set of virtual client proxies.
pub struct RoundCoordinator {
    proxies: HashMap<ClientId, Arc<VirtualClientProxy>>,
    /// Registration order, as offered to the strategy.
    order: Vec<ClientId>,
    config: RoundConfig,
}

impl RoundCoordinator {
    /// # Errors
    ///
    /// Returns a configuration error if there are no proxies, if two proxies
    /// share an id, or if `config` asks for zero rounds.
    pub fn new(proxies: Vec<Arc<VirtualClientProxy>>, config: RoundConfig) -> Result<Self> {
        if proxies.is_empty() {
            return Err(SimError::config("no selectable clients: at least one is required"));
        }
        if config.num_rounds == 0 {
            return Err(SimError::config("rounds.num_rounds must be greater than 0"));
        }

        let mut order = Vec::with_capacity(proxies.len());
        let mut by_id = HashMap::with_capacity(proxies.len());
        for proxy in proxies {
            let id = proxy.id().clone();
            if by_id.insert(id.clone(), proxy).is_some() {
                return Err(SimError::config(format!("duplicate client id '{id}'")));
            }
            order.push(id);
        }

        Ok(Self {
            proxies: by_id,
            order,
            config,
        })
    }

    pub fn client_ids(&self) -> &[ClientId] {
        &self.order
    }

    pub fn proxy(&self, id: &ClientId) -> Option<&Arc<VirtualClientProxy>> {
        self.proxies.get(id)
    }

    /// Runs every configured round and returns the history.
    ///
    /// Client failures never end the run. The only early exit is the
    /// abort-on-total-failure policy, which stops after recording the round
    /// in which every dispatched client failed.
    pub async fn run(&self, strategy: &mut dyn Strategy) -> History {
        let mut history = History::new();
        tracing::info!(
            "Starting run {} with {} client(s) for {} round(s)",
            history.run_id(),
            self.order.len(),
            self.config.num_rounds
        );

        for round in 1..=self.config.num_rounds {
            let record = self.run_round(round, strategy).await;
            let all_failed = record.all_failed();

            tracing::info!(
                "Round {} finished in {} ms: {} completed, {} failed",
                round,
                record.duration_ms,
                record.completed(),
                record.failed()
            );
            history.push(record);

            if all_failed {
                if self.config.abort_on_total_failure {
                    tracing::warn!("Every client failed in round {}; aborting run", round);
                    history.mark_aborted(round);
                    break;
                }
                tracing::warn!("Every client failed in round {}; continuing", round);
            }
        }

        history
    }

    /// Runs a single round and returns its record.
    pub async fn run_round(&self, round: u64, strategy: &mut dyn Strategy) -> RoundRecord {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut seen = HashSet::new();
        let mut dispatch = Vec::new();
        for (id, instruction) in strategy.configure_round(round, &self.order) {
            let Some(proxy) = self.proxies.get(&id) else {
                tracing::warn!("Strategy selected unknown client {} in round {}; skipping", id, round);
                continue;
            };
            if seen.insert(id.clone()) {
                dispatch.push((id, proxy.clone(), instruction));
            }
        }

        let participants: Vec<ClientId> = dispatch.iter().map(|(id, _, _)| id.clone()).collect();
        tracing::debug!("Round {}: dispatching {} client(s)", round, participants.len());

        let mut in_flight: FuturesUnordered<_> = dispatch
            .into_iter()
            .map(|(id, proxy, instruction)| async move {
                let result = proxy.invoke(instruction).await;
                (id, result)
            })
            .collect();

        let deadline = self
            .config
            .round_timeout()
            .map(|timeout| tokio::time::Instant::now() + timeout);

        let mut results: BTreeMap<ClientId, std::result::Result<Reply, ClientFailure>> =
            BTreeMap::new();
        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, in_flight.next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => in_flight.next().await,
            };
            match next {
                Some((id, result)) => {
                    results.insert(id, result);
                }
                None => break,
            }
        }

        // Dropping the stragglers cancels their work items, which releases
        // their capacity before the next round submits anything.
        let stragglers = in_flight.len();
        drop(in_flight);
        if stragglers > 0 {
            tracing::warn!(
                "Round {}: {} client(s) missed the {} ms deadline",
                round,
                stragglers,
                self.config.round_timeout_ms.unwrap_or_default()
            );
        }
        for id in &participants {
            if !results.contains_key(id) {
                let failure = ClientFailure::timeout(format!(
                    "client {} did not finish within {} ms",
                    id,
                    self.config.round_timeout_ms.unwrap_or_default()
                ));
                results.insert(id.clone(), Err(failure));
            }
        }

        let mut replies = Vec::new();
        let mut failures = Vec::new();
        for (id, result) in &results {
            match result {
                Ok(reply) => replies.push((id.clone(), reply.clone())),
                Err(failure) => {
                    tracing::warn!("Round {}: client {} failed: {}", round, id, failure);
                    failures.push((id.clone(), failure.clone()));
                }
            }
        }
        let aggregate = strategy.aggregate(round, &replies, &failures);

        let outcomes = results
            .into_iter()
            .map(|(id, result)| {
                let outcome = match result {
                    Ok(reply) => ClientOutcome::Completed(reply),
                    Err(failure) => ClientOutcome::Failed(failure),
                };
                (id, outcome)
            })
            .collect();

        RoundRecord {
            round,
            participants,
            outcomes,
            aggregate,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientApp, Instruction};
    use crate::config::PoolConfig;
    use crate::error::FailureKind;
    use crate::pool::WorkerPool;
    use crate::resources::{ResourceVector, NUM_CPUS};
    use crate::state::{ClientStateStore, MemoryStateStore};
    use crate::strategy::{Aggregate, UniformSampling};
    use crate::test_apps::{read_count, CountingApp, COUNT_KEY};

    struct Fixture {
        coordinator: RoundCoordinator,
        pool: WorkerPool,
        store: Arc<MemoryStateStore>,
    }

    fn fixture(clients: usize, slots: usize, app: Arc<dyn ClientApp>, config: RoundConfig) -> Fixture {
        let pool = WorkerPool::open(&PoolConfig::uniform(slots, ResourceVector::cpus(1.0))).unwrap();
        let store = Arc::new(MemoryStateStore::new());
        let proxies = (0..clients)
            .map(|i| {
                Arc::new(VirtualClientProxy::new(
                    ClientId::from(i),
                    i,
                    ResourceVector::cpus(1.0),
                    app.clone(),
                    store.clone(),
                    pool.clone(),
                ))
            })
            .collect();
        Fixture {
            coordinator: RoundCoordinator::new(proxies, config).unwrap(),
            pool,
            store,
        }
    }

    fn rounds(num_rounds: u64) -> RoundConfig {
        RoundConfig {
            num_rounds,
            ..Default::default()
        }
    }

    /// Selects a scripted list of ids per round.
    struct Scripted(Vec<Vec<&'static str>>);

    impl Strategy for Scripted {
        fn configure_round(&mut self, round: u64, _available: &[ClientId]) -> Vec<(ClientId, Instruction)> {
            self.0
                .get(round as usize - 1)
                .map(|ids| ids.iter().map(|id| (ClientId::from(*id), Instruction::new(round))).collect())
                .unwrap_or_default()
        }

        fn aggregate(
            &mut self,
            _round: u64,
            _results: &[(ClientId, Reply)],
            _failures: &[(ClientId, ClientFailure)],
        ) -> Aggregate {
            Aggregate::default()
        }
    }

    #[test]
    fn test_new_rejects_empty_and_duplicates() {
        let err = RoundCoordinator::new(Vec::new(), rounds(1)).err().unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_duplicate_proxy_ids_rejected() {
        let pool = WorkerPool::open(&PoolConfig::uniform(1, ResourceVector::cpus(1.0))).unwrap();
        let store: Arc<dyn ClientStateStore> = Arc::new(MemoryStateStore::new());
        let app: Arc<dyn ClientApp> = Arc::new(CountingApp::new());
        let make = |i| {
            Arc::new(VirtualClientProxy::new(
                ClientId::new("same"),
                i,
                ResourceVector::cpus(1.0),
                app.clone(),
                store.clone(),
                pool.clone(),
            ))
        };
        let err = RoundCoordinator::new(vec![make(0), make(1)], rounds(1)).err().unwrap();
        assert!(err.to_string().contains("duplicate client id 'same'"));
    }

    #[tokio::test]
    async fn test_partial_failure_recorded_and_run_continues() {
        let app = Arc::new(CountingApp::new().failing([2usize, 5, 7]));
        let f = fixture(10, 4, app, rounds(2));

        let history = f.coordinator.run(&mut UniformSampling::all()).await;

        assert_eq!(history.len(), 2);
        for record in history.iter() {
            assert_eq!(record.participants.len(), 10);
            assert_eq!(record.outcomes.len(), 10);
            assert_eq!((record.completed(), record.failed()), (7, 3));
            let failed: Vec<_> = record.failures().map(|(id, _)| id.as_str().to_string()).collect();
            assert_eq!(failed, vec!["2", "5", "7"]);
            assert_eq!(record.aggregate.num_examples, 70);
        }
        assert_eq!(history.aborted_after(), None);

        // Failed clients never persisted, the others ran twice
        let ok = f.store.get(&ClientId::from(0usize)).await.unwrap();
        assert_eq!(read_count(ok.entry(COUNT_KEY)), 2);
        assert!(f.store.get(&ClientId::from(2usize)).await.unwrap().is_fresh());
    }

    #[tokio::test]
    async fn test_state_follows_selection_across_rounds() {
        let f = fixture(3, 1, Arc::new(CountingApp::new()), rounds(3));
        let mut strategy = Scripted(vec![vec!["0", "1"], vec!["1"], vec!["0", "1", "2"]]);

        let history = f.coordinator.run(&mut strategy).await;

        let count_of = |round: u64, id: &str| match history.round(round).unwrap().outcome(&ClientId::from(id)) {
            Some(ClientOutcome::Completed(reply)) => reply.metrics[COUNT_KEY],
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(count_of(1, "1"), 1.0);
        assert_eq!(count_of(2, "1"), 2.0);
        assert_eq!(count_of(3, "1"), 3.0);
        assert_eq!(count_of(3, "0"), 2.0);
        assert_eq!(count_of(3, "2"), 1.0);
    }

    #[tokio::test]
    async fn test_timeout_fails_stragglers_and_releases_capacity() {
        let app = Arc::new(CountingApp::new().stalling(["1"]));
        let config = RoundConfig {
            num_rounds: 2,
            round_timeout_ms: Some(100),
            ..Default::default()
        };
        let f = fixture(3, 2, app, config);

        let history = f.coordinator.run(&mut UniformSampling::all()).await;

        for record in history.iter() {
            assert_eq!(record.completed(), 2);
            match record.outcome(&ClientId::from("1")) {
                Some(ClientOutcome::Failed(failure)) => assert_eq!(failure.kind, FailureKind::Timeout),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        for slot in f.pool.slots() {
            assert_eq!(slot.available.get(NUM_CPUS), 1.0);
        }
        assert_eq!(f.pool.stats().cancelled, 2);
    }

    #[tokio::test]
    async fn test_total_failure_continues_by_default() {
        let app = Arc::new(CountingApp::new().failing([0usize, 1]));
        let f = fixture(2, 1, app, rounds(3));

        let history = f.coordinator.run(&mut UniformSampling::all()).await;

        assert_eq!(history.len(), 3);
        assert!(history.iter().all(RoundRecord::all_failed));
        assert_eq!(history.aborted_after(), None);
    }

    #[tokio::test]
    async fn test_total_failure_aborts_when_configured() {
        let app = Arc::new(CountingApp::new().failing([0usize, 1]));
        let config = RoundConfig {
            num_rounds: 3,
            abort_on_total_failure: true,
            ..Default::default()
        };
        let f = fixture(2, 1, app, config);

        let history = f.coordinator.run(&mut UniformSampling::all()).await;

        assert_eq!(history.len(), 1);
        assert_eq!(history.aborted_after(), Some(1));
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_selections() {
        let f = fixture(2, 1, Arc::new(CountingApp::new()), rounds(2));
        let mut strategy = Scripted(vec![vec!["0", "ghost", "0", "1"], vec![]]);

        let history = f.coordinator.run(&mut strategy).await;

        let first = history.round(1).unwrap();
        assert_eq!(first.participants, vec![ClientId::from("0"), ClientId::from("1")]);
        assert_eq!(first.completed(), 2);

        // An empty selection is still a recorded round, not a failure
        let second = history.round(2).unwrap();
        assert!(second.participants.is_empty());
        assert!(!second.all_failed());
        assert_eq!(history.len(), 2);
    }
}
