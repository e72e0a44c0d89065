// rust/fedsim-core/src/history.rs

//! Append-only record of the rounds of one simulation run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::{ClientId, Reply};
use crate::error::ClientFailure;
use crate::strategy::Aggregate;

/// What happened to one participant in a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClientOutcome {
    Completed(Reply),
    Failed(ClientFailure),
}

impl ClientOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn failure(&self) -> Option<&ClientFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            Self::Completed(_) => None,
        }
    }
}

/// One round: who took part, how each fared, and the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u64,
    /// Participants in dispatch order.
    pub participants: Vec<ClientId>,
    /// Exactly one entry per participant.
    pub outcomes: BTreeMap<ClientId, ClientOutcome>,
    pub aggregate: Aggregate,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RoundRecord {
    pub fn completed(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.completed()
    }

    /// True if clients were dispatched and none of them completed.
    pub fn all_failed(&self) -> bool {
        !self.participants.is_empty() && self.completed() == 0
    }

    pub fn outcome(&self, id: &ClientId) -> Option<&ClientOutcome> {
        self.outcomes.get(id)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ClientId, &ClientFailure)> {
        self.outcomes
            .iter()
            .filter_map(|(id, o)| o.failure().map(|f| (id, f)))
    }
}

/// Ordered round records of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    run_id: String,
    records: Vec<RoundRecord>,
    /// Round after which the run stopped because every client failed.
    aborted_after: Option<u64>,
}

impl History {
    pub fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            records: Vec::new(),
            aborted_after: None,
        }
    }

    /// Unique id of the run, for correlating logs.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Appends a record. Rounds must be strictly increasing.
    pub(crate) fn push(&mut self, record: RoundRecord) {
        debug_assert!(self.records.last().map_or(true, |last| last.round < record.round));
        self.records.push(record);
    }

    pub(crate) fn mark_aborted(&mut self, round: u64) {
        self.aborted_after = Some(round);
    }

    pub fn aborted_after(&self) -> Option<u64> {
        self.aborted_after
    }

    pub fn records(&self) -> &[RoundRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RoundRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn round(&self, round: u64) -> Option<&RoundRecord> {
        self.records.iter().find(|r| r.round == round)
    }

    pub fn last(&self) -> Option<&RoundRecord> {
        self.records.last()
    }

    /// `(round, value)` for every round whose aggregate has metric `name`.
    pub fn metric_series(&self, name: &str) -> Vec<(u64, f64)> {
        self.records
            .iter()
            .filter_map(|r| r.aggregate.metrics.get(name).map(|v| (r.round, *v)))
            .collect()
    }

    pub fn total_failures(&self) -> usize {
        self.records.iter().map(RoundRecord::failed).sum()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a RoundRecord;
    type IntoIter = std::slice::Iter<'a, RoundRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
