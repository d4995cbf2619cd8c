//! Reputation-weighted aggregation of finalized rounds.
//!
//! The aggregator is the single writer of the reputation table. Weights
//! change only after a round has finalized: either through an explicit
//! `update_weight` or through the round-outcome policy that rewards members
//! whose commit vote was counted and penalizes members that sent no
//! matching vote at all.

use crate::engine::FinalizedRound;
use crate::errors::ReputationError;
use crate::sink::SinkKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};
use trustmesh_network::PeerDirectory;
use trustmesh_types::{MetricField, PeerId, StateMetrics, StateSubmission, METRIC_FIELDS};

/// Weight of a node with no recorded reputation.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Clamp a weight into `[0, 1]`. NaN counts as no trust.
pub fn clamp_weight(weight: f64) -> f64 {
    if weight.is_nan() {
        0.0
    } else {
        weight.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Where the table is persisted. Weights reset on restart when unset.
    pub persist_path: Option<PathBuf>,
    /// Added to members whose commit was counted.
    pub commit_reward: f64,
    /// Subtracted from members with no matching vote in the round.
    pub silence_penalty: f64,
    pub sink: SinkKind,
    /// Output file of the `jsonl` sink.
    pub sink_path: PathBuf,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            persist_path: None,
            commit_reward: 0.02,
            silence_penalty: 0.1,
            sink: SinkKind::Tracing,
            sink_path: PathBuf::from("summaries.jsonl"),
        }
    }
}

/// `node_id -> weight`, every weight in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReputationTable {
    weights: BTreeMap<PeerId, f64>,
}

impl ReputationTable {
    pub fn weight(&self, node: &PeerId) -> f64 {
        self.weights.get(node).copied().unwrap_or(DEFAULT_WEIGHT)
    }

    fn set(&mut self, node: PeerId, weight: f64) -> f64 {
        let weight = clamp_weight(weight);
        self.weights.insert(node, weight);
        weight
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &f64)> {
        self.weights.iter()
    }
}

/// Weighted collective state of one round, flattened into a key-value
/// snapshot when serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectiveSummary {
    #[serde(flatten)]
    pub metrics: StateMetrics,
    pub nodes_count: usize,
}

impl CollectiveSummary {
    pub fn get(&self, field: MetricField) -> f64 {
        self.metrics.get(field)
    }

    /// Metric name to value, plus `nodes_count`.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        let mut snapshot: BTreeMap<String, f64> = METRIC_FIELDS
            .iter()
            .map(|field| (field.as_str().to_string(), self.get(*field)))
            .collect();
        snapshot.insert("nodes_count".to_string(), self.nodes_count as f64);
        snapshot
    }
}

pub struct ReputationAggregator {
    config: ReputationConfig,
    table: ReputationTable,
}

impl ReputationAggregator {
    /// Aggregator with an empty table.
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            table: ReputationTable::default(),
        }
    }

    /// Aggregator restored from `persist_path` when the file exists.
    pub fn load(config: ReputationConfig) -> Result<Self, ReputationError> {
        let table = match &config.persist_path {
            Some(path) if path.exists() => {
                let raw = fs::read_to_string(path)?;
                let mut table: ReputationTable = serde_json::from_str(&raw)
                    .map_err(|err| ReputationError::Corrupt(err.to_string()))?;
                for weight in table.weights.values_mut() {
                    *weight = clamp_weight(*weight);
                }
                info!(path = %path.display(), nodes = table.len(), "reputation table restored");
                table
            }
            _ => ReputationTable::default(),
        };
        Ok(Self { config, table })
    }

    pub fn table(&self) -> &ReputationTable {
        &self.table
    }

    pub fn weight(&self, node: &PeerId) -> f64 {
        self.table.weight(node)
    }

    /// `Σ(weight_i * value_i) / Σ(weight_i)`, or `0.0` for no states or no
    /// total weight.
    pub fn compute_metric(&self, field: MetricField, states: &[StateSubmission]) -> f64 {
        let (weighted, total) = states.iter().fold((0.0, 0.0), |(weighted, total), state| {
            let weight = self.weight(&state.node_id);
            (weighted + weight * state.value(field), total + weight)
        });
        if total == 0.0 {
            0.0
        } else {
            weighted / total
        }
    }

    pub fn collective_summary(&self, states: &[StateSubmission]) -> CollectiveSummary {
        let mut metrics = StateMetrics::default();
        for field in METRIC_FIELDS {
            metrics.set(field, self.compute_metric(field, states));
        }
        CollectiveSummary {
            metrics,
            nodes_count: states.len(),
        }
    }

    /// Set `node`'s weight, clamped to `[0, 1]`. Returns the stored value.
    pub fn update_weight(&mut self, node: PeerId, weight: f64) -> Result<f64, ReputationError> {
        let stored = self.table.set(node, weight);
        debug!(node = %node, weight = stored, "reputation updated");
        self.persist()?;
        Ok(stored)
    }

    /// Reward committers and penalize silent members of a finalized round.
    /// Members that only prepared keep their weight. Returns the new weight
    /// of every member.
    pub fn apply_round_outcome(
        &mut self,
        round: &FinalizedRound,
    ) -> Result<Vec<(PeerId, f64)>, ReputationError> {
        let committed: HashSet<&PeerId> = round.committers.iter().collect();
        let participated: HashSet<&PeerId> = round.participants.iter().collect();
        let mut updated = Vec::with_capacity(round.members.len());
        for member in &round.members {
            let delta = if committed.contains(member) {
                self.config.commit_reward
            } else if participated.contains(member) {
                0.0
            } else {
                -self.config.silence_penalty
            };
            let weight = self.table.set(*member, self.table.weight(member) + delta);
            updated.push((*member, weight));
        }
        debug!(
            sequence = round.sequence,
            committers = round.committers.len(),
            members = round.members.len(),
            "round outcome applied to reputation"
        );
        self.persist()?;
        Ok(updated)
    }

    /// Copy every weight into the directory's `reputation_score`.
    pub fn mirror_into(&self, directory: &PeerDirectory) {
        for (node, weight) in self.table.iter() {
            directory.set_reputation(node, *weight);
        }
    }

    fn persist(&self) -> Result<(), ReputationError> {
        let Some(path) = &self.config.persist_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.table)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
