//! Outputs for finalized collective summaries.

use crate::engine::FinalizedRound;
use crate::errors::ReputationError;
use crate::reputation::{CollectiveSummary, ReputationConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Tracing,
    Jsonl,
}

/// One finalized round as handed to external consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub view: u64,
    pub sequence: u64,
    /// Hex batch digest.
    pub digest: String,
    pub finalized_at: u64,
    #[serde(flatten)]
    pub summary: CollectiveSummary,
}

impl RoundSummary {
    pub fn new(round: &FinalizedRound, summary: CollectiveSummary) -> Self {
        Self {
            view: round.view,
            sequence: round.sequence,
            digest: hex::encode(round.digest),
            finalized_at: round.finalized_at,
            summary,
        }
    }
}

pub trait SummarySink: Send + Sync {
    fn publish(&self, summary: &RoundSummary) -> Result<(), ReputationError>;
}

/// Logs each summary as a structured event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl SummarySink for TracingSink {
    fn publish(&self, summary: &RoundSummary) -> Result<(), ReputationError> {
        let metrics = &summary.summary.metrics;
        info!(
            sequence = summary.sequence,
            view = summary.view,
            nodes = summary.summary.nodes_count,
            entropy = metrics.entropy,
            valence = metrics.valence,
            arousal = metrics.arousal,
            coherence = metrics.coherence,
            empathy_score = metrics.empathy_score,
            insight_strength = metrics.insight_strength,
            "collective summary"
        );
        Ok(())
    }
}

/// Appends one JSON object per round to a file.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ReputationError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SummarySink for JsonlSink {
    fn publish(&self, summary: &RoundSummary) -> Result<(), ReputationError> {
        let mut line = serde_json::to_vec(summary)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

/// Build the sink selected by `config.sink`.
pub fn sink_from_config(config: &ReputationConfig) -> Result<Box<dyn SummarySink>, ReputationError> {
    Ok(match config.sink {
        SinkKind::Tracing => Box::new(TracingSink),
        SinkKind::Jsonl => Box::new(JsonlSink::open(config.sink_path.clone())?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use trustmesh_types::StateMetrics;

    fn summary(sequence: u64) -> RoundSummary {
        RoundSummary {
            view: 0,
            sequence,
            digest: hex::encode([7u8; 32]),
            finalized_at: 1_000 + sequence,
            summary: CollectiveSummary {
                metrics: StateMetrics {
                    coherence: 0.5,
                    ..StateMetrics::default()
                },
                nodes_count: 3,
            },
        }
    }

    #[test]
    fn test_jsonl_sink_appends_one_line_per_round() {
        let dir = tempdir().expect("tempdir");
        let config = ReputationConfig {
            sink: SinkKind::Jsonl,
            sink_path: dir.path().join("out/summaries.jsonl"),
            ..ReputationConfig::default()
        };
        let sink = sink_from_config(&config).expect("sink");
        sink.publish(&summary(1)).expect("publish");
        sink.publish(&summary(2)).expect("publish");

        let contents = fs::read_to_string(&config.sink_path).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: RoundSummary = serde_json::from_str(lines[1]).expect("parse");
        assert_eq!(second, summary(2));
        let raw: serde_json::Value = serde_json::from_str(lines[0]).expect("parse");
        assert_eq!(raw["coherence"], 0.5);
        assert_eq!(raw["nodes_count"], 3);
    }

    #[test]
    fn test_tracing_sink_accepts_summaries() {
        TracingSink.publish(&summary(1)).expect("publish");
    }
}
