use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Round timing and admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Time a round may spend before the node requests a view change.
    pub round_timeout_ms: u64,
    /// Failed views tolerated per sequence before the round is reported
    /// unavailable.
    pub max_view_changes: u32,
    /// Maximum clock distance between a submission and the local clock.
    pub freshness_window_ms: u64,
    pub max_batch_size: usize,
    /// Interval between round starts.
    pub round_interval_ms: u64,
    /// Messages for future views or sequences held until their round starts.
    pub max_buffered_messages: usize,
    pub inbox_depth: usize,
    /// Finalized sequences whose commit certificates are kept for members
    /// that fell behind.
    pub certificate_history: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            round_timeout_ms: 4_000,
            max_view_changes: 5,
            freshness_window_ms: 60_000,
            max_batch_size: 256,
            round_interval_ms: 10_000,
            max_buffered_messages: 4_096,
            inbox_depth: 1_024,
            certificate_history: 64,
        }
    }
}

impl ConsensusConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_millis(self.round_interval_ms)
    }
}
