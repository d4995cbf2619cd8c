use thiserror::Error;
use trustmesh_types::PeerId;

/// Consensus-level failures surfaced to the round owner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    #[error("consensus unavailable for sequence {sequence} (view {view}) after {view_changes} view changes")]
    Unavailable {
        view: u64,
        sequence: u64,
        view_changes: u32,
    },
    #[error("malformed consensus message: {0}")]
    Malformed(String),
}

/// Reasons a state submission is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("submission from unknown node {0}")]
    UnknownNode(PeerId),
    #[error("invalid signature on submission from {0}")]
    InvalidSignature(PeerId),
    #[error("submission from {0} carries non-finite metrics")]
    Malformed(PeerId),
    #[error("submission timestamp {timestamp} is outside the freshness window at {now}")]
    Stale { timestamp: u64, now: u64 },
    #[error("submission from {node} at {timestamp} was already superseded")]
    Replayed { node: PeerId, timestamp: u64 },
    #[error("batch holds {size} submissions, limit is {limit}")]
    BatchTooLarge { size: usize, limit: usize },
    #[error("batch holds more than one submission from {0}")]
    Duplicate(PeerId),
}

#[derive(Debug, Error)]
pub enum ReputationError {
    #[error("reputation store is corrupt: {0}")]
    Corrupt(String),
    #[error("summary encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
