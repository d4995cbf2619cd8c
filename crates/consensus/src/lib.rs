//! TrustMesh consensus: PBFT agreement on batches of signed state
//! submissions, and reputation-weighted aggregation of finalized batches.
//!
//! ## Modules
//! - `quorum`: Fault tolerance, quorum size, leader rotation, vote tallies
//! - `messages`: Signed protocol messages and batch digests
//! - `engine`: The per-round state machine
//! - `driver`: Async round owner bridging the engine and the transport
//! - `reputation`: Reputation table and collective summaries
//! - `sink`: Outputs for finalized summaries

pub mod config;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod messages;
pub mod quorum;
pub mod reputation;
pub mod sink;

pub use config::ConsensusConfig;
pub use driver::{register_inbox, ConsensusBus, ConsensusInput, RoundDriver, RoundOutcome, StateSource};
pub use engine::{ConsensusEngine, FinalizedRound, Phase};
pub use errors::{ConsensusError, ReputationError, SubmissionError};
pub use messages::{
    batch_digest, ConsensusMessage, ConsensusPayload, Digest, PreparedCertificate, EMPTY_DIGEST,
};
pub use quorum::{fault_tolerance, quorum_size, Membership, VoteTally};
pub use reputation::{
    clamp_weight, CollectiveSummary, ReputationAggregator, ReputationConfig, ReputationTable,
    DEFAULT_WEIGHT,
};
pub use sink::{sink_from_config, JsonlSink, RoundSummary, SinkKind, SummarySink, TracingSink};
