//! TrustMesh shared types
//!
//! Wire-level data shared by every layer of the node:
//! - `peer_id`: stable peer identifiers derived from signing keys
//! - `state`: signed local-state submissions and their metric fields
//! - `message`: the signed, TTL-bounded network envelope
//! - `time`: wall-clock helpers in milliseconds

pub mod message;
pub mod peer_id;
pub mod serde_hex;
pub mod state;
pub mod time;

pub use message::{MessageType, NetworkMessage, DEFAULT_TTL};
pub use peer_id::{PeerId, PeerIdError, Recipient, PEER_ID_BYTES};
pub use state::{MetricField, StateMetrics, StateSubmission, METRIC_FIELDS};
pub use time::{now_millis, skew_millis};
