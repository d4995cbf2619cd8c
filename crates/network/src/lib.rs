//! TrustMesh Network Core
//!
//! Peer bookkeeping and authenticated, signed message delivery between
//! nodes, with an optional anonymity overlay for inbound reachability.
//!
//! ## Modules
//! - `peers`: Peer directory and connection state registry
//! - `transport`: Signed envelope routing, per-peer workers, dispatch
//! - `link`: Length-prefixed framing and the TCP link
//! - `memory`: In-process links for simulations
//! - `deduplication`: Prevents duplicate message processing
//! - `backoff`: Exponential reconnect delays
//! - `gateway`: Onion-service publication and client authorization
//! - `errors`: Network and gateway error types

pub mod backoff;
pub mod deduplication;
pub mod errors;
pub mod gateway;
pub mod link;
pub mod memory;
pub mod peers;
pub mod transport;

// ------------------------------------------------------------
// Re-exports for workspace-wide use
// ------------------------------------------------------------

// Peer management
pub use peers::{ConnectionStatus, PeerDirectory, PeerRecord, PeerSlot};

// Transport & links
pub use link::{serve_tcp, FrameSink, PeerLink, TcpLink};
pub use memory::{MemoryHub, MemoryLink};
pub use transport::{
    DropReason, MessageHandler, PeerAnnouncement, SendOutcome, Transport, TransportConfig,
    TransportStatsSnapshot,
};

// Utilities
pub use backoff::Backoff;
pub use deduplication::MessageDeduplicator;
pub use errors::{GatewayError, NetworkError};

// Overlay
pub use gateway::{
    gateway_from_config, AnonymityGateway, AuthorizedClient, ClientAuthKeypair, DescriptorStore,
    DisabledGateway, OnionAddress, OverlayConfig, OverlayMode, SocksLink, TorGateway,
};
