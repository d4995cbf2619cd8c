use thiserror::Error;
use trustmesh_types::PeerId;

/// Transport and directory errors.
///
/// These are absorbed by the transport and reflected in peer status and
/// drop counters; they do not reach protocol handlers.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("peer {0} is not in the directory")]
    UnknownPeer(PeerId),

    #[error("peer id {0} does not match its signing key")]
    IdentityMismatch(PeerId),

    #[error("the local node cannot be added as a remote peer")]
    LocalPeer,

    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: PeerId, reason: String },

    #[error("connection to {0} timed out")]
    Timeout(PeerId),

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the anonymity overlay gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("control channel unavailable: {0}")]
    ControlUnavailable(String),

    #[error("daemon rejected command: {0}")]
    Rejected(String),

    #[error("unexpected control reply: {0}")]
    Protocol(String),

    #[error("invalid client authorization descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid client label '{0}'")]
    InvalidLabel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
