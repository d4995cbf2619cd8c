use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of raw bytes in a peer identifier.
pub const PEER_ID_BYTES: usize = 20;

/// Token used on the wire for the broadcast recipient.
const BROADCAST_TOKEN: &str = "*";

/// Errors that can occur when parsing a peer identifier.
#[derive(Debug, thiserror::Error)]
pub enum PeerIdError {
    #[error("peer id must be {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("peer id is not valid hexadecimal")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Stable identifier of a node, bound to its Ed25519 signing key.
///
/// The id is the first twenty bytes of `BLAKE3(signing_public_key)`, so a
/// peer cannot claim an id without holding the matching key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId([u8; PEER_ID_BYTES]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; PEER_ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Derive the identifier for a signing public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let digest = blake3::hash(public_key);
        let mut bytes = [0u8; PEER_ID_BYTES];
        bytes.copy_from_slice(&digest.as_bytes()[..PEER_ID_BYTES]);
        Self(bytes)
    }

    /// Returns true when `public_key` hashes to this identifier.
    pub fn matches_key(&self, public_key: &[u8; 32]) -> bool {
        Self::from_public_key(public_key) == *self
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != PEER_ID_BYTES * 2 {
            return Err(PeerIdError::InvalidLength {
                expected: PEER_ID_BYTES * 2,
                actual: s.len(),
            });
        }
        let mut bytes = [0u8; PEER_ID_BYTES];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl From<PeerId> for String {
    fn from(value: PeerId) -> Self {
        value.to_hex()
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Destination of a network envelope: a single peer or every trusted peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recipient {
    Broadcast,
    Peer(PeerId),
}

impl Recipient {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Recipient::Broadcast)
    }

    pub fn peer(&self) -> Option<PeerId> {
        match self {
            Recipient::Broadcast => None,
            Recipient::Peer(id) => Some(*id),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Broadcast => f.write_str(BROADCAST_TOKEN),
            Recipient::Peer(id) => fmt::Display::fmt(id, f),
        }
    }
}

impl From<Recipient> for String {
    fn from(value: Recipient) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Recipient {
    type Error = PeerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == BROADCAST_TOKEN {
            Ok(Recipient::Broadcast)
        } else {
            value.parse().map(Recipient::Peer)
        }
    }
}
