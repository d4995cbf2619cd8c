use crate::peer_id::{PeerId, Recipient};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain separator for signed envelopes.
const ENVELOPE_DOMAIN: &[u8] = b"trustmesh/envelope/v1";

/// Default hop budget for a fresh envelope.
pub const DEFAULT_TTL: u8 = 8;

/// Kinds of payload carried by a `NetworkMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Consensus protocol traffic (pre-prepare, prepare, commit, view change).
    Consensus,
    /// A signed `StateSubmission`.
    StateSubmission,
    /// Peer introduction carrying address and key material.
    PeerAnnounce,
    Ping,
    Pong,
}

impl MessageType {
    fn tag(&self) -> u8 {
        match self {
            MessageType::Consensus => 1,
            MessageType::StateSubmission => 2,
            MessageType::PeerAnnounce => 3,
            MessageType::Ping => 4,
            MessageType::Pong => 5,
        }
    }
}

/// Signed envelope exchanged between peers.
///
/// The signature covers everything except the hop metadata (`ttl` and
/// `route_path`), which relays rewrite on every hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMessage {
    pub message_id: Uuid,
    pub sender_id: PeerId,
    pub recipient_id: Recipient,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub ttl: u8,
    #[serde(with = "crate::serde_hex")]
    pub signature: Vec<u8>,
    #[serde(default)]
    pub route_path: Vec<PeerId>,
}

impl NetworkMessage {
    /// Create an unsigned envelope with a fresh id and the default TTL.
    pub fn new(
        sender_id: PeerId,
        recipient_id: Recipient,
        message_type: MessageType,
        payload: Vec<u8>,
        timestamp: u64,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            sender_id,
            recipient_id,
            message_type,
            payload,
            timestamp,
            ttl: DEFAULT_TTL,
            signature: Vec::new(),
            route_path: Vec::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Canonical bytes covered by the sender's signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_DOMAIN.len() + 80 + self.payload.len());
        out.extend_from_slice(ENVELOPE_DOMAIN);
        out.extend_from_slice(self.message_id.as_bytes());
        out.extend_from_slice(self.sender_id.as_bytes());
        match self.recipient_id {
            Recipient::Broadcast => out.push(0),
            Recipient::Peer(id) => {
                out.push(1);
                out.extend_from_slice(id.as_bytes());
            }
        }
        out.push(self.message_type.tag());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Returns true if `peer` already appears on the route.
    pub fn has_visited(&self, peer: &PeerId) -> bool {
        self.route_path.contains(peer)
    }

    /// Key used for duplicate suppression.
    pub fn dedup_key(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.message_id.as_bytes());
        hasher.update(self.sender_id.as_bytes());
        *hasher.finalize().as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> NetworkMessage {
        NetworkMessage::new(
            PeerId::from_public_key(&[1u8; 32]),
            Recipient::Broadcast,
            MessageType::Ping,
            b"hello".to_vec(),
            42,
        )
    }

    #[test]
    fn test_hop_metadata_is_not_signed() {
        let mut msg = envelope();
        let before = msg.signing_bytes();
        msg.ttl -= 1;
        msg.route_path.push(PeerId::from_public_key(&[2u8; 32]));
        assert_eq!(msg.signing_bytes(), before);

        msg.payload.push(b'!');
        assert_ne!(msg.signing_bytes(), before);
    }

    #[test]
    fn test_route_path_defaults_to_empty() {
        let msg = envelope();
        let mut json = serde_json::to_value(&msg).expect("serialize");
        json.as_object_mut()
            .expect("object")
            .remove("route_path");
        let back: NetworkMessage = serde_json::from_value(json).expect("deserialize");
        assert!(back.route_path.is_empty());
        assert_eq!(back.message_id, msg.message_id);
    }

    #[test]
    fn test_envelope_survives_bincode() {
        let mut msg = envelope();
        msg.signature = vec![0xAB; 64];
        msg.route_path.push(PeerId::from_public_key(&[5u8; 32]));
        let bytes = bincode::serialize(&msg).expect("encode");
        let back: NetworkMessage = bincode::deserialize(&bytes).expect("decode");
        assert_eq!(back, msg);
    }

    #[test]
    fn test_fresh_envelopes_have_unique_ids() {
        assert_ne!(envelope().message_id, envelope().message_id);
    }
}
