//! Signed PBFT protocol messages and the canonical batch digest.

use crate::errors::ConsensusError;
use serde::{Deserialize, Serialize};
use trustmesh_crypto::{verify_signature, NodeIdentity};
use trustmesh_types::{PeerId, StateSubmission};

const CONSENSUS_DOMAIN: &[u8] = b"trustmesh/consensus/v1";
const BATCH_DOMAIN: &[u8] = b"trustmesh/batch/v1";

pub type Digest = [u8; 32];

/// Digest of a view change from a member that prepared nothing, and of sync requests.
pub const EMPTY_DIGEST: Digest = [0u8; 32];

/// Proof that a quorum prepared `digest` in `view`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedCertificate {
    pub view: u64,
    pub digest: Digest,
    pub batch: Vec<StateSubmission>,
    /// Signed prepare votes for `digest` in `view`.
    pub prepares: Vec<ConsensusMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConsensusPayload {
    PrePrepare {
        batch: Vec<StateSubmission>,
    },
    Prepare,
    Commit,
    /// Request for the view in `ConsensusMessage::view`, carrying the
    /// sender's highest prepared batch for the sequence.
    ViewChange {
        prepared: Option<PreparedCertificate>,
    },
    /// Proposal of a view entered through a view change, justified by a
    /// quorum of view-change messages.
    NewView {
        view_changes: Vec<ConsensusMessage>,
        batch: Vec<StateSubmission>,
    },
    /// Asks members for the commit certificate of `sequence`.
    SyncRequest,
    /// Commit certificate of a finalized sequence.
    Decided {
        batch: Vec<StateSubmission>,
        commits: Vec<ConsensusMessage>,
    },
}

impl ConsensusPayload {
    fn tag(&self) -> u8 {
        match self {
            ConsensusPayload::PrePrepare { .. } => 1,
            ConsensusPayload::Prepare => 2,
            ConsensusPayload::Commit => 3,
            ConsensusPayload::ViewChange { .. } => 4,
            ConsensusPayload::NewView { .. } => 5,
            ConsensusPayload::SyncRequest => 6,
            ConsensusPayload::Decided { .. } => 7,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConsensusPayload::PrePrepare { .. } => "pre_prepare",
            ConsensusPayload::Prepare => "prepare",
            ConsensusPayload::Commit => "commit",
            ConsensusPayload::ViewChange { .. } => "view_change",
            ConsensusPayload::NewView { .. } => "new_view",
            ConsensusPayload::SyncRequest => "sync_request",
            ConsensusPayload::Decided { .. } => "decided",
        }
    }
}

/// A protocol message for one `(view, sequence)`.
///
/// For `ViewChange`, `view` is the view being requested. For `Decided`,
/// `view` and `digest` are those of the finalized round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    pub view: u64,
    pub sequence: u64,
    pub digest: Digest,
    pub sender: PeerId,
    pub payload: ConsensusPayload,
    pub signature: Vec<u8>,
}

impl ConsensusMessage {
    pub fn signed(
        identity: &NodeIdentity,
        payload: ConsensusPayload,
        view: u64,
        sequence: u64,
        digest: Digest,
    ) -> Self {
        let mut message = Self {
            view,
            sequence,
            digest,
            sender: identity.peer_id(),
            payload,
            signature: Vec::new(),
        };
        message.signature = identity.sign(&message.signing_bytes()).to_vec();
        message
    }

    pub fn view_change(
        identity: &NodeIdentity,
        view: u64,
        sequence: u64,
        prepared: Option<PreparedCertificate>,
    ) -> Self {
        let digest = prepared.as_ref().map_or(EMPTY_DIGEST, |cert| cert.digest);
        Self::signed(
            identity,
            ConsensusPayload::ViewChange { prepared },
            view,
            sequence,
            digest,
        )
    }

    pub fn prepared_certificate(&self) -> Option<&PreparedCertificate> {
        match &self.payload {
            ConsensusPayload::ViewChange { prepared } => prepared.as_ref(),
            _ => None,
        }
    }

    /// Bytes covered by the signature. Batches are bound through `digest`;
    /// a view change also binds the view of its prepared certificate.
    /// Embedded votes carry their own signatures.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONSENSUS_DOMAIN.len() + 1 + 24 + 32 + 20);
        out.extend_from_slice(CONSENSUS_DOMAIN);
        out.push(self.payload.tag());
        out.extend_from_slice(&self.view.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.digest);
        out.extend_from_slice(self.sender.as_bytes());
        if let Some(cert) = self.prepared_certificate() {
            out.extend_from_slice(&cert.view.to_le_bytes());
        }
        out
    }

    pub fn verify(&self, signing_key: &[u8; 32]) -> bool {
        self.sender.matches_key(signing_key)
            && verify_signature(&self.signing_bytes(), &self.signature, signing_key)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ConsensusError> {
        bincode::serialize(self).map_err(|err| ConsensusError::Malformed(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConsensusError> {
        bincode::deserialize(bytes).map_err(|err| ConsensusError::Malformed(err.to_string()))
    }
}

/// BLAKE3 over the signed submissions in `(node_id, timestamp)` order.
pub fn batch_digest(batch: &[StateSubmission]) -> Digest {
    let mut ordered: Vec<&StateSubmission> = batch.iter().collect();
    ordered.sort_by_key(|state| (state.node_id, state.timestamp));

    let mut hasher = blake3::Hasher::new();
    hasher.update(BATCH_DOMAIN);
    hasher.update(&(ordered.len() as u64).to_le_bytes());
    for state in ordered {
        hasher.update(&state.signing_bytes());
        hasher.update(&(state.signature.len() as u32).to_le_bytes());
        hasher.update(&state.signature);
    }
    *hasher.finalize().as_bytes()
}
