use crate::errors::{IdentityError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use std::fmt;
use trustmesh_types::{NetworkMessage, PeerId, StateSubmission};
use x25519_dalek::{PublicKey as AgreementPublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Length of an Ed25519 signature.
pub const SIGNATURE_BYTES: usize = 64;

/// Public half of a node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKeys {
    pub signing: [u8; 32],
    pub agreement: [u8; 32],
}

impl PublicKeys {
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.signing)
    }
}

/// The local node's key material.
///
/// Never serialized directly; persistence goes through the encrypted
/// keystore only.
#[derive(Clone)]
pub struct NodeIdentity {
    signing_key: SigningKey,
    agreement_secret: StaticSecret,
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Generate fresh signing and agreement keys from the OS RNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let agreement_secret = StaticSecret::random_from_rng(OsRng);
        Self::from_parts(signing_key, agreement_secret)
    }

    /// Rebuild an identity from raw secret bytes.
    pub fn from_secret_bytes(signing: &[u8; 32], agreement: &[u8; 32]) -> Self {
        Self::from_parts(
            SigningKey::from_bytes(signing),
            StaticSecret::from(*agreement),
        )
    }

    fn from_parts(signing_key: SigningKey, agreement_secret: StaticSecret) -> Self {
        let peer_id = PeerId::from_public_key(&signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            agreement_secret,
            peer_id,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_keys(&self) -> PublicKeys {
        PublicKeys {
            signing: self.signing_key.verifying_key().to_bytes(),
            agreement: AgreementPublicKey::from(&self.agreement_secret).to_bytes(),
        }
    }

    /// Sign arbitrary bytes. Ed25519 signing is deterministic.
    pub fn sign(&self, bytes: &[u8]) -> [u8; SIGNATURE_BYTES] {
        self.signing_key.sign(bytes).to_bytes()
    }

    /// Fill in the signature of a state submission authored by this node.
    pub fn sign_state(&self, state: &mut StateSubmission) {
        state.signature = self.sign(&state.signing_bytes()).to_vec();
    }

    /// Fill in the signature of an outgoing envelope.
    pub fn sign_envelope(&self, message: &mut NetworkMessage) {
        message.signature = self.sign(&message.signing_bytes()).to_vec();
    }

    /// Concatenated secret bytes (signing || agreement) for the keystore.
    pub(crate) fn secret_bytes(&self) -> Zeroizing<[u8; 64]> {
        let mut out = Zeroizing::new([0u8; 64]);
        out[..32].copy_from_slice(&self.signing_key.to_bytes());
        out[32..].copy_from_slice(&self.agreement_secret.to_bytes());
        out
    }

    /// Raw X25519 secret, registered with the overlay daemon as this node's client key.
    pub fn agreement_secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.agreement_secret.to_bytes())
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature over `bytes`.
///
/// Malformed keys or signatures verify as `false` instead of erroring.
pub fn verify_signature(bytes: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(bytes, &signature).is_ok()
}

/// Decode a 32-byte public key from hex.
pub fn decode_public_key(encoded: &str) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    hex::decode_to_slice(encoded, &mut key)
        .map_err(|err| IdentityError::InvalidKey(format!("bad public key hex: {err}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustmesh_types::{MessageType, Recipient, StateMetrics};

    #[test]
    fn test_sign_and_verify_round_trip() {
        let identity = NodeIdentity::generate();
        let keys = identity.public_keys();
        let message = b"trustmesh::identity::roundtrip";

        let signature = identity.sign(message);
        assert!(verify_signature(message, &signature, &keys.signing));
        assert!(!verify_signature(b"other", &signature, &keys.signing));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let identity = NodeIdentity::from_secret_bytes(&[42u8; 32], &[7u8; 32]);
        assert_eq!(identity.sign(b"same"), identity.sign(b"same"));
    }

    #[test]
    fn test_malformed_inputs_do_not_verify() {
        let identity = NodeIdentity::generate();
        let keys = identity.public_keys();
        let signature = identity.sign(b"x");
        assert!(!verify_signature(b"x", &signature[..10], &keys.signing));
        assert!(!verify_signature(b"x", &signature, &keys.signing[..31]));
    }

    #[test]
    fn test_peer_id_matches_signing_key() {
        let identity = NodeIdentity::generate();
        assert_eq!(identity.peer_id(), identity.public_keys().peer_id());
        assert!(identity.peer_id().matches_key(&identity.public_keys().signing));
    }

    #[test]
    fn test_secret_bytes_rebuild_same_identity() {
        let identity = NodeIdentity::generate();
        let secret = identity.secret_bytes();
        let mut signing = [0u8; 32];
        let mut agreement = [0u8; 32];
        signing.copy_from_slice(&secret[..32]);
        agreement.copy_from_slice(&secret[32..]);
        let rebuilt = NodeIdentity::from_secret_bytes(&signing, &agreement);
        assert_eq!(rebuilt.public_keys(), identity.public_keys());
    }

    #[test]
    fn test_signed_state_and_envelope_verify() {
        let identity = NodeIdentity::generate();
        let signing = identity.public_keys().signing;

        let mut state = StateSubmission::unsigned(identity.peer_id(), 1, StateMetrics::default());
        identity.sign_state(&mut state);
        assert!(verify_signature(&state.signing_bytes(), &state.signature, &signing));

        let mut envelope = NetworkMessage::new(
            identity.peer_id(),
            Recipient::Broadcast,
            MessageType::Ping,
            vec![1, 2, 3],
            5,
        );
        identity.sign_envelope(&mut envelope);
        assert!(verify_signature(&envelope.signing_bytes(), &envelope.signature, &signing));
    }

    #[test]
    fn test_decode_public_key_checks_length() {
        assert!(decode_public_key(&"ab".repeat(32)).is_ok());
        assert!(matches!(
            decode_public_key("abcd"),
            Err(IdentityError::InvalidKey(_))
        ));
    }
}
