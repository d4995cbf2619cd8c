//! TrustMesh identity and signatures
//!
//! - `identity`: the node's Ed25519 signing key and X25519 agreement key
//! - `keystore`: passphrase-encrypted, lock-protected persistence of both keys
//! - `errors`: the `IdentityError` taxonomy
//!
//! Verification is a free function so that components holding only peer
//! public keys never need an identity handle.

pub mod errors;
pub mod identity;
pub mod keystore;

pub use errors::{IdentityError, Result};
pub use identity::{decode_public_key, verify_signature, NodeIdentity, PublicKeys, SIGNATURE_BYTES};
pub use keystore::{IdentityManager, KeystoreFile, KEYSTORE_VERSION};
