use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading, creating or using a node identity.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// The passphrase did not open the keystore (or the ciphertext was altered).
    #[error("keystore decryption failed: wrong passphrase or tampered ciphertext")]
    Decryption,

    #[error("keystore is corrupt: {0}")]
    KeystoreCorrupt(String),

    #[error("keystore {0} does not exist")]
    KeystoreMissing(PathBuf),

    #[error("keystore is locked by another process: {0}")]
    Locked(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("keystore I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IdentityError>;
