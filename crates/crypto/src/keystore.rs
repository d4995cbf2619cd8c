use crate::errors::{IdentityError, Result};
use crate::identity::NodeIdentity;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{serde::ts_seconds, DateTime, Utc};
use fs2::FileExt;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use trustmesh_types::PeerId;
use zeroize::Zeroizing;

/// Current on-disk keystore schema version.
pub const KEYSTORE_VERSION: u8 = 1;
const KDF_LABEL: &str = "argon2id-v1";
const SECRET_LEN: usize = 64;

/// Serialized keystore written to disk.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeystoreFile {
    pub version: u8,
    pub peer_id: PeerId,
    pub signing_public_hex: String,
    pub agreement_public_hex: String,
    #[serde(with = "ts_seconds")]
    pub created_at: DateTime<Utc>,
    pub kdf: String,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

impl KeystoreFile {
    fn seal(identity: &NodeIdentity, passphrase: &str) -> Result<Self> {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = derive_encryption_key(passphrase, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|err| IdentityError::InvalidKey(format!("cipher init failed: {err}")))?;
        let secret = identity.secret_bytes();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), secret.as_slice())
            .map_err(|err| IdentityError::InvalidKey(format!("encryption failed: {err}")))?;

        let keys = identity.public_keys();
        Ok(Self {
            version: KEYSTORE_VERSION,
            peer_id: identity.peer_id(),
            signing_public_hex: hex::encode(keys.signing),
            agreement_public_hex: hex::encode(keys.agreement),
            created_at: Utc::now(),
            kdf: KDF_LABEL.to_string(),
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    fn open(&self, passphrase: &str) -> Result<NodeIdentity> {
        if self.version != KEYSTORE_VERSION {
            return Err(IdentityError::KeystoreCorrupt(format!(
                "unsupported keystore version {} (expected {})",
                self.version, KEYSTORE_VERSION
            )));
        }
        if self.kdf != KDF_LABEL {
            return Err(IdentityError::KeystoreCorrupt(format!(
                "unknown kdf '{}'",
                self.kdf
            )));
        }

        let salt = decode_field("salt", &self.salt)?;
        let nonce_bytes: [u8; 12] = decode_field("nonce", &self.nonce)?
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::KeystoreCorrupt("nonce must be 12 bytes".into()))?;
        let ciphertext = decode_field("ciphertext", &self.ciphertext)?;

        let key = derive_encryption_key(passphrase, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|err| IdentityError::KeystoreCorrupt(format!("cipher init failed: {err}")))?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
                .map_err(|_| IdentityError::Decryption)?,
        );
        if plaintext.len() != SECRET_LEN {
            return Err(IdentityError::KeystoreCorrupt(format!(
                "expected {SECRET_LEN} secret bytes, got {}",
                plaintext.len()
            )));
        }

        let mut signing = Zeroizing::new([0u8; 32]);
        let mut agreement = Zeroizing::new([0u8; 32]);
        signing.copy_from_slice(&plaintext[..32]);
        agreement.copy_from_slice(&plaintext[32..]);
        let identity = NodeIdentity::from_secret_bytes(&signing, &agreement);

        let keys = identity.public_keys();
        if hex::encode(keys.signing) != self.signing_public_hex
            || hex::encode(keys.agreement) != self.agreement_public_hex
            || identity.peer_id() != self.peer_id
        {
            return Err(IdentityError::KeystoreCorrupt(
                "public keys in keystore do not match decrypted secrets".into(),
            ));
        }
        Ok(identity)
    }
}

/// Loads, creates and rotates the node identity stored at a keystore path.
#[derive(Debug, Clone)]
pub struct IdentityManager {
    path: PathBuf,
    force_new: bool,
}

impl IdentityManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            force_new: false,
        }
    }

    /// Allow replacing an unreadable keystore with a fresh identity.
    pub fn with_force_new(mut self, force_new: bool) -> Self {
        self.force_new = force_new;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the identity at the configured path, creating it on first run.
    ///
    /// A wrong passphrase or corrupt keystore is an error unless `force_new`
    /// is set, in which case the old file is retired and a new identity is
    /// written.
    pub fn generate_or_load_identity(&self, passphrase: &str) -> Result<NodeIdentity> {
        if !self.path.exists() {
            return self.create(passphrase);
        }

        match self.load_identity(passphrase) {
            Ok(identity) => Ok(identity),
            Err(err @ (IdentityError::Decryption | IdentityError::KeystoreCorrupt(_)))
                if self.force_new =>
            {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "keystore unreadable, rotating to a new identity"
                );
                self.rotate(passphrase)
            }
            Err(err) => Err(err),
        }
    }

    /// Load an existing identity without ever creating one.
    pub fn load_identity(&self, passphrase: &str) -> Result<NodeIdentity> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(IdentityError::KeystoreMissing(self.path.clone()))
            }
            Err(err) => return Err(err.into()),
        };
        let keystore: KeystoreFile = serde_json::from_slice(&data)
            .map_err(|err| IdentityError::KeystoreCorrupt(err.to_string()))?;
        keystore.open(passphrase)
    }

    /// Replace the current identity with a fresh one.
    ///
    /// The previous keystore is kept beside the new one with a
    /// `.retired-<unix seconds>` suffix. Peers must re-authorize the new keys.
    pub fn rotate(&self, passphrase: &str) -> Result<NodeIdentity> {
        let _lock = KeystoreLock::acquire(&self.path)?;
        if self.path.exists() {
            let retired = retired_path(&self.path, Utc::now().timestamp());
            fs::rename(&self.path, &retired)?;
            info!(retired = %retired.display(), "retired previous keystore");
        }
        let identity = NodeIdentity::generate();
        self.write(&identity, passphrase)?;
        info!(peer = %identity.peer_id(), "rotated node identity");
        Ok(identity)
    }

    fn create(&self, passphrase: &str) -> Result<NodeIdentity> {
        let _lock = KeystoreLock::acquire(&self.path)?;
        if self.path.exists() {
            // Another process created it while we waited for the lock.
            return self.load_identity(passphrase);
        }
        let identity = NodeIdentity::generate();
        self.write(&identity, passphrase)?;
        info!(
            peer = %identity.peer_id(),
            path = %self.path.display(),
            "created new node identity"
        );
        Ok(identity)
    }

    fn write(&self, identity: &NodeIdentity, passphrase: &str) -> Result<()> {
        let keystore = KeystoreFile::seal(identity, passphrase)?;
        let data = serde_json::to_vec_pretty(&keystore)
            .map_err(|err| IdentityError::KeystoreCorrupt(err.to_string()))?;

        let tmp = sibling_path(&self.path, ".tmp");
        fs::write(&tmp, data)?;
        restrict_permissions(&tmp)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Exclusive advisory lock held while the keystore is written.
struct KeystoreLock {
    path: PathBuf,
    file: File,
}

impl KeystoreLock {
    fn acquire(keystore: &Path) -> Result<Self> {
        if let Some(parent) = keystore.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let path = sibling_path(keystore, ".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|err| IdentityError::Locked(format!("{} ({err})", path.display())))?;
        Ok(Self { path, file })
    }
}

impl Drop for KeystoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

fn derive_encryption_key(passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let mut key = Zeroizing::new([0u8; 32]);
    argon2::Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|err| IdentityError::KeystoreCorrupt(format!("key derivation failed: {err}")))?;
    Ok(key)
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|err| IdentityError::KeystoreCorrupt(format!("invalid {name}: {err}")))
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn retired_path(path: &Path, unix_seconds: i64) -> PathBuf {
    sibling_path(path, &format!(".retired-{unix_seconds}"))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
