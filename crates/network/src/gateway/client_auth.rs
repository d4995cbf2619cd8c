//! v3 onion-service client authorization descriptors.
//!
//! Server side: `descriptor:x25519:<BASE32(public key)>`, one file per
//! client under `authorized_clients/<label>.auth`.
//! Client side: `<address without .onion>:descriptor:x25519:<BASE32(private key)>`,
//! written to `client_auth/<label>.auth_private` for delivery to the client.
//! Dialing side: the local private key is handed to the daemon per peer
//! service with `ONION_CLIENT_AUTH_ADD`, base64 encoded.

use crate::errors::GatewayError;
use data_encoding::{BASE32_NOPAD, BASE64};
use rand_core::OsRng;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

const DESCRIPTOR_PREFIX: &str = "descriptor:x25519:";
const ONION_SUFFIX: &str = ".onion";
const SERVER_DIR: &str = "authorized_clients";
const CLIENT_DIR: &str = "client_auth";

/// X25519 keypair identifying one authorized overlay client.
pub struct ClientAuthKeypair {
    secret: StaticSecret,
}

impl ClientAuthKeypair {
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(secret),
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        PublicKey::from(&self.secret).to_bytes()
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Authorization entry for `label` that also carries the private half,
    /// so a client-side descriptor is written on publish.
    pub fn authorize(&self, label: impl Into<String>) -> AuthorizedClient {
        AuthorizedClient {
            label: label.into(),
            public_key: self.public_bytes(),
            private_key: Some(self.secret_bytes()),
        }
    }
}

impl fmt::Debug for ClientAuthKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientAuthKeypair")
            .field("public", &encode_key(&self.public_bytes()))
            .finish_non_exhaustive()
    }
}

/// A client allowed to resolve the published service.
#[derive(Clone)]
pub struct AuthorizedClient {
    pub label: String,
    pub public_key: [u8; 32],
    /// Present only when the key was generated locally for delivery.
    pub private_key: Option<Zeroizing<[u8; 32]>>,
}

impl AuthorizedClient {
    /// Authorize a peer by its key-agreement public key.
    pub fn from_public_key(label: impl Into<String>, public_key: [u8; 32]) -> Self {
        Self {
            label: label.into(),
            public_key,
            private_key: None,
        }
    }
}

impl fmt::Debug for AuthorizedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizedClient")
            .field("label", &self.label)
            .field("public_key", &encode_key(&self.public_key))
            .field("has_private_key", &self.private_key.is_some())
            .finish()
    }
}

pub fn encode_key(bytes: &[u8; 32]) -> String {
    BASE32_NOPAD.encode(bytes)
}

/// Decode an unpadded base32 key, accepting either letter case.
pub fn decode_key(encoded: &str) -> Result<[u8; 32], GatewayError> {
    let decoded = BASE32_NOPAD
        .decode(encoded.trim().to_ascii_uppercase().as_bytes())
        .map_err(|err| GatewayError::InvalidDescriptor(format!("bad base32 key: {err}")))?;
    decoded
        .as_slice()
        .try_into()
        .map_err(|_| GatewayError::InvalidDescriptor(format!("key must be 32 bytes, got {}", decoded.len())))
}

pub fn server_descriptor(public_key: &[u8; 32]) -> String {
    format!("{DESCRIPTOR_PREFIX}{}", encode_key(public_key))
}

pub fn parse_server_descriptor(line: &str) -> Result<[u8; 32], GatewayError> {
    let encoded = line
        .trim()
        .strip_prefix(DESCRIPTOR_PREFIX)
        .ok_or_else(|| GatewayError::InvalidDescriptor("missing descriptor:x25519: prefix".into()))?;
    decode_key(encoded)
}

pub fn client_descriptor(onion_address: &str, private_key: &[u8; 32]) -> String {
    let host = onion_address.trim_end_matches(ONION_SUFFIX);
    format!("{host}:{DESCRIPTOR_PREFIX}{}", encode_key(private_key))
}

pub fn is_onion_address(address: &str) -> bool {
    address.len() > ONION_SUFFIX.len() && address.ends_with(ONION_SUFFIX)
}

/// Control command registering `private_key` for the service at `onion_address`.
pub fn client_auth_add_command(onion_address: &str, private_key: &[u8; 32]) -> String {
    let host = onion_address.trim_end_matches(ONION_SUFFIX);
    format!("ONION_CLIENT_AUTH_ADD {host} x25519:{}", BASE64.encode(private_key))
}

/// Returns the service host (without `.onion`) and the client private key.
pub fn parse_client_descriptor(line: &str) -> Result<(String, [u8; 32]), GatewayError> {
    let (host, rest) = line
        .trim()
        .split_once(':')
        .ok_or_else(|| GatewayError::InvalidDescriptor("missing address".into()))?;
    if host.is_empty() {
        return Err(GatewayError::InvalidDescriptor("empty address".into()));
    }
    let encoded = rest
        .strip_prefix(DESCRIPTOR_PREFIX)
        .ok_or_else(|| GatewayError::InvalidDescriptor("missing descriptor:x25519: prefix".into()))?;
    Ok((host.to_string(), decode_key(encoded)?))
}

/// True when the client descriptor holds the private key for the public key
/// in the server descriptor.
pub fn descriptors_match(server_line: &str, client_line: &str) -> Result<bool, GatewayError> {
    let public = parse_server_descriptor(server_line)?;
    let (_, private) = parse_client_descriptor(client_line)?;
    let derived = ClientAuthKeypair::from_secret_bytes(private).public_bytes();
    Ok(derived == public)
}

pub fn validate_label(label: &str) -> Result<(), GatewayError> {
    let valid = !label.is_empty()
        && label.len() <= 64
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidLabel(label.to_string()))
    }
}

/// Descriptor files for one service directory.
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    root: PathBuf,
}

impl DescriptorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn server_path(&self, label: &str) -> PathBuf {
        self.root.join(SERVER_DIR).join(format!("{label}.auth"))
    }

    pub fn client_path(&self, label: &str) -> PathBuf {
        self.root.join(CLIENT_DIR).join(format!("{label}.auth_private"))
    }

    pub fn write_server(&self, client: &AuthorizedClient) -> Result<PathBuf, GatewayError> {
        validate_label(&client.label)?;
        let path = self.server_path(&client.label);
        write_private_file(&path, &server_descriptor(&client.public_key))?;
        Ok(path)
    }

    pub fn write_client(
        &self,
        label: &str,
        onion_address: &str,
        private_key: &[u8; 32],
    ) -> Result<PathBuf, GatewayError> {
        validate_label(label)?;
        let path = self.client_path(label);
        write_private_file(&path, &client_descriptor(onion_address, private_key))?;
        Ok(path)
    }

    /// Delete the server descriptor for `label`. Returns false if absent.
    pub fn remove_server(&self, label: &str) -> Result<bool, GatewayError> {
        validate_label(label)?;
        match fs::remove_file(self.server_path(label)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Read every server descriptor currently on disk.
    pub fn load_server_descriptors(&self) -> Result<Vec<AuthorizedClient>, GatewayError> {
        let dir = self.root.join(SERVER_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut clients = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("auth") {
                continue;
            }
            let Some(label) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let public_key = parse_server_descriptor(&fs::read_to_string(&path)?)?;
            clients.push(AuthorizedClient::from_public_key(label, public_key));
        }
        clients.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(clients)
    }
}

pub(crate) fn write_private_file(path: &Path, contents: &str) -> Result<(), GatewayError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{contents}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
