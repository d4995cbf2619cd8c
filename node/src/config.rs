use anyhow::{anyhow, bail, Context, Result};
use config::{Config, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use trustmesh_consensus::{ConsensusConfig, ReputationConfig};
use trustmesh_crypto::{decode_public_key, PublicKeys};
use trustmesh_network::{OverlayConfig, PeerRecord, TransportConfig};
use trustmesh_types::PeerId;

/// Looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "trustmesh.toml";
pub const ENV_PREFIX: &str = "TRUSTMESH";
pub const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub listen_host: String,
    pub listen_port: u16,
    /// Address announced to peers when no onion service is published.
    pub advertise_host: Option<String>,
    pub data_dir: PathBuf,
    /// Keystore file name, relative to `data_dir`.
    pub keystore_file: PathBuf,
    /// Environment variable holding the keystore passphrase.
    pub passphrase_env: String,
    pub log_level: String,
    pub log_format: String,
    /// JSON metrics file read every round.
    pub state_file: Option<PathBuf>,
    /// Peers silent for longer than this are evicted.
    pub peer_ttl_secs: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 7700,
            advertise_host: None,
            data_dir: default_data_dir(),
            keystore_file: PathBuf::from("identity.json"),
            passphrase_env: "TRUSTMESH_PASSPHRASE".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            state_file: None,
            peer_ttl_secs: 300,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("trustmesh"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// A known peer to connect to at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    /// Checked against the signing key when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    pub host: String,
    pub port: u16,
    /// Hex Ed25519 verifying key.
    pub signing_key: String,
    /// Hex X25519 public key.
    pub agreement_key: String,
}

impl BootstrapPeer {
    pub fn from_keys(host: impl Into<String>, port: u16, keys: &PublicKeys) -> Self {
        Self {
            peer_id: Some(keys.peer_id().to_hex()),
            host: host.into(),
            port,
            signing_key: hex::encode(keys.signing),
            agreement_key: hex::encode(keys.agreement),
        }
    }

    pub fn to_record(&self, now: u64) -> Result<PeerRecord> {
        let signing = decode_public_key(&self.signing_key)
            .with_context(|| format!("bootstrap peer {}:{} signing key", self.host, self.port))?;
        let agreement = decode_public_key(&self.agreement_key)
            .with_context(|| format!("bootstrap peer {}:{} agreement key", self.host, self.port))?;
        let record = PeerRecord::new(self.host.clone(), self.port, signing, agreement, now);
        if let Some(expected) = &self.peer_id {
            let expected: PeerId = expected
                .parse()
                .map_err(|err| anyhow!("bootstrap peer {}:{} id: {err}", self.host, self.port))?;
            if expected != record.peer_id {
                bail!(
                    "bootstrap peer {}:{} id {} does not match its signing key ({})",
                    self.host,
                    self.port,
                    expected,
                    record.peer_id
                );
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub transport: TransportConfig,
    pub consensus: ConsensusConfig,
    pub reputation: ReputationConfig,
    pub overlay: OverlayConfig,
    pub peers: Vec<BootstrapPeer>,
}

impl NodeConfig {
    /// Layer the config file (explicit path, else `./trustmesh.toml` if it
    /// exists) under `TRUSTMESH__SECTION__KEY` environment variables.
    pub fn load(path_override: Option<&Path>) -> Result<Self> {
        let resolved = match path_override {
            Some(path) => {
                if !path.exists() {
                    bail!(
                        "Configuration file {} not found (specified via --config)",
                        path.display()
                    );
                }
                Some(path.to_path_buf())
            }
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|path| path.exists()),
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: NodeConfig = builder
            .build()?
            .try_deserialize()
            .context("invalid node configuration")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.listen_port == 0 {
            bail!("node.listen_port must be greater than zero");
        }
        if !matches!(self.node.log_format.as_str(), "pretty" | "json") {
            bail!(
                "node.log_format must be 'pretty' or 'json', got '{}'",
                self.node.log_format
            );
        }
        if self.node.passphrase_env.trim().is_empty() {
            bail!("node.passphrase_env must name an environment variable");
        }
        if self.consensus.round_timeout_ms == 0 || self.consensus.round_interval_ms == 0 {
            bail!("consensus round timeout and interval must be greater than zero");
        }
        if self.consensus.max_batch_size == 0 {
            bail!("consensus.max_batch_size must be greater than zero");
        }
        for (name, delta) in [
            ("reputation.commit_reward", self.reputation.commit_reward),
            ("reputation.silence_penalty", self.reputation.silence_penalty),
        ] {
            if !(0.0..=1.0).contains(&delta) {
                bail!("{name} must be within [0, 1], got {delta}");
            }
        }
        if !(0.0..=1.0).contains(&self.transport.min_broadcast_reputation) {
            bail!("transport.min_broadcast_reputation must be within [0, 1]");
        }
        for peer in &self.peers {
            peer.to_record(0)?;
        }
        Ok(())
    }

    /// `path` unchanged if absolute, otherwise under `node.data_dir`.
    pub fn in_data_dir(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.node.data_dir.join(path)
        }
    }

    pub fn keystore_path(&self) -> PathBuf {
        self.in_data_dir(&self.node.keystore_file)
    }

    /// Relative paths in the reputation, overlay and state settings are
    /// rebased onto `node.data_dir`.
    pub fn resolve_paths(&mut self) {
        if let Some(path) = self.reputation.persist_path.take() {
            self.reputation.persist_path = Some(self.in_data_dir(&path));
        }
        self.reputation.sink_path = self.in_data_dir(&self.reputation.sink_path);
        self.overlay.service_dir = self.in_data_dir(&self.overlay.service_dir);
        if let Some(path) = self.node.state_file.take() {
            self.node.state_file = Some(self.in_data_dir(&path));
        }
    }

    pub fn bootstrap_records(&self, now: u64) -> Result<Vec<PeerRecord>> {
        self.peers.iter().map(|peer| peer.to_record(now)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use trustmesh_crypto::NodeIdentity;
    use trustmesh_network::OverlayMode;

    fn fixture_config() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("config")
            .join("trustmesh.toml")
    }

    #[test]
    fn test_example_config_loads() {
        let config = NodeConfig::load(Some(&fixture_config())).expect("load");
        config.validate().expect("valid");
        assert_eq!(config.node.listen_port, 7700);
        assert_eq!(config.overlay.mode, OverlayMode::Direct);
        assert_eq!(config.consensus.max_view_changes, 5);
        assert_eq!(config.peers.len(), 1);
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let err = NodeConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"), "unexpected error: {err}");
    }

    #[test]
    fn test_sections_fall_back_to_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[consensus]\nround_timeout_ms = 1500\n").expect("write");

        let config = NodeConfig::load(Some(&path)).expect("load");
        assert_eq!(config.consensus.round_timeout_ms, 1500);
        assert_eq!(config.consensus.max_view_changes, ConsensusConfig::default().max_view_changes);
        assert_eq!(config.transport.default_ttl, TransportConfig::default().default_ttl);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_bootstrap_peer_id_must_match_key() {
        let identity = NodeIdentity::generate();
        let other = NodeIdentity::generate();
        let mut peer = BootstrapPeer::from_keys("10.0.0.2", 7700, &identity.public_keys());
        let record = peer.to_record(1).expect("record");
        assert_eq!(record.peer_id, identity.peer_id());

        peer.peer_id = Some(other.peer_id().to_hex());
        assert!(peer.to_record(1).is_err());
    }

    #[test]
    fn test_bad_log_format_is_rejected() {
        let mut config = NodeConfig::default();
        config.node.log_format = "xml".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_format"), "unexpected error: {err}");
    }

    #[test]
    fn test_relative_paths_move_under_data_dir() {
        let mut config = NodeConfig::default();
        config.node.data_dir = PathBuf::from("/var/lib/trustmesh");
        config.reputation.persist_path = Some(PathBuf::from("reputation.json"));
        config.node.state_file = Some(PathBuf::from("/tmp/metrics.json"));
        config.resolve_paths();

        assert_eq!(
            config.reputation.persist_path,
            Some(PathBuf::from("/var/lib/trustmesh/reputation.json"))
        );
        assert_eq!(config.overlay.service_dir, PathBuf::from("/var/lib/trustmesh/onion"));
        assert_eq!(config.node.state_file, Some(PathBuf::from("/tmp/metrics.json")));
        assert_eq!(config.keystore_path(), PathBuf::from("/var/lib/trustmesh/identity.json"));
    }
}
