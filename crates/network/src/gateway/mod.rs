//! Optional anonymity overlay.
//!
//! The node selects one gateway at startup from its configuration: the Tor
//! control-port client or the disabled no-op. A gateway that fails to
//! initialize leaves the node on direct transport.

pub mod client_auth;
pub mod tor;

use crate::errors::GatewayError;
use crate::link::PeerLink;
use crate::peers::PeerRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use client_auth::{AuthorizedClient, ClientAuthKeypair, DescriptorStore};
pub use tor::{SocksLink, TorGateway};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayMode {
    #[default]
    Direct,
    Tor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub mode: OverlayMode,
    /// Tor control port.
    pub control_addr: String,
    pub control_password: Option<String>,
    /// Control auth cookie, used when no password is configured.
    pub cookie_path: Option<PathBuf>,
    /// Tor SOCKS port for outbound connections to onion addresses.
    pub socks_addr: String,
    /// Holds the service key, hostname and client authorization files.
    pub service_dir: PathBuf,
    /// Port advertised on the onion address.
    pub virtual_port: u16,
    pub control_timeout_ms: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            mode: OverlayMode::Direct,
            control_addr: "127.0.0.1:9051".to_string(),
            control_password: None,
            cookie_path: None,
            socks_addr: "127.0.0.1:9050".to_string(),
            service_dir: PathBuf::from("onion"),
            virtual_port: 7700,
            control_timeout_ms: 5_000,
        }
    }
}

impl OverlayConfig {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

/// A published rendezvous address, `<56 base32 chars>.onion`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OnionAddress(String);

impl OnionAddress {
    pub fn from_service_id(service_id: &str) -> Self {
        Self(format!("{}.onion", service_id.trim_end_matches(".onion")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address without the `.onion` suffix.
    pub fn service_id(&self) -> &str {
        self.0.trim_end_matches(".onion")
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability interface for the anonymity overlay.
#[async_trait]
pub trait AnonymityGateway: Send + Sync {
    fn mode(&self) -> OverlayMode;

    /// Open the control channel. `false` means the overlay is unavailable and
    /// the caller should stay on direct transport.
    async fn initialize(&self) -> bool;

    /// Publish a service forwarding to local `port`, resolvable only by the
    /// given clients. Writes one server descriptor per client and a
    /// client-side descriptor for every client that carries a private key.
    async fn publish_service(&self, port: u16, clients: &[AuthorizedClient]) -> Option<OnionAddress>;

    /// Delete the server descriptor for `label`. Takes effect on `reload`.
    async fn revoke(&self, label: &str) -> Result<bool, GatewayError>;

    /// Ask the daemon to reload and re-apply the current authorizations.
    async fn reload(&self) -> Result<(), GatewayError>;

    /// Remove the published service.
    async fn teardown(&self) -> Result<(), GatewayError>;

    /// Register the local client-auth secret for the service of every onion
    /// peer, so dials to their client-authorized services resolve. Returns
    /// how many peers were newly registered.
    async fn register_peer_keys(&self, secret: &[u8; 32], peers: &[PeerRecord]) -> Result<usize, GatewayError>;

    /// Link for outbound connections through the overlay, if any.
    fn outbound_link(&self) -> Option<Arc<dyn PeerLink>>;
}

/// Gateway used when the overlay is off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledGateway;

#[async_trait]
impl AnonymityGateway for DisabledGateway {
    fn mode(&self) -> OverlayMode {
        OverlayMode::Direct
    }

    async fn initialize(&self) -> bool {
        false
    }

    async fn publish_service(&self, _port: u16, _clients: &[AuthorizedClient]) -> Option<OnionAddress> {
        None
    }

    async fn revoke(&self, _label: &str) -> Result<bool, GatewayError> {
        Ok(false)
    }

    async fn reload(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn teardown(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn register_peer_keys(&self, _secret: &[u8; 32], _peers: &[PeerRecord]) -> Result<usize, GatewayError> {
        Ok(0)
    }

    fn outbound_link(&self) -> Option<Arc<dyn PeerLink>> {
        None
    }
}

/// Pick the gateway implementation named by `config.mode`.
pub fn gateway_from_config(config: &OverlayConfig, max_frame_bytes: usize) -> Arc<dyn AnonymityGateway> {
    match config.mode {
        OverlayMode::Direct => Arc::new(DisabledGateway),
        OverlayMode::Tor => Arc::new(TorGateway::new(config.clone(), max_frame_bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_gateway_is_inert() {
        let gateway = gateway_from_config(&OverlayConfig::default(), 1024);
        assert_eq!(gateway.mode(), OverlayMode::Direct);
        assert!(!gateway.initialize().await);
        assert!(gateway.publish_service(7000, &[]).await.is_none());
        assert!(!gateway.revoke("anyone").await.expect("no-op"));
        let peer = PeerRecord::new("abcdef.onion", 7700, [1; 32], [2; 32], 0);
        assert_eq!(gateway.register_peer_keys(&[3; 32], &[peer]).await.expect("no-op"), 0);
        assert!(gateway.outbound_link().is_none());
    }

    #[test]
    fn test_tor_mode_selects_tor_gateway() {
        let config = OverlayConfig {
            mode: OverlayMode::Tor,
            ..OverlayConfig::default()
        };
        assert_eq!(gateway_from_config(&config, 1024).mode(), OverlayMode::Tor);
    }

    #[test]
    fn test_onion_address_strips_suffix() {
        let address = OnionAddress::from_service_id("abcdef");
        assert_eq!(address.as_str(), "abcdef.onion");
        assert_eq!(address.service_id(), "abcdef");
        assert_eq!(OnionAddress::from_service_id("abcdef.onion"), address);
    }
}
