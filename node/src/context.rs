use crate::config::NodeConfig;
use anyhow::{anyhow, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use trustmesh_crypto::NodeIdentity;
use trustmesh_network::{
    gateway_from_config, AnonymityGateway, AuthorizedClient, DescriptorStore, OnionAddress,
    PeerDirectory, PeerLink, PeerRecord, SendOutcome, TcpLink, Transport,
};
use trustmesh_types::now_millis;

/// Exclusive lock on the data directory for the lifetime of the process.
pub struct DataDirLock {
    path: PathBuf,
    file: File,
}

impl DataDirLock {
    pub fn acquire<P: AsRef<Path>>(data_dir: P, purpose: &str) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)?;
        let lock_path = dir.join(".trustmesh.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        if let Err(err) = file.try_lock_exclusive() {
            return Err(anyhow!(
                "Data directory {} is locked by another process ({}). \
                 Stop the running node or remove {} if you are sure it is stale.",
                dir.display(),
                err,
                lock_path.display()
            ));
        }

        file.set_len(0)?;
        writeln!(
            &file,
            "pid={};purpose={};started_ms={}",
            std::process::id(),
            purpose,
            now_millis()
        )?;

        Ok(Self {
            path: lock_path,
            file,
        })
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

/// Everything the node builds once at startup and shares by reference.
pub struct NodeContext {
    pub config: NodeConfig,
    pub identity: Arc<NodeIdentity>,
    pub directory: Arc<PeerDirectory>,
    pub transport: Transport,
    pub gateway: Arc<dyn AnonymityGateway>,
    pub onion: Option<OnionAddress>,
    overlay_ready: bool,
    bootstrap: Vec<PeerRecord>,
}

impl NodeContext {
    /// Bring up the overlay (when configured) and the transport.
    ///
    /// An overlay that cannot be initialized or published leaves the node on
    /// direct TCP.
    pub async fn build(config: NodeConfig, identity: Arc<NodeIdentity>) -> Result<Self> {
        let now = now_millis();
        let bootstrap = config.bootstrap_records(now)?;
        let gateway = gateway_from_config(&config.overlay, config.transport.max_frame_bytes);

        let overlay_ready = gateway.initialize().await;
        let onion = if overlay_ready {
            let clients = overlay_clients(&config, &bootstrap);
            register_peer_keys(gateway.as_ref(), &identity, &bootstrap).await;
            gateway
                .publish_service(config.node.listen_port, &clients)
                .await
        } else {
            None
        };

        let (address, port) = match &onion {
            Some(onion) => (onion.to_string(), config.overlay.virtual_port),
            None => (
                config
                    .node
                    .advertise_host
                    .clone()
                    .unwrap_or_else(|| config.node.listen_host.clone()),
                config.node.listen_port,
            ),
        };

        let link: Arc<dyn PeerLink> = match overlay_ready.then(|| gateway.outbound_link()).flatten() {
            Some(link) => link,
            None => Arc::new(TcpLink::new(
                config.transport.connect_timeout(),
                config.transport.max_frame_bytes,
            )),
        };

        let keys = identity.public_keys();
        let local = PeerRecord::new(address, port, keys.signing, keys.agreement, now);
        info!(
            peer = %identity.peer_id(),
            endpoint = %local.endpoint(),
            overlay = onion.is_some(),
            "node context ready"
        );
        let directory = Arc::new(PeerDirectory::new(local));
        let transport = Transport::new(
            identity.clone(),
            directory.clone(),
            link,
            config.transport.clone(),
        );

        Ok(Self {
            config,
            identity,
            directory,
            transport,
            gateway,
            onion,
            overlay_ready,
            bootstrap,
        })
    }

    /// Register the local client key for onion peers learned since startup.
    pub async fn authorize_overlay_peers(&self) -> usize {
        if !self.overlay_ready {
            return 0;
        }
        let mut peers = self.bootstrap.clone();
        peers.extend(self.directory.remote_peers());
        register_peer_keys(self.gateway.as_ref(), &self.identity, &peers).await
    }

    pub fn bootstrap_peers(&self) -> &[PeerRecord] {
        &self.bootstrap
    }

    /// Connect to every bootstrap peer that is not currently connected.
    /// Returns the number of successful connections.
    pub async fn connect_bootstrap(&self) -> usize {
        let mut connected = 0;
        for peer in &self.bootstrap {
            if self
                .directory
                .get(&peer.peer_id)
                .is_some_and(|record| record.is_connected())
            {
                continue;
            }
            if self.transport.connect(peer).await {
                connected += 1;
            } else {
                warn!(peer = %peer.peer_id, endpoint = %peer.endpoint(), "bootstrap peer unreachable");
            }
        }
        connected
    }

    /// Broadcast the local address and keys.
    pub fn announce(&self) -> SendOutcome {
        let local = self.directory.local_id();
        match self.directory.get(&local) {
            Some(record) => self.transport.announce(record.address, record.port),
            None => self.transport.announce(self.config.node.listen_host.clone(), self.config.node.listen_port),
        }
    }

    /// Drop peers that have been silent for longer than the configured TTL.
    pub fn evict_silent(&self) -> usize {
        let ttl_ms = self.config.node.peer_ttl_secs.saturating_mul(1_000);
        let evicted = self.directory.evict_silent(now_millis(), ttl_ms);
        for peer in &evicted {
            info!(peer = %peer, "evicted silent peer");
        }
        evicted.len()
    }
}

/// Hand the agreement secret to the overlay for every onion peer, so the
/// services that authorize this node's agreement key resolve.
async fn register_peer_keys(gateway: &dyn AnonymityGateway, identity: &NodeIdentity, peers: &[PeerRecord]) -> usize {
    let secret = identity.agreement_secret_bytes();
    match gateway.register_peer_keys(&secret, peers).await {
        Ok(added) => added,
        Err(err) => {
            warn!(error = %err, "failed to register overlay client authorization");
            0
        }
    }
}

/// Clients allowed to resolve the onion service: every bootstrap peer by its
/// agreement key plus the clients authorized on disk.
fn overlay_clients(config: &NodeConfig, bootstrap: &[PeerRecord]) -> Vec<AuthorizedClient> {
    let mut clients: Vec<AuthorizedClient> = bootstrap
        .iter()
        .map(|peer| AuthorizedClient::from_public_key(format!("peer-{}", peer.peer_id.short()), peer.agreement_key))
        .collect();
    match DescriptorStore::new(&config.overlay.service_dir).load_server_descriptors() {
        Ok(stored) => {
            for client in stored {
                if !clients.iter().any(|known| known.label == client.label) {
                    clients.push(client);
                }
            }
        }
        Err(err) => warn!(error = %err, "ignoring unreadable client authorizations"),
    }
    clients
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.data_dir = dir.to_path_buf();
        config.node.listen_host = "127.0.0.1".to_string();
        config.resolve_paths();
        config
    }

    #[test]
    fn test_data_dir_lock_is_exclusive() {
        let dir = tempdir().expect("tempdir");
        let lock = DataDirLock::acquire(dir.path(), "test").expect("first lock");
        assert!(DataDirLock::acquire(dir.path(), "test").is_err());
        drop(lock);
        DataDirLock::acquire(dir.path(), "test").expect("lock released");
    }

    #[tokio::test]
    async fn test_direct_context_advertises_listen_address() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path());
        let identity = Arc::new(NodeIdentity::generate());
        let context = NodeContext::build(config, identity.clone())
            .await
            .expect("context");

        assert!(context.onion.is_none());
        let local = context.directory.get(&identity.peer_id()).expect("local record");
        assert_eq!(local.endpoint(), "127.0.0.1:7700");
        assert_eq!(context.directory.live_count(), 1);
        assert_eq!(context.evict_silent(), 0);
        assert_eq!(context.authorize_overlay_peers().await, 0);
    }

    #[test]
    fn test_overlay_clients_merge_bootstrap_and_stored() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path());
        let store = DescriptorStore::new(&config.overlay.service_dir);
        store
            .write_server(&AuthorizedClient::from_public_key("laptop", [9; 32]))
            .expect("write");

        let peer = NodeIdentity::generate().public_keys();
        let bootstrap = vec![PeerRecord::new("10.0.0.2", 7700, peer.signing, peer.agreement, 0)];
        let clients = overlay_clients(&config, &bootstrap);

        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].public_key, peer.agreement);
        assert!(clients[0].label.starts_with("peer-"));
        assert_eq!(clients[1].label, "laptop");
    }
}
