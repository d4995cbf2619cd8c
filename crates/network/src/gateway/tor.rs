//! Tor control-port gateway and SOCKS5 outbound link.

use super::client_auth::{
    client_auth_add_command, encode_key, is_onion_address, validate_label, write_private_file,
    AuthorizedClient, DescriptorStore,
};
use super::{AnonymityGateway, OnionAddress, OverlayConfig, OverlayMode};
use crate::errors::{GatewayError, NetworkError};
use crate::link::{FrameSink, PeerLink, TcpFrameSink};
use crate::peers::PeerRecord;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const NEW_KEY_SPEC: &str = "NEW:ED25519-V3";
const KEY_FILE: &str = "onion_service.key";
const HOSTNAME_FILE: &str = "hostname";
const CIRCUIT_TIMEOUT: Duration = Duration::from_secs(30);

struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl ControlConnection {
    async fn connect(addr: &str, limit: Duration) -> Result<Self, GatewayError> {
        let stream = timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| GatewayError::ControlUnavailable(format!("connect to {addr} timed out")))?
            .map_err(|err| GatewayError::ControlUnavailable(format!("{addr}: {err}")))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            timeout: limit,
        })
    }

    /// Send one command and collect its reply lines. Fails unless the final
    /// status code is 250.
    async fn command(&mut self, line: &str) -> Result<Vec<String>, GatewayError> {
        let limit = self.timeout;
        timeout(limit, self.exchange(line))
            .await
            .map_err(|_| GatewayError::ControlUnavailable("control reply timed out".into()))?
    }

    async fn exchange(&mut self, line: &str) -> Result<Vec<String>, GatewayError> {
        let verb = line.split_whitespace().next().unwrap_or_default();
        debug!(command = verb, "tor control command");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;

        let mut replies = Vec::new();
        loop {
            let mut raw = String::new();
            if self.reader.read_line(&mut raw).await? == 0 {
                return Err(GatewayError::ControlUnavailable("control connection closed".into()));
            }
            let reply = raw.trim_end_matches(['\r', '\n']).to_string();
            if reply.len() < 4 || !reply.is_char_boundary(3) {
                return Err(GatewayError::Protocol(reply));
            }
            let last = reply.as_bytes()[3] == b' ';
            replies.push(reply);
            if last {
                break;
            }
        }

        match replies.last() {
            Some(status) if status.starts_with("250") => Ok(replies),
            Some(status) => Err(GatewayError::Rejected(status.clone())),
            None => Err(GatewayError::Protocol("empty reply".into())),
        }
    }
}

fn reply_value<'a>(replies: &'a [String], key: &str) -> Option<&'a str> {
    replies
        .iter()
        .filter_map(|line| line.get(4..))
        .find_map(|body| body.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

struct PublishedService {
    service_id: String,
    key_spec: String,
    local_port: u16,
    clients: BTreeMap<String, [u8; 32]>,
}

#[derive(Default)]
struct TorState {
    control: Option<ControlConnection>,
    service: Option<PublishedService>,
    /// Peer services the local client key is registered for.
    registered: HashSet<String>,
}

/// Publishes a client-authorized v3 onion service through the Tor control
/// port and dials peers through Tor's SOCKS port.
pub struct TorGateway {
    config: OverlayConfig,
    store: DescriptorStore,
    max_frame_bytes: usize,
    state: Mutex<TorState>,
}

impl TorGateway {
    pub fn new(config: OverlayConfig, max_frame_bytes: usize) -> Self {
        let store = DescriptorStore::new(config.service_dir.clone());
        Self {
            config,
            store,
            max_frame_bytes,
            state: Mutex::new(TorState::default()),
        }
    }

    pub fn store(&self) -> &DescriptorStore {
        &self.store
    }

    async fn authenticate(&self, connection: &mut ControlConnection) -> Result<(), GatewayError> {
        let command = if let Some(password) = &self.config.control_password {
            format!("AUTHENTICATE {}", quote(password))
        } else if let Some(cookie) = &self.config.cookie_path {
            format!("AUTHENTICATE {}", hex::encode(fs::read(cookie)?))
        } else {
            "AUTHENTICATE".to_string()
        };
        connection.command(&command).await.map(|_| ())
    }

    fn stored_key(&self) -> Result<Option<String>, GatewayError> {
        match fs::read_to_string(self.store.root().join(KEY_FILE)) {
            Ok(key) if !key.trim().is_empty() => Ok(Some(key.trim().to_string())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn add_onion(
        &self,
        connection: &mut ControlConnection,
        key_spec: &str,
        local_port: u16,
        clients: &BTreeMap<String, [u8; 32]>,
    ) -> Result<(String, Option<String>), GatewayError> {
        let mut command = format!(
            "ADD_ONION {key_spec} Flags=V3Auth Port={},127.0.0.1:{local_port}",
            self.config.virtual_port
        );
        for public_key in clients.values() {
            command.push_str(" ClientAuthV3=");
            command.push_str(&encode_key(public_key));
        }
        let replies = connection.command(&command).await?;
        let service_id = reply_value(&replies, "ServiceID")
            .ok_or_else(|| GatewayError::Protocol("ADD_ONION reply without ServiceID".into()))?
            .to_string();
        let private_key = reply_value(&replies, "PrivateKey").map(str::to_string);
        Ok((service_id, private_key))
    }

    async fn try_publish(
        &self,
        port: u16,
        clients: &[AuthorizedClient],
    ) -> Result<OnionAddress, GatewayError> {
        if clients.is_empty() {
            return Err(GatewayError::Rejected(
                "refusing to publish a service without authorized clients".into(),
            ));
        }
        for client in clients {
            validate_label(&client.label)?;
        }

        let mut state = self.state.lock().await;
        let TorState { control, service, .. } = &mut *state;
        let connection = control
            .as_mut()
            .ok_or_else(|| GatewayError::ControlUnavailable("gateway not initialized".into()))?;

        if let Some(previous) = service.take() {
            connection
                .command(&format!("DEL_ONION {}", previous.service_id))
                .await?;
        }

        for client in clients {
            self.store.write_server(client)?;
        }
        let authorized: BTreeMap<String, [u8; 32]> = clients
            .iter()
            .map(|client| (client.label.clone(), client.public_key))
            .collect();

        let requested = self.stored_key()?.unwrap_or_else(|| NEW_KEY_SPEC.to_string());
        let (service_id, issued_key) = self
            .add_onion(connection, &requested, port, &authorized)
            .await?;
        let key_spec = match issued_key {
            Some(key) => {
                write_private_file(&self.store.root().join(KEY_FILE), &key)?;
                key
            }
            None => requested,
        };

        let address = OnionAddress::from_service_id(&service_id);
        write_private_file(&self.store.root().join(HOSTNAME_FILE), address.as_str())?;
        for client in clients {
            if let Some(private_key) = &client.private_key {
                self.store
                    .write_client(&client.label, address.as_str(), private_key)?;
            }
        }

        *service = Some(PublishedService {
            service_id,
            key_spec,
            local_port: port,
            clients: authorized,
        });
        info!(%address, clients = clients.len(), "published onion service");
        Ok(address)
    }
}

#[async_trait]
impl AnonymityGateway for TorGateway {
    fn mode(&self) -> OverlayMode {
        OverlayMode::Tor
    }

    async fn initialize(&self) -> bool {
        let mut connection =
            match ControlConnection::connect(&self.config.control_addr, self.config.control_timeout()).await {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(error = %err, "tor control port unavailable, staying on direct transport");
                    return false;
                }
            };
        if let Err(err) = self.authenticate(&mut connection).await {
            warn!(error = %err, "tor control authentication failed");
            return false;
        }
        self.state.lock().await.control = Some(connection);
        info!(control = %self.config.control_addr, "tor gateway ready");
        true
    }

    async fn publish_service(&self, port: u16, clients: &[AuthorizedClient]) -> Option<OnionAddress> {
        match self.try_publish(port, clients).await {
            Ok(address) => Some(address),
            Err(err) => {
                warn!(error = %err, "failed to publish onion service");
                None
            }
        }
    }

    async fn revoke(&self, label: &str) -> Result<bool, GatewayError> {
        let removed = self.store.remove_server(label)?;
        match fs::remove_file(self.store.client_path(label)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let mut state = self.state.lock().await;
        let forgotten = state
            .service
            .as_mut()
            .map(|service| service.clients.remove(label).is_some())
            .unwrap_or(false);
        if removed || forgotten {
            info!(label, "revoked overlay client");
        }
        Ok(removed || forgotten)
    }

    async fn reload(&self) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        let TorState { control, service, .. } = &mut *state;
        let connection = control
            .as_mut()
            .ok_or_else(|| GatewayError::ControlUnavailable("gateway not initialized".into()))?;
        connection.command("SIGNAL RELOAD").await?;

        let withdraw = match service.as_mut() {
            None => false,
            Some(published) => {
                published.clients = self
                    .store
                    .load_server_descriptors()?
                    .into_iter()
                    .map(|client| (client.label, client.public_key))
                    .collect();
                connection
                    .command(&format!("DEL_ONION {}", published.service_id))
                    .await?;
                if published.clients.is_empty() {
                    warn!("no authorized clients remain, onion service withdrawn");
                    true
                } else {
                    let (service_id, _) = self
                        .add_onion(connection, &published.key_spec, published.local_port, &published.clients)
                        .await?;
                    published.service_id = service_id;
                    false
                }
            }
        };
        if withdraw {
            *service = None;
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        let TorState { control, service, .. } = &mut *state;
        if let (Some(connection), Some(published)) = (control.as_mut(), service.take()) {
            connection
                .command(&format!("DEL_ONION {}", published.service_id))
                .await?;
            info!(service = %published.service_id, "onion service removed");
        }
        Ok(())
    }

    async fn register_peer_keys(&self, secret: &[u8; 32], peers: &[PeerRecord]) -> Result<usize, GatewayError> {
        let mut state = self.state.lock().await;
        let TorState {
            control, registered, ..
        } = &mut *state;
        let connection = control
            .as_mut()
            .ok_or_else(|| GatewayError::ControlUnavailable("gateway not initialized".into()))?;

        let mut added = 0;
        for peer in peers {
            if !is_onion_address(&peer.address) {
                continue;
            }
            let service_id = OnionAddress::from_service_id(&peer.address).service_id().to_string();
            if registered.contains(&service_id) {
                continue;
            }
            connection
                .command(&client_auth_add_command(&service_id, secret))
                .await?;
            debug!(peer = %peer.peer_id, "client authorization registered for peer service");
            registered.insert(service_id);
            added += 1;
        }
        if added > 0 {
            info!(peers = added, "overlay client authorization registered");
        }
        Ok(added)
    }

    fn outbound_link(&self) -> Option<Arc<dyn PeerLink>> {
        Some(Arc::new(SocksLink::new(
            self.config.socks_addr.clone(),
            CIRCUIT_TIMEOUT,
            self.max_frame_bytes,
        )))
    }
}

/// Dials peers through a SOCKS5 proxy (Tor's SOCKS port).
#[derive(Debug, Clone)]
pub struct SocksLink {
    proxy: String,
    connect_timeout: Duration,
    max_frame_bytes: usize,
}

impl SocksLink {
    pub fn new(proxy: impl Into<String>, connect_timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            proxy: proxy.into(),
            connect_timeout,
            max_frame_bytes,
        }
    }
}

#[async_trait]
impl PeerLink for SocksLink {
    async fn open(&self, peer: &PeerRecord) -> Result<Box<dyn FrameSink>, NetworkError> {
        let stream = timeout(
            self.connect_timeout,
            socks5_connect(&self.proxy, &peer.address, peer.port),
        )
        .await
        .map_err(|_| NetworkError::Timeout(peer.peer_id))?
        .map_err(|err| NetworkError::Unreachable {
            peer: peer.peer_id,
            reason: err.to_string(),
        })?;
        Ok(Box::new(TcpFrameSink::new(stream, self.max_frame_bytes)))
    }
}

fn socks_error(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::Other, message.into())
}

async fn socks5_connect(proxy: &str, host: &str, port: u16) -> io::Result<TcpStream> {
    let host = host.as_bytes();
    if host.is_empty() || host.len() > 255 {
        return Err(socks_error("socks host name must be 1-255 bytes"));
    }

    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [0x05, 0x00] {
        return Err(socks_error("socks proxy refused the no-auth method"));
    }

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
    request.extend_from_slice(host);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(socks_error(format!("socks connect failed with code {}", head[1])));
    }
    let address_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(socks_error(format!("unknown socks address type {other}"))),
    };
    let mut bound = vec![0u8; address_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::client_auth::ClientAuthKeypair;
    use crate::link::read_frame;
    use std::net::SocketAddr;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::net::TcpListener;
    use trustmesh_types::{MessageType, NetworkMessage, PeerId, Recipient};

    const SERVICE_ID: &str = "pg6mmjiyjmcrsslvykfwnntlaru7p5svn6y2ymmju6nubxndf4pscryd";
    const KEY_BLOB: &str = "ED25519-V3:S2V5QmxvYg==";

    type CommandLog = Arc<parking_lot::Mutex<Vec<String>>>;

    async fn fake_tor() -> (SocketAddr, CommandLog) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let log: CommandLog = Arc::default();
        let seen = log.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                seen.lock().push(line.clone());
                let reply = if line.starts_with("ADD_ONION NEW:") {
                    format!("250-ServiceID={SERVICE_ID}\r\n250-PrivateKey={KEY_BLOB}\r\n250 OK\r\n")
                } else if line.starts_with("ADD_ONION") {
                    format!("250-ServiceID={SERVICE_ID}\r\n250 OK\r\n")
                } else if line.starts_with("BOGUS") {
                    "510 Unrecognized command\r\n".to_string()
                } else {
                    "250 OK\r\n".to_string()
                };
                if writer.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        (addr, log)
    }

    fn config(control: SocketAddr, dir: &Path) -> OverlayConfig {
        OverlayConfig {
            mode: OverlayMode::Tor,
            control_addr: control.to_string(),
            control_password: Some("s3cret".into()),
            service_dir: dir.to_path_buf(),
            ..OverlayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_publish_revoke_and_reload_flow() {
        let (addr, log) = fake_tor().await;
        let dir = tempdir().expect("tempdir");
        let gateway = TorGateway::new(config(addr, dir.path()), 1024);
        assert!(gateway.initialize().await);
        assert_eq!(log.lock()[0], "AUTHENTICATE \"s3cret\"");

        let alice_keys = ClientAuthKeypair::generate();
        let alice = alice_keys.authorize("alice");
        let bob = AuthorizedClient::from_public_key("bob", ClientAuthKeypair::generate().public_bytes());

        let address = gateway
            .publish_service(7000, &[alice.clone(), bob.clone()])
            .await
            .expect("published");
        assert_eq!(address.service_id(), SERVICE_ID);

        let add = log.lock()[1].clone();
        assert_eq!(
            add,
            format!(
                "ADD_ONION NEW:ED25519-V3 Flags=V3Auth Port=7700,127.0.0.1:7000 ClientAuthV3={} ClientAuthV3={}",
                encode_key(&alice.public_key),
                encode_key(&bob.public_key)
            )
        );

        let store = gateway.store();
        assert!(store.server_path("alice").exists());
        assert!(store.server_path("bob").exists());
        assert!(store.client_path("alice").exists());
        assert!(!store.client_path("bob").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join(KEY_FILE)).expect("key").trim(),
            KEY_BLOB
        );

        assert!(gateway.revoke("bob").await.expect("revoke"));
        assert!(!store.server_path("bob").exists());

        gateway.reload().await.expect("reload");
        let commands = log.lock().clone();
        assert!(commands.contains(&"SIGNAL RELOAD".to_string()));
        assert!(commands.contains(&format!("DEL_ONION {SERVICE_ID}")));
        let republished = commands.last().expect("re-add").clone();
        assert_eq!(
            republished,
            format!(
                "ADD_ONION {KEY_BLOB} Flags=V3Auth Port=7700,127.0.0.1:7000 ClientAuthV3={}",
                encode_key(&alice.public_key)
            )
        );

        gateway.teardown().await.expect("teardown");
        assert_eq!(
            log.lock().last().cloned(),
            Some(format!("DEL_ONION {SERVICE_ID}"))
        );
    }

    #[tokio::test]
    async fn test_peer_services_get_local_client_key_once() {
        let (addr, log) = fake_tor().await;
        let dir = tempdir().expect("tempdir");
        let gateway = TorGateway::new(config(addr, dir.path()), 1024);
        let secret = [7u8; 32];
        let onion_peer = PeerRecord::new(format!("{SERVICE_ID}.onion"), 7700, [1; 32], [2; 32], 0);
        let direct_peer = PeerRecord::new("10.0.0.2", 7700, [3; 32], [4; 32], 0);
        let peers = [onion_peer, direct_peer];

        assert!(matches!(
            gateway.register_peer_keys(&secret, &peers).await,
            Err(GatewayError::ControlUnavailable(_))
        ));
        assert!(gateway.initialize().await);
        assert_eq!(gateway.register_peer_keys(&secret, &peers).await.expect("register"), 1);
        assert_eq!(log.lock()[1], client_auth_add_command(SERVICE_ID, &secret));
        assert!(log.lock()[1].starts_with(&format!("ONION_CLIENT_AUTH_ADD {SERVICE_ID} x25519:")));

        assert_eq!(gateway.register_peer_keys(&secret, &peers).await.expect("register"), 0);
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_initialize_fails_softly_without_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let dir = tempdir().expect("tempdir");
        let gateway = TorGateway::new(config(addr, dir.path()), 1024);
        assert!(!gateway.initialize().await);
        assert!(gateway
            .publish_service(7000, &[ClientAuthKeypair::generate().authorize("a")])
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_unrestricted_service_is_refused() {
        let (addr, log) = fake_tor().await;
        let dir = tempdir().expect("tempdir");
        let gateway = TorGateway::new(config(addr, dir.path()), 1024);
        assert!(gateway.initialize().await);
        assert!(gateway.publish_service(7000, &[]).await.is_none());
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_commands_surface_status_line() {
        let (addr, _log) = fake_tor().await;
        let mut connection = ControlConnection::connect(&addr.to_string(), Duration::from_secs(2))
            .await
            .expect("connect");
        let err = connection.command("BOGUS").await.expect_err("rejected");
        assert!(matches!(err, GatewayError::Rejected(line) if line.starts_with("510")));
    }

    #[tokio::test]
    async fn test_socks_link_performs_handshake_before_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let proxy = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.expect("greeting");
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.expect("method");

            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.expect("request head");
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut host = vec![0u8; head[4] as usize + 2];
            stream.read_exact(&mut host).await.expect("host");
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .expect("reply");

            let frame = read_frame(&mut stream, 1024).await.expect("frame");
            (String::from_utf8_lossy(&host[..host.len() - 2]).to_string(), frame)
        });

        let keys = [4u8; 32];
        let peer = PeerRecord::new(format!("{SERVICE_ID}.onion"), 7700, keys, keys, 0);
        let link = SocksLink::new(proxy.to_string(), Duration::from_secs(2), 1024);
        let mut sink = link.open(&peer).await.expect("open through proxy");
        let message = NetworkMessage::new(
            PeerId::from_public_key(&keys),
            Recipient::Broadcast,
            MessageType::Ping,
            vec![1],
            1,
        );
        sink.send_frame(&message).await.expect("send");

        let (host, frame) = server.await.expect("server task");
        assert_eq!(host, format!("{SERVICE_ID}.onion"));
        assert_eq!(frame, Some(message));
    }
}
