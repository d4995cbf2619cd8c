//! Authenticated message transport.
//!
//! Every peer gets its own worker task that owns the outbound connection,
//! retries with exponential backoff and never blocks traffic to other
//! peers. Inbound envelopes are verified against the sender's signing key,
//! deduplicated and then dispatched to the handler registered for their
//! message type. Invalid traffic is dropped and counted, never surfaced.

use crate::backoff::Backoff;
use crate::deduplication::MessageDeduplicator;
use crate::errors::NetworkError;
use crate::link::{FrameSink, PeerLink};
use crate::peers::{ConnectionStatus, PeerDirectory, PeerRecord};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use trustmesh_crypto::{verify_signature, NodeIdentity};
use trustmesh_types::{now_millis, MessageType, NetworkMessage, PeerId, Recipient};

/// Transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Hop budget stamped on locally authored envelopes.
    pub default_ttl: u8,
    pub connect_timeout_ms: u64,
    /// Attempts per explicit connect before the peer is marked disconnected.
    pub max_connect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Outbound frames buffered per peer before new ones are dropped.
    pub queue_depth: usize,
    pub max_frame_bytes: usize,
    /// Minimum reputation for a peer to receive broadcasts.
    pub min_broadcast_reputation: f64,
    /// Forward broadcast envelopes to trusted peers not yet on the route.
    pub relay_broadcasts: bool,
    pub dedup_retention_secs: u64,
    pub dedup_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_ttl: trustmesh_types::DEFAULT_TTL,
            connect_timeout_ms: 10_000,
            max_connect_attempts: 5,
            backoff_base_ms: 250,
            backoff_cap_ms: 8_000,
            queue_depth: 256,
            max_frame_bytes: 1024 * 1024,
            min_broadcast_reputation: 0.3,
            relay_broadcasts: true,
            dedup_retention_secs: 300,
            dedup_capacity: 10_000,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Backoff between the attempts of one explicit connect.
    pub fn connect_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
            self.max_connect_attempts.saturating_sub(1),
        )
    }

    /// Schedule for background reconnects after a peer was lost.
    pub fn retry_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
            self.max_connect_attempts,
        )
    }
}

/// Receives envelopes of the message types it was registered for.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: NetworkMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(NetworkMessage) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle_message(&self, message: NetworkMessage) -> anyhow::Result<()> {
        self(message)
    }
}

/// Why an outbound envelope was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TtlExhausted,
    RoutingLoop,
    SelfAddressed,
    UnknownRecipient,
    NotBroadcast,
    QueueFull,
    Unencodable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued { peers: usize },
    Dropped(DropReason),
}

/// Self-introduction carried by `MessageType::PeerAnnounce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub address: String,
    pub port: u16,
    pub signing_key: [u8; 32],
    pub agreement_key: [u8; 32],
}

impl PeerAnnouncement {
    pub fn into_record(self, now: u64) -> PeerRecord {
        PeerRecord::new(self.address, self.port, self.signing_key, self.agreement_key, now)
    }
}

#[derive(Debug, Default)]
struct TransportStats {
    received: AtomicU64,
    delivered: AtomicU64,
    sent: AtomicU64,
    dropped_unknown_sender: AtomicU64,
    dropped_invalid_signature: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_ttl: AtomicU64,
    dropped_loop: AtomicU64,
    dropped_malformed: AtomicU64,
    queue_full: AtomicU64,
    send_failures: AtomicU64,
    connect_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of the transport counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStatsSnapshot {
    pub received: u64,
    pub delivered: u64,
    pub sent: u64,
    pub dropped_unknown_sender: u64,
    pub dropped_invalid_signature: u64,
    pub dropped_duplicate: u64,
    pub dropped_ttl: u64,
    pub dropped_loop: u64,
    pub dropped_malformed: u64,
    pub queue_full: u64,
    pub send_failures: u64,
    pub connect_failures: u64,
}

impl TransportStats {
    fn snapshot(&self) -> TransportStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        TransportStatsSnapshot {
            received: load(&self.received),
            delivered: load(&self.delivered),
            sent: load(&self.sent),
            dropped_unknown_sender: load(&self.dropped_unknown_sender),
            dropped_invalid_signature: load(&self.dropped_invalid_signature),
            dropped_duplicate: load(&self.dropped_duplicate),
            dropped_ttl: load(&self.dropped_ttl),
            dropped_loop: load(&self.dropped_loop),
            dropped_malformed: load(&self.dropped_malformed),
            queue_full: load(&self.queue_full),
            send_failures: load(&self.send_failures),
            connect_failures: load(&self.connect_failures),
        }
    }
}

enum WorkerCommand {
    Connect(oneshot::Sender<bool>),
    Send(NetworkMessage),
}

struct Shared {
    identity: Arc<NodeIdentity>,
    directory: Arc<PeerDirectory>,
    link: Arc<dyn PeerLink>,
    config: TransportConfig,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    workers: Mutex<HashMap<PeerId, mpsc::Sender<WorkerCommand>>>,
    dedup: MessageDeduplicator,
    stats: Arc<TransportStats>,
}

/// Cloneable handle to the node's transport.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    pub fn new(
        identity: Arc<NodeIdentity>,
        directory: Arc<PeerDirectory>,
        link: Arc<dyn PeerLink>,
        config: TransportConfig,
    ) -> Self {
        let dedup = MessageDeduplicator::new(
            Duration::from_secs(config.dedup_retention_secs),
            config.dedup_capacity,
        );
        Self {
            shared: Arc::new(Shared {
                identity,
                directory,
                link,
                config,
                handlers: RwLock::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                dedup,
                stats: Arc::new(TransportStats::default()),
            }),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.shared.identity.peer_id()
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.shared.directory
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Route inbound envelopes of `message_type` to `handler`, replacing any
    /// previous registration.
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.shared.handlers.write().insert(message_type, handler);
    }

    /// Connect to `peer`, adding it to the directory if needed.
    ///
    /// Idempotent: an already connected peer returns `true` immediately.
    /// Otherwise up to `max_connect_attempts` are made with exponential
    /// backoff before the peer is marked disconnected.
    pub async fn connect(&self, peer: &PeerRecord) -> bool {
        if peer.peer_id == self.local_id() {
            return true;
        }
        if !self.shared.directory.contains(&peer.peer_id) {
            if let Err(err) = self.shared.directory.add(peer.clone()) {
                warn!(peer = %peer.peer_id, error = %err, "refusing to connect");
                return false;
            }
        }
        let worker = self.worker_for(peer.peer_id);
        let (reply, result) = oneshot::channel();
        if worker.send(WorkerCommand::Connect(reply)).await.is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }

    /// Author, sign and send a new envelope.
    pub fn publish(
        &self,
        message_type: MessageType,
        recipient: Recipient,
        payload: Vec<u8>,
    ) -> SendOutcome {
        let mut message =
            NetworkMessage::new(self.local_id(), recipient, message_type, payload, now_millis())
                .with_ttl(self.shared.config.default_ttl);
        self.shared.identity.sign_envelope(&mut message);
        self.shared.dedup.check_and_mark(message.dedup_key());
        self.send(message)
    }

    /// Forward an envelope one hop.
    ///
    /// Drops it when the TTL is spent or the local node is already on its
    /// route; otherwise decrements the TTL, appends the local id and queues
    /// it for the recipient (or every trusted peer for broadcasts).
    pub fn send(&self, mut message: NetworkMessage) -> SendOutcome {
        let local = self.local_id();
        if message.ttl == 0 {
            bump(&self.shared.stats.dropped_ttl);
            debug!(id = %message.message_id, "dropping envelope with exhausted ttl");
            return SendOutcome::Dropped(DropReason::TtlExhausted);
        }
        if message.has_visited(&local) {
            bump(&self.shared.stats.dropped_loop);
            debug!(id = %message.message_id, "dropping looping envelope");
            return SendOutcome::Dropped(DropReason::RoutingLoop);
        }
        message.ttl -= 1;
        message.route_path.push(local);

        match message.recipient_id {
            Recipient::Broadcast => self.fan_out(message),
            Recipient::Peer(target) if target == local => {
                SendOutcome::Dropped(DropReason::SelfAddressed)
            }
            Recipient::Peer(target) => {
                if !self.shared.directory.contains(&target) {
                    debug!(peer = %target, "no route to recipient");
                    return SendOutcome::Dropped(DropReason::UnknownRecipient);
                }
                if self.enqueue(target, message) {
                    SendOutcome::Queued { peers: 1 }
                } else {
                    SendOutcome::Dropped(DropReason::QueueFull)
                }
            }
        }
    }

    /// Send a broadcast envelope to every trusted peer.
    pub fn broadcast(&self, message: NetworkMessage) -> SendOutcome {
        if !message.recipient_id.is_broadcast() {
            return SendOutcome::Dropped(DropReason::NotBroadcast);
        }
        self.send(message)
    }

    /// Ask `peer` for a pong; the reply refreshes its latency.
    pub fn ping(&self, peer: PeerId) -> SendOutcome {
        self.publish(
            MessageType::Ping,
            Recipient::Peer(peer),
            now_millis().to_le_bytes().to_vec(),
        )
    }

    /// Broadcast the local node's reachable address and keys.
    pub fn announce(&self, address: impl Into<String>, port: u16) -> SendOutcome {
        let keys = self.shared.identity.public_keys();
        let announcement = PeerAnnouncement {
            address: address.into(),
            port,
            signing_key: keys.signing,
            agreement_key: keys.agreement,
        };
        match bincode::serialize(&announcement) {
            Ok(payload) => self.publish(MessageType::PeerAnnounce, Recipient::Broadcast, payload),
            Err(err) => {
                warn!(error = %err, "failed to encode announcement");
                SendOutcome::Dropped(DropReason::Unencodable)
            }
        }
    }

    /// Process one envelope received from the wire.
    pub async fn handle_inbound(&self, message: NetworkMessage) {
        let stats = &self.shared.stats;
        bump(&stats.received);
        let local = self.local_id();

        let signing_key = match self.shared.directory.get(&message.sender_id) {
            Some(record) => record.signing_key,
            None => match self.introduced_key(&message) {
                Some(key) => key,
                None => {
                    bump(&stats.dropped_unknown_sender);
                    debug!(sender = %message.sender_id, "dropping envelope from unknown sender");
                    return;
                }
            },
        };
        if !verify_signature(&message.signing_bytes(), &message.signature, &signing_key) {
            bump(&stats.dropped_invalid_signature);
            debug!(sender = %message.sender_id, "dropping envelope with invalid signature");
            return;
        }
        if message.sender_id == local || message.has_visited(&local) {
            bump(&stats.dropped_loop);
            return;
        }
        if !self.shared.dedup.check_and_mark(message.dedup_key()) {
            bump(&stats.dropped_duplicate);
            return;
        }

        let now = now_millis();
        self.shared.directory.update_seen(&message.sender_id, now, None);
        if let Some(hop) = message.route_path.last() {
            self.shared.directory.update_seen(hop, now, None);
        }

        match message.recipient_id {
            Recipient::Peer(target) if target == local => self.dispatch(message).await,
            Recipient::Peer(_) => {
                self.send(message);
            }
            Recipient::Broadcast => {
                if self.shared.config.relay_broadcasts {
                    self.send(message.clone());
                }
                self.dispatch(message).await;
            }
        }
    }

    pub(crate) fn note_malformed(&self) {
        bump(&self.shared.stats.dropped_malformed);
    }

    /// Stop every peer worker. Queued frames are discarded.
    pub fn shutdown(&self) {
        self.shared.workers.lock().clear();
    }

    fn introduced_key(&self, message: &NetworkMessage) -> Option<[u8; 32]> {
        if message.message_type != MessageType::PeerAnnounce {
            return None;
        }
        let announcement: PeerAnnouncement = bincode::deserialize(&message.payload).ok()?;
        message
            .sender_id
            .matches_key(&announcement.signing_key)
            .then_some(announcement.signing_key)
    }

    async fn dispatch(&self, message: NetworkMessage) {
        match message.message_type {
            MessageType::Ping => {
                self.publish(
                    MessageType::Pong,
                    Recipient::Peer(message.sender_id),
                    message.payload.clone(),
                );
            }
            MessageType::Pong => {
                if let Ok(sent_at) = <[u8; 8]>::try_from(message.payload.as_slice()) {
                    let now = now_millis();
                    let latency = now.saturating_sub(u64::from_le_bytes(sent_at));
                    self.shared
                        .directory
                        .update_seen(&message.sender_id, now, Some(latency));
                }
            }
            MessageType::PeerAnnounce => {
                if let Ok(announcement) = bincode::deserialize::<PeerAnnouncement>(&message.payload) {
                    let known = self.shared.directory.contains(&message.sender_id);
                    match self.shared.directory.add(announcement.into_record(now_millis())) {
                        Ok(_) if !known => info!(peer = %message.sender_id, "discovered peer"),
                        Ok(_) => {}
                        Err(err) => debug!(error = %err, "ignoring announcement"),
                    }
                }
            }
            MessageType::Consensus | MessageType::StateSubmission => {}
        }

        let handler = self.shared.handlers.read().get(&message.message_type).cloned();
        bump(&self.shared.stats.delivered);
        if let Some(handler) = handler {
            let message_type = message.message_type;
            if let Err(err) = handler.handle_message(message).await {
                debug!(?message_type, error = %err, "handler rejected envelope");
            }
        }
    }

    fn fan_out(&self, message: NetworkMessage) -> SendOutcome {
        let targets: Vec<PeerId> = self
            .shared
            .directory
            .trusted_peers(self.shared.config.min_broadcast_reputation)
            .into_iter()
            .map(|record| record.peer_id)
            .filter(|peer| *peer != message.sender_id && !message.has_visited(peer))
            .collect();

        let mut queued = 0;
        for peer in targets {
            if self.enqueue(peer, message.clone()) {
                queued += 1;
            }
        }
        SendOutcome::Queued { peers: queued }
    }

    fn enqueue(&self, peer: PeerId, message: NetworkMessage) -> bool {
        let worker = self.worker_for(peer);
        match worker.try_send(WorkerCommand::Send(message)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                bump(&self.shared.stats.queue_full);
                debug!(%peer, "peer queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.workers.lock().remove(&peer);
                false
            }
        }
    }

    fn worker_for(&self, peer: PeerId) -> mpsc::Sender<WorkerCommand> {
        let mut workers = self.shared.workers.lock();
        if let Some(sender) = workers.get(&peer) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }
        let (sender, commands) = mpsc::channel(self.shared.config.queue_depth.max(1));
        let worker = PeerWorker {
            peer,
            directory: self.shared.directory.clone(),
            link: self.shared.link.clone(),
            retry: self.shared.config.retry_backoff(),
            config: self.shared.config.clone(),
            stats: self.shared.stats.clone(),
            sink: None,
            retry_at: None,
        };
        tokio::spawn(worker.run(commands));
        workers.insert(peer, sender.clone());
        sender
    }
}

/// Owns the outbound connection to a single peer.
struct PeerWorker {
    peer: PeerId,
    directory: Arc<PeerDirectory>,
    link: Arc<dyn PeerLink>,
    config: TransportConfig,
    stats: Arc<TransportStats>,
    sink: Option<Box<dyn FrameSink>>,
    retry: Backoff,
    retry_at: Option<Instant>,
}

impl PeerWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>) {
        loop {
            let command = match self.retry_at {
                Some(deadline) => {
                    tokio::select! {
                        command = commands.recv() => command,
                        _ = sleep_until(deadline) => {
                            self.retry_in_background().await;
                            continue;
                        }
                    }
                }
                None => commands.recv().await,
            };
            let Some(command) = command else { break };
            match command {
                WorkerCommand::Connect(reply) => {
                    let connected = self.ensure_connected().await;
                    let _ = reply.send(connected);
                }
                WorkerCommand::Send(message) => self.deliver(message).await,
            }
        }
        debug!(peer = %self.peer, "peer worker stopped");
    }

    async fn open_once(&mut self) -> Result<(), NetworkError> {
        let record = self
            .directory
            .get(&self.peer)
            .ok_or(NetworkError::UnknownPeer(self.peer))?;
        let sink = timeout(self.config.connect_timeout(), self.link.open(&record))
            .await
            .map_err(|_| NetworkError::Timeout(self.peer))??;
        self.sink = Some(sink);
        self.retry.reset();
        self.retry_at = None;
        self.directory
            .set_status(&self.peer, ConnectionStatus::Connected);
        self.directory.update_seen(&self.peer, now_millis(), None);
        Ok(())
    }

    async fn ensure_connected(&mut self) -> bool {
        if self.sink.is_some() {
            return true;
        }
        self.directory
            .set_status(&self.peer, ConnectionStatus::Connecting);
        let mut backoff = self.config.connect_backoff();
        loop {
            match self.open_once().await {
                Ok(()) => {
                    info!(peer = %self.peer, "connected to peer");
                    return true;
                }
                Err(NetworkError::UnknownPeer(_)) => return false,
                Err(err) => match backoff.next_delay() {
                    Some(delay) => {
                        debug!(peer = %self.peer, error = %err, ?delay, "connect attempt failed");
                        sleep(delay).await;
                    }
                    None => {
                        self.mark_unreachable(&err);
                        return false;
                    }
                },
            }
        }
    }

    async fn retry_in_background(&mut self) {
        self.retry_at = None;
        if let Err(err) = self.open_once().await {
            if matches!(err, NetworkError::UnknownPeer(_)) {
                return;
            }
            match self.retry.next_delay() {
                Some(delay) => {
                    debug!(peer = %self.peer, error = %err, ?delay, "reconnect failed");
                    self.retry_at = Some(Instant::now() + delay);
                }
                None => warn!(peer = %self.peer, "giving up on peer until next explicit connect"),
            }
        } else {
            info!(peer = %self.peer, "reconnected to peer");
        }
    }

    async fn deliver(&mut self, message: NetworkMessage) {
        if self.sink.is_none() {
            // A background retry is pending; the peer is known to be down.
            if self.retry_at.is_some() || !self.ensure_connected().await {
                bump(&self.stats.send_failures);
                return;
            }
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        match sink.send_frame(&message).await {
            Ok(()) => bump(&self.stats.sent),
            Err(err) => {
                bump(&self.stats.send_failures);
                self.sink = None;
                self.mark_unreachable(&err);
            }
        }
    }

    fn mark_unreachable(&mut self, err: &NetworkError) {
        bump(&self.stats.connect_failures);
        self.directory
            .set_status(&self.peer, ConnectionStatus::Disconnected);
        self.retry_at = self
            .retry
            .next_delay()
            .map(|delay| Instant::now() + delay);
        warn!(peer = %self.peer, error = %err, "peer unreachable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHub;
    use std::sync::atomic::AtomicUsize;

    struct TestNode {
        identity: Arc<NodeIdentity>,
        record: PeerRecord,
        transport: Transport,
    }

    fn fast_config() -> TransportConfig {
        TransportConfig {
            connect_timeout_ms: 200,
            max_connect_attempts: 3,
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            min_broadcast_reputation: 0.0,
            ..TransportConfig::default()
        }
    }

    fn identity(seed: u8) -> Arc<NodeIdentity> {
        Arc::new(NodeIdentity::from_secret_bytes(&[seed; 32], &[seed; 32]))
    }

    fn record_for(identity: &NodeIdentity, port: u16) -> PeerRecord {
        let keys = identity.public_keys();
        PeerRecord::new("memory", port, keys.signing, keys.agreement, now_millis())
    }

    fn node(seed: u8, link: Arc<dyn PeerLink>) -> TestNode {
        let identity = identity(seed);
        let record = record_for(&identity, seed as u16);
        let directory = Arc::new(PeerDirectory::new(record.clone()));
        let transport = Transport::new(identity.clone(), directory, link, fast_config());
        TestNode {
            identity,
            record,
            transport,
        }
    }

    fn collector(transport: &Transport, message_type: MessageType) -> mpsc::UnboundedReceiver<NetworkMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.register_handler(
            message_type,
            Arc::new(move |message: NetworkMessage| -> anyhow::Result<()> {
                tx.send(message)?;
                Ok(())
            }),
        );
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<NetworkMessage>) -> Option<NetworkMessage> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Link that records every frame written to any peer.
    #[derive(Default)]
    struct RecordingLink {
        frames: Arc<Mutex<Vec<(PeerId, NetworkMessage)>>>,
        opens: Arc<AtomicUsize>,
    }

    struct RecordingSink {
        peer: PeerId,
        frames: Arc<Mutex<Vec<(PeerId, NetworkMessage)>>>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&mut self, message: &NetworkMessage) -> Result<(), NetworkError> {
            self.frames.lock().push((self.peer, message.clone()));
            Ok(())
        }
    }

    #[async_trait]
    impl PeerLink for RecordingLink {
        async fn open(&self, peer: &PeerRecord) -> Result<Box<dyn FrameSink>, NetworkError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RecordingSink {
                peer: peer.peer_id,
                frames: self.frames.clone(),
            }))
        }
    }

    async fn wait_for_frames(frames: &Arc<Mutex<Vec<(PeerId, NetworkMessage)>>>, count: usize) {
        for _ in 0..200 {
            if frames.lock().len() >= count {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_zero_ttl_is_dropped() {
        let a = node(1, Arc::new(RecordingLink::default()));
        let message = NetworkMessage::new(
            a.identity.peer_id(),
            Recipient::Broadcast,
            MessageType::Ping,
            vec![],
            now_millis(),
        )
        .with_ttl(0);
        assert_eq!(
            a.transport.send(message),
            SendOutcome::Dropped(DropReason::TtlExhausted)
        );
        assert_eq!(a.transport.stats().dropped_ttl, 1);
    }

    #[tokio::test]
    async fn test_looping_route_is_dropped() {
        let a = node(1, Arc::new(RecordingLink::default()));
        let other = identity(2);
        let mut message = NetworkMessage::new(
            other.peer_id(),
            Recipient::Broadcast,
            MessageType::Ping,
            vec![],
            now_millis(),
        );
        message.route_path = vec![other.peer_id(), a.identity.peer_id()];
        assert_eq!(
            a.transport.send(message),
            SendOutcome::Dropped(DropReason::RoutingLoop)
        );
        assert_eq!(a.transport.stats().dropped_loop, 1);
    }

    #[tokio::test]
    async fn test_send_decrements_ttl_and_extends_route() {
        let link = RecordingLink::default();
        let frames = link.frames.clone();
        let a = node(1, Arc::new(link));
        let b = identity(2);
        assert!(a.transport.connect(&record_for(&b, 2)).await);

        let outcome = a
            .transport
            .publish(MessageType::StateSubmission, Recipient::Peer(b.peer_id()), vec![9]);
        assert_eq!(outcome, SendOutcome::Queued { peers: 1 });

        wait_for_frames(&frames, 1).await;
        let sent = frames.lock()[0].1.clone();
        assert_eq!(sent.ttl, fast_config().default_ttl - 1);
        assert_eq!(sent.route_path, vec![a.identity.peer_id()]);
        assert!(verify_signature(
            &sent.signing_bytes(),
            &sent.signature,
            &a.identity.public_keys().signing
        ));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let link = RecordingLink::default();
        let opens = link.opens.clone();
        let a = node(1, Arc::new(link));
        let peer = record_for(&identity(2), 2);

        assert!(a.transport.connect(&peer).await);
        assert!(a.transport.connect(&peer).await);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(a
            .transport
            .directory()
            .get(&peer.peer_id)
            .expect("peer added")
            .is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_marked_disconnected() {
        let hub = MemoryHub::new();
        let a = node(1, hub.link());
        hub.attach(a.transport.clone());
        let missing = record_for(&identity(2), 2);

        assert!(!a.transport.connect(&missing).await);
        let stored = a.transport.directory().get(&missing.peer_id).expect("present");
        assert_eq!(stored.connection_status, ConnectionStatus::Disconnected);
        assert_eq!(a.transport.stats().connect_failures, 1);
    }

    #[tokio::test]
    async fn test_directed_message_is_delivered_over_hub() {
        let hub = MemoryHub::new();
        let a = node(1, hub.link());
        let b = node(2, hub.link());
        hub.attach(a.transport.clone());
        hub.attach(b.transport.clone());
        b.transport.directory().add(a.record.clone()).expect("b knows a");
        let mut inbox = collector(&b.transport, MessageType::StateSubmission);

        assert!(a.transport.connect(&b.record).await);
        a.transport.publish(
            MessageType::StateSubmission,
            Recipient::Peer(b.identity.peer_id()),
            b"state".to_vec(),
        );

        let received = next(&mut inbox).await.expect("delivered");
        assert_eq!(received.payload, b"state".to_vec());
        assert_eq!(received.sender_id, a.identity.peer_id());
    }

    #[tokio::test]
    async fn test_forged_and_duplicate_envelopes_are_dropped() {
        let a = node(1, Arc::new(RecordingLink::default()));
        let b = node(2, Arc::new(RecordingLink::default()));
        b.transport.directory().add(a.record.clone()).expect("b knows a");
        let mut inbox = collector(&b.transport, MessageType::Consensus);

        let mut genuine = NetworkMessage::new(
            a.identity.peer_id(),
            Recipient::Peer(b.identity.peer_id()),
            MessageType::Consensus,
            vec![1, 2, 3],
            now_millis(),
        );
        a.identity.sign_envelope(&mut genuine);

        let mut forged = genuine.clone();
        forged.message_id = uuid::Uuid::new_v4();
        identity(3).sign_envelope(&mut forged);

        b.transport.handle_inbound(forged).await;
        b.transport.handle_inbound(genuine.clone()).await;
        b.transport.handle_inbound(genuine).await;

        assert!(next(&mut inbox).await.is_some());
        assert!(inbox.try_recv().is_err());
        let stats = b.transport.stats();
        assert_eq!(stats.dropped_invalid_signature, 1);
        assert_eq!(stats.dropped_duplicate, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn test_unknown_sender_is_dropped() {
        let b = node(2, Arc::new(RecordingLink::default()));
        let stranger = identity(9);
        let mut message = NetworkMessage::new(
            stranger.peer_id(),
            Recipient::Broadcast,
            MessageType::Consensus,
            vec![],
            now_millis(),
        );
        stranger.sign_envelope(&mut message);
        b.transport.handle_inbound(message).await;
        assert_eq!(b.transport.stats().dropped_unknown_sender, 1);
    }

    #[tokio::test]
    async fn test_announcement_introduces_unknown_peer() {
        let hub = MemoryHub::new();
        let a = node(1, hub.link());
        let b = node(2, hub.link());
        hub.attach(b.transport.clone());
        a.transport.directory().add(b.record.clone()).expect("a knows b");
        assert!(a.transport.connect(&b.record).await);

        a.transport.announce("10.1.1.1", 7100);
        for _ in 0..200 {
            if b.transport.directory().contains(&a.identity.peer_id()) {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        let learned = b
            .transport
            .directory()
            .get(&a.identity.peer_id())
            .expect("announced peer added");
        assert_eq!(learned.address, "10.1.1.1");
        assert_eq!(learned.port, 7100);
    }

    #[tokio::test]
    async fn test_broadcast_is_relayed_once() {
        let hub = MemoryHub::new();
        let a = node(1, hub.link());
        let b = node(2, hub.link());
        let c = node(3, hub.link());
        for n in [&a, &b, &c] {
            hub.attach(n.transport.clone());
        }
        // a - b - c line topology; c knows a's key but has no link to it.
        b.transport.directory().add(a.record.clone()).expect("add");
        c.transport.directory().add(a.record.clone()).expect("add");
        c.transport.directory().add(b.record.clone()).expect("add");
        assert!(a.transport.connect(&b.record).await);
        assert!(b.transport.connect(&c.record).await);

        let mut at_b = collector(&b.transport, MessageType::Consensus);
        let mut at_c = collector(&c.transport, MessageType::Consensus);

        let outcome = a
            .transport
            .publish(MessageType::Consensus, Recipient::Broadcast, b"vote".to_vec());
        assert_eq!(outcome, SendOutcome::Queued { peers: 1 });

        assert!(next(&mut at_b).await.is_some());
        let relayed = next(&mut at_c).await.expect("relayed by b");
        assert_eq!(relayed.sender_id, a.identity.peer_id());
        assert_eq!(
            relayed.route_path,
            vec![a.identity.peer_id(), b.identity.peer_id()]
        );
    }

    #[tokio::test]
    async fn test_ping_records_latency() {
        let hub = MemoryHub::new();
        let a = node(1, hub.link());
        let b = node(2, hub.link());
        hub.attach(a.transport.clone());
        hub.attach(b.transport.clone());
        b.transport.directory().add(a.record.clone()).expect("add");
        assert!(a.transport.connect(&b.record).await);
        assert!(b.transport.connect(&a.record).await);

        a.transport.ping(b.identity.peer_id());
        for _ in 0..200 {
            let latency = a
                .transport
                .directory()
                .get(&b.identity.peer_id())
                .and_then(|r| r.latency_ms);
            if latency.is_some() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("pong never arrived");
    }
}
