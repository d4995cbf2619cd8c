//! In-process links for simulations and tests.

use crate::errors::NetworkError;
use crate::link::{FrameSink, PeerLink};
use crate::peers::PeerRecord;
use crate::transport::Transport;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use trustmesh_types::{NetworkMessage, PeerId};

/// Routes frames between transports living in the same process.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    routes: Arc<RwLock<HashMap<PeerId, mpsc::UnboundedSender<NetworkMessage>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `transport` reachable through the hub. Inbound frames are
    /// delivered on a dedicated task.
    pub fn attach(&self, transport: Transport) {
        let (tx, mut rx) = mpsc::unbounded_channel::<NetworkMessage>();
        self.routes.write().insert(transport.local_id(), tx);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                transport.handle_inbound(message).await;
            }
        });
    }

    /// Take a peer offline. Open sinks to it start failing.
    pub fn detach(&self, peer: &PeerId) {
        self.routes.write().remove(peer);
    }

    pub fn link(&self) -> Arc<dyn PeerLink> {
        Arc::new(MemoryLink { hub: self.clone() })
    }

    fn route(&self, peer: &PeerId) -> Option<mpsc::UnboundedSender<NetworkMessage>> {
        self.routes.read().get(peer).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryLink {
    hub: MemoryHub,
}

struct MemorySink {
    hub: MemoryHub,
    peer: PeerId,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, message: &NetworkMessage) -> Result<(), NetworkError> {
        let route = self.hub.route(&self.peer).ok_or(NetworkError::Unreachable {
            peer: self.peer,
            reason: "detached from hub".into(),
        })?;
        route
            .send(message.clone())
            .map_err(|_| NetworkError::Unreachable {
                peer: self.peer,
                reason: "receiver closed".into(),
            })
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn open(&self, peer: &PeerRecord) -> Result<Box<dyn FrameSink>, NetworkError> {
        if self.hub.route(&peer.peer_id).is_none() {
            return Err(NetworkError::Unreachable {
                peer: peer.peer_id,
                reason: "not attached to hub".into(),
            });
        }
        Ok(Box::new(MemorySink {
            hub: self.hub.clone(),
            peer: peer.peer_id,
        }))
    }
}
