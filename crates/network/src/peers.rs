use crate::errors::NetworkError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use trustmesh_types::PeerId;

/// Connectivity of a peer as seen by the local transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything the node knows about one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub address: String,
    pub port: u16,
    /// Ed25519 verifying key; `peer_id` is derived from it.
    pub signing_key: [u8; 32],
    /// X25519 key used for overlay client authorization.
    pub agreement_key: [u8; 32],
    /// Milliseconds since the Unix epoch.
    pub last_seen: u64,
    pub connection_status: ConnectionStatus,
    pub reputation_score: f64,
    pub latency_ms: Option<u64>,
}

impl PeerRecord {
    /// A freshly introduced peer: disconnected, default reputation.
    pub fn new(
        address: impl Into<String>,
        port: u16,
        signing_key: [u8; 32],
        agreement_key: [u8; 32],
        last_seen: u64,
    ) -> Self {
        Self {
            peer_id: PeerId::from_public_key(&signing_key),
            address: address.into(),
            port,
            signing_key,
            agreement_key,
            last_seen,
            connection_status: ConnectionStatus::Disconnected,
            reputation_score: 1.0,
            latency_ms: None,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status == ConnectionStatus::Connected
    }
}

/// Stable arena index of a peer record. Slots are reused after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerSlot(usize);

impl PeerSlot {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct Arena {
    slots: Vec<Option<PeerRecord>>,
    free: Vec<usize>,
    index: HashMap<PeerId, usize>,
    local: PeerId,
}

impl Arena {
    fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.index
            .get(id)
            .and_then(|slot| self.slots[*slot].as_ref())
    }

    fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerRecord> {
        let slot = *self.index.get(id)?;
        self.slots[slot].as_mut()
    }

    fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.slots.iter().flatten()
    }

    fn insert(&mut self, record: PeerRecord) -> usize {
        let id = record.peer_id;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(record);
                slot
            }
            None => {
                self.slots.push(Some(record));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        slot
    }
}

/// Table of known peers, including the local node itself.
///
/// Every mutation goes through this type and is serialized by its lock;
/// readers get cloned snapshots so a network callback can never observe a
/// half-updated record.
#[derive(Debug)]
pub struct PeerDirectory {
    arena: RwLock<Arena>,
}

impl PeerDirectory {
    /// Create a directory seeded with the local node, which is always
    /// connected and fully trusted.
    pub fn new(mut local: PeerRecord) -> Self {
        local.connection_status = ConnectionStatus::Connected;
        local.reputation_score = 1.0;
        let mut arena = Arena {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            local: local.peer_id,
        };
        arena.insert(local);
        Self {
            arena: RwLock::new(arena),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.arena.read().local
    }

    /// Insert a peer or refresh its address and keys.
    ///
    /// Status, reputation and liveness of an existing record are preserved.
    pub fn add(&self, mut record: PeerRecord) -> Result<PeerSlot, NetworkError> {
        if !record.peer_id.matches_key(&record.signing_key) {
            return Err(NetworkError::IdentityMismatch(record.peer_id));
        }
        record.reputation_score = record.reputation_score.clamp(0.0, 1.0);

        let mut arena = self.arena.write();
        if record.peer_id == arena.local {
            return Err(NetworkError::LocalPeer);
        }
        if let Some(slot) = arena.index.get(&record.peer_id).copied() {
            if let Some(existing) = arena.slots[slot].as_mut() {
                existing.address = record.address;
                existing.port = record.port;
                existing.agreement_key = record.agreement_key;
                existing.last_seen = existing.last_seen.max(record.last_seen);
            }
            return Ok(PeerSlot(slot));
        }
        Ok(PeerSlot(arena.insert(record)))
    }

    /// Forget a peer. The local node cannot be removed.
    pub fn remove(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        let mut arena = self.arena.write();
        if *peer_id == arena.local {
            return None;
        }
        let slot = arena.index.remove(peer_id)?;
        let record = arena.slots[slot].take();
        arena.free.push(slot);
        record
    }

    /// Record a successful exchange with `peer_id`.
    pub fn update_seen(&self, peer_id: &PeerId, timestamp: u64, latency_ms: Option<u64>) -> bool {
        let mut arena = self.arena.write();
        match arena.get_mut(peer_id) {
            Some(record) => {
                record.last_seen = record.last_seen.max(timestamp);
                if latency_ms.is_some() {
                    record.latency_ms = latency_ms;
                }
                true
            }
            None => false,
        }
    }

    pub fn set_status(&self, peer_id: &PeerId, status: ConnectionStatus) -> bool {
        let mut arena = self.arena.write();
        if *peer_id == arena.local {
            return false;
        }
        match arena.get_mut(peer_id) {
            Some(record) => {
                record.connection_status = status;
                true
            }
            None => false,
        }
    }

    /// Overwrite a peer's reputation, clamped to `[0, 1]`.
    pub fn set_reputation(&self, peer_id: &PeerId, score: f64) -> bool {
        let mut arena = self.arena.write();
        match arena.get_mut(peer_id) {
            Some(record) => {
                record.reputation_score = score.clamp(0.0, 1.0);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.arena.read().get(peer_id).cloned()
    }

    pub fn slot_of(&self, peer_id: &PeerId) -> Option<PeerSlot> {
        self.arena.read().index.get(peer_id).copied().map(PeerSlot)
    }

    pub fn get_slot(&self, slot: PeerSlot) -> Option<PeerRecord> {
        self.arena.read().slots.get(slot.0).cloned().flatten()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.arena.read().index.contains_key(peer_id)
    }

    /// Connected remote peers with `reputation_score >= min_reputation`,
    /// ordered by peer id.
    pub fn trusted_peers(&self, min_reputation: f64) -> Vec<PeerRecord> {
        let arena = self.arena.read();
        let mut peers: Vec<PeerRecord> = arena
            .records()
            .filter(|record| record.peer_id != arena.local)
            .filter(|record| record.is_connected() && record.reputation_score >= min_reputation)
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Number of reachable participants, the local node included.
    pub fn live_count(&self) -> usize {
        self.arena
            .read()
            .records()
            .filter(|record| record.is_connected())
            .count()
    }

    /// Sorted ids of every reachable participant, the local node included.
    pub fn live_members(&self) -> Vec<PeerId> {
        let mut members: Vec<PeerId> = self
            .arena
            .read()
            .records()
            .filter(|record| record.is_connected())
            .map(|record| record.peer_id)
            .collect();
        members.sort();
        members
    }

    /// Every remote peer, ordered by peer id.
    pub fn remote_peers(&self) -> Vec<PeerRecord> {
        let arena = self.arena.read();
        let mut peers: Vec<PeerRecord> = arena
            .records()
            .filter(|record| record.peer_id != arena.local)
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn len(&self) -> usize {
        self.arena.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove remote peers not seen within `ttl_ms` of `now`.
    pub fn evict_silent(&self, now: u64, ttl_ms: u64) -> Vec<PeerId> {
        let stale: Vec<PeerId> = {
            let arena = self.arena.read();
            arena
                .records()
                .filter(|record| record.peer_id != arena.local)
                .filter(|record| now.saturating_sub(record.last_seen) > ttl_ms)
                .map(|record| record.peer_id)
                .collect()
        };
        for peer_id in &stale {
            self.remove(peer_id);
        }
        stale
    }
}
