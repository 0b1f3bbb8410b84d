// Peer registry.
//
// One entry per peer we have heard an announcement from, plus a synthetic
// entry for ourselves so lookups never special-case the local node.
// Observers get callbacks on update, disconnect, and removal; callbacks
// run outside the registry lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::protocol::PeerId;

/// Everything known about one peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub nickname: String,
    /// X25519 static key from the peer's announcement.
    pub noise_public_key: Vec<u8>,
    /// Ed25519 key the peer signs packets with.
    pub signing_public_key: Vec<u8>,
    /// Signature on the announcing packet checked out.
    pub verified: bool,
    pub connected: bool,
    /// Reached over a direct link rather than a relay.
    pub direct_connection: bool,
    pub last_seen: Instant,
}

impl PeerInfo {
    pub fn age(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Observer for registry changes.
pub trait PeerEvents: Send + Sync {
    fn peer_updated(&self, info: &PeerInfo);
    fn peer_disconnected(&self, peer_id: &PeerId);
    fn peer_removed(&self, peer_id: &PeerId);
}

/// Thread-safe peer table.
pub struct PeerRegistry {
    local_peer_id: PeerId,
    peers: Mutex<HashMap<PeerId, PeerInfo>>,
    observers: Mutex<Vec<Arc<dyn PeerEvents>>>,
}

impl PeerRegistry {
    /// Create a registry seeded with the local node's own entry.
    pub fn new(local_peer_id: PeerId, nickname: String, noise_key: Vec<u8>, signing_key: Vec<u8>) -> Self {
        let mut peers = HashMap::new();
        peers.insert(
            local_peer_id,
            PeerInfo {
                peer_id: local_peer_id,
                nickname,
                noise_public_key: noise_key,
                signing_public_key: signing_key,
                verified: true,
                connected: true,
                direct_connection: false,
                last_seen: Instant::now(),
            },
        );
        PeerRegistry {
            local_peer_id,
            peers: Mutex::new(peers),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn add_observer(&self, observer: Arc<dyn PeerEvents>) {
        self.observers.lock().push(observer);
    }

    /// Insert or refresh a peer from its announcement.
    ///
    /// Returns true when this is a newly discovered peer.
    pub fn add_or_update(
        &self,
        peer_id: PeerId,
        nickname: String,
        noise_public_key: Vec<u8>,
        signing_public_key: Vec<u8>,
        verified: bool,
        direct_connection: bool,
    ) -> bool {
        if peer_id == self.local_peer_id {
            return false;
        }
        let (is_new, snapshot) = {
            let mut peers = self.peers.lock();
            let is_new = !peers.contains_key(&peer_id);
            let entry = peers.entry(peer_id).or_insert_with(|| PeerInfo {
                peer_id,
                nickname: nickname.clone(),
                noise_public_key: noise_public_key.clone(),
                signing_public_key: signing_public_key.clone(),
                verified,
                connected: true,
                direct_connection,
                last_seen: Instant::now(),
            });
            entry.nickname = nickname;
            entry.noise_public_key = noise_public_key;
            entry.signing_public_key = signing_public_key;
            entry.verified = verified;
            entry.connected = true;
            entry.direct_connection = direct_connection || entry.direct_connection;
            entry.last_seen = Instant::now();
            (is_new, entry.clone())
        };
        if is_new {
            info!(peer = %peer_id, nickname = %snapshot.nickname, "peer discovered");
        }
        for observer in self.observers.lock().clone() {
            observer.peer_updated(&snapshot);
        }
        is_new
    }

    /// Refresh a peer's liveness without new identity data.
    pub fn touch(&self, peer_id: &PeerId) {
        if let Some(entry) = self.peers.lock().get_mut(peer_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Mark a peer disconnected but keep its identity around.
    pub fn mark_disconnected(&self, peer_id: &PeerId) {
        let changed = {
            let mut peers = self.peers.lock();
            match peers.get_mut(peer_id) {
                Some(entry) if entry.connected => {
                    entry.connected = false;
                    entry.direct_connection = false;
                    true
                }
                _ => false,
            }
        };
        if changed {
            debug!(peer = %peer_id, "peer disconnected");
            for observer in self.observers.lock().clone() {
                observer.peer_disconnected(peer_id);
            }
        }
    }

    /// Drop a peer entirely (it announced departure).
    pub fn remove(&self, peer_id: &PeerId) {
        if *peer_id == self.local_peer_id {
            return;
        }
        let removed = self.peers.lock().remove(peer_id).is_some();
        if removed {
            info!(peer = %peer_id, "peer removed");
            for observer in self.observers.lock().clone() {
                observer.peer_removed(peer_id);
            }
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.lock().get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.lock().contains_key(peer_id)
    }

    /// All known peers, the local entry included.
    pub fn all(&self) -> Vec<PeerInfo> {
        self.peers.lock().values().cloned().collect()
    }

    /// Remote peers currently marked connected.
    pub fn connected(&self) -> Vec<PeerInfo> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.connected && p.peer_id != self.local_peer_id)
            .cloned()
            .collect()
    }
}
