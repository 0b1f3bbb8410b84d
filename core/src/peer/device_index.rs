// Device address <-> peer ID index.
//
// Transports identify links by device address; the protocol identifies
// nodes by peer ID. A device carries exactly one peer, but one peer may be
// reachable over several devices at once (two radios, two hops that became
// direct), so the peer side is a set. Both mappings live under one lock so
// they can never disagree. Reads that would block on a contended lock fall
// back to the last published snapshot, which may be momentarily stale but
// is always internally consistent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::protocol::PeerId;

#[derive(Default, Clone)]
struct IndexState {
    device_to_peer: HashMap<String, PeerId>,
    peer_to_devices: HashMap<PeerId, HashSet<String>>,
}

impl IndexState {
    fn unlink(&mut self, peer: &PeerId, device: &str) {
        if let Some(devices) = self.peer_to_devices.get_mut(peer) {
            devices.remove(device);
            if devices.is_empty() {
                self.peer_to_devices.remove(peer);
            }
        }
    }
}

/// A consistent read-only view of the index.
#[derive(Default, Clone)]
pub struct IndexSnapshot {
    device_to_peer: HashMap<String, PeerId>,
    peer_to_devices: HashMap<PeerId, HashSet<String>>,
}

impl IndexSnapshot {
    pub fn peer_for_device(&self, device: &str) -> Option<PeerId> {
        self.device_to_peer.get(device).copied()
    }

    pub fn device_for_peer(&self, peer: &PeerId) -> Option<&str> {
        self.peer_to_devices
            .get(peer)
            .and_then(|devices| devices.iter().next())
            .map(String::as_str)
    }
}

/// Bidirectional device/peer mapping.
pub struct DeviceIndex {
    state: Mutex<IndexState>,
    snapshot: Mutex<Arc<IndexSnapshot>>,
}

impl DeviceIndex {
    pub fn new() -> Self {
        DeviceIndex {
            state: Mutex::new(IndexState::default()),
            snapshot: Mutex::new(Arc::new(IndexSnapshot::default())),
        }
    }

    /// Record that `peer` was heard over `device`.
    ///
    /// A device belongs to one peer, so a device that changes hands is
    /// unlinked from its old peer; the peer side accumulates devices.
    /// Returns true when the device was not previously mapped to this peer.
    pub fn record(&self, device: &str, peer: PeerId) -> bool {
        let mut state = self.state.lock();
        let previous = state.device_to_peer.insert(device.to_string(), peer);
        if let Some(old_peer) = previous {
            if old_peer != peer {
                state.unlink(&old_peer, device);
            }
        }
        state
            .peer_to_devices
            .entry(peer)
            .or_default()
            .insert(device.to_string());
        let newly = previous != Some(peer);
        if newly {
            trace!(device, peer = %peer, "device mapped");
        }
        self.publish(&state);
        newly
    }

    /// Forget a device (link dropped). Returns the peer it was mapped to
    /// and whether that was the peer's last known link.
    pub fn remove_device(&self, device: &str) -> Option<(PeerId, bool)> {
        let mut state = self.state.lock();
        let peer = state.device_to_peer.remove(device)?;
        state.unlink(&peer, device);
        let last_link = !state.peer_to_devices.contains_key(&peer);
        self.publish(&state);
        Some((peer, last_link))
    }

    pub fn peer_for_device(&self, device: &str) -> Option<PeerId> {
        match self.state.try_lock() {
            Some(state) => state.device_to_peer.get(device).copied(),
            None => self.snapshot.lock().peer_for_device(device),
        }
    }

    /// Any one live device for `peer`, for unicast routing.
    pub fn device_for_peer(&self, peer: &PeerId) -> Option<String> {
        match self.state.try_lock() {
            Some(state) => state
                .peer_to_devices
                .get(peer)
                .and_then(|devices| devices.iter().next())
                .cloned(),
            None => self
                .snapshot
                .lock()
                .device_for_peer(peer)
                .map(str::to_string),
        }
    }

    /// All devices `peer` is currently reachable over.
    pub fn devices_for_peer(&self, peer: &PeerId) -> Vec<String> {
        let from = |map: &HashMap<PeerId, HashSet<String>>| {
            map.get(peer)
                .map(|devices| devices.iter().cloned().collect())
                .unwrap_or_default()
        };
        match self.state.try_lock() {
            Some(state) => from(&state.peer_to_devices),
            None => from(&self.snapshot.lock().peer_to_devices),
        }
    }

    /// A consistent view of the whole index.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        if let Some(state) = self.state.try_lock() {
            self.publish(&state);
        }
        self.snapshot.lock().clone()
    }

    fn publish(&self, state: &IndexState) {
        *self.snapshot.lock() = Arc::new(IndexSnapshot {
            device_to_peer: state.device_to_peer.clone(),
            peer_to_devices: state.peer_to_devices.clone(),
        });
    }
}

impl Default for DeviceIndex {
    fn default() -> Self {
        Self::new()
    }
}
