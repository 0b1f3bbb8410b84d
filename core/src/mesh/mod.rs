//! Mesh orchestration.
//!
//! `MeshService` ties the layers together: inbound frames come off the
//! transport, through chunk reassembly and the codec, into the packet
//! processor; its outcome turns into signed outbound frames. A background
//! task announces our identity every interval, sweeps stale fragment
//! buffers, and refreshes sessions that hit their rekey limits.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fragment::FragmentManager;
use crate::handler::{PacketProcessor, ProcessOutcome};
use crate::identity::MeshIdentity;
use crate::noise::xx::XxBackend;
use crate::peer::{DeviceIndex, PeerInfo, PeerRegistry};
use crate::protocol::{
    codec, IdentityAnnouncement, MeshPacket, NoisePayload, NoisePayloadType, PacketType, PeerId,
    PrivateMessage, DEFAULT_TTL,
};
use crate::security::SecurityManager;
use crate::transport::{chunk, ChunkReassembler, Transport, DEFAULT_MTU};
use crate::{MeshDelegate, MeshError};

/// Tunables for one mesh node.
#[derive(Clone)]
pub struct MeshConfig {
    pub nickname: String,
    /// Period of the announce/maintenance task.
    pub announce_interval: Duration,
    /// Hop budget stamped on packets we originate.
    pub ttl: u8,
    /// Largest single transport write.
    pub mtu: usize,
    /// Encoded frames above this go out as protocol fragments.
    pub fragment_threshold: usize,
    /// Data bytes per protocol fragment.
    pub fragment_chunk: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            nickname: "anonymous".into(),
            announce_interval: Duration::from_secs(30),
            ttl: DEFAULT_TTL,
            mtu: DEFAULT_MTU,
            fragment_threshold: 2048,
            fragment_chunk: 1024,
        }
    }
}

/// One node of the mesh.
pub struct MeshService {
    identity: MeshIdentity,
    config: MeshConfig,
    transport: Arc<dyn Transport>,
    security: Arc<SecurityManager>,
    registry: Arc<PeerRegistry>,
    device_index: Arc<DeviceIndex>,
    fragments: Arc<FragmentManager>,
    processor: PacketProcessor,
    reassembler: ChunkReassembler,
    /// Devices that connected but are not ready for writes yet; they get
    /// our announce as soon as the link reports ready.
    pending_announce: Mutex<HashSet<String>>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshService {
    pub fn new(
        identity: MeshIdentity,
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        delegate: Arc<dyn MeshDelegate>,
    ) -> Arc<Self> {
        let security = Arc::new(SecurityManager::new(identity.clone(), Box::new(XxBackend)));
        let registry = Arc::new(PeerRegistry::new(
            identity.peer_id(),
            config.nickname.clone(),
            identity.noise.public_key_bytes().to_vec(),
            identity.signing.public_key_bytes().to_vec(),
        ));
        let device_index = Arc::new(DeviceIndex::new());
        let fragments = Arc::new(FragmentManager::new());
        let processor = PacketProcessor::new(
            security.clone(),
            registry.clone(),
            device_index.clone(),
            fragments.clone(),
            delegate,
        );
        Arc::new(MeshService {
            identity,
            config,
            transport,
            security,
            registry,
            device_index,
            fragments,
            processor,
            reassembler: ChunkReassembler::new(),
            pending_announce: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn security(&self) -> &SecurityManager {
        &self.security
    }

    /// Start the maintenance task and announce immediately. Idempotent.
    pub async fn start_services(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(peer = %self.peer_id(), "mesh services starting");
        if let Err(e) = self.send_broadcast_announce().await {
            warn!(error = %e, "initial announce failed");
        }
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.announce_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; the announce above
            // already covered it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.maintenance_tick().await;
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Announce our departure and stop background work. Idempotent.
    pub async fn stop_services(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(peer = %self.peer_id(), "mesh services stopping");
        if let Err(e) = self.send_leave().await {
            debug!(error = %e, "leave announcement failed");
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.fragments.clear();
        self.security.clear_all();
        self.pending_announce.lock().clear();
    }

    async fn maintenance_tick(&self) {
        if let Err(e) = self.send_broadcast_announce().await {
            warn!(error = %e, "periodic announce failed");
        }
        self.fragments.expire_stale();
        for peer in self.security.peers_needing_rekey() {
            debug!(peer = %peer, "session hit rekey limit, re-handshaking");
            self.security.remove_session(&peer);
            if let Err(e) = self.initiate_noise_handshake(peer).await {
                warn!(peer = %peer, error = %e, "rekey handshake failed");
            }
        }
    }

    // ---- connection events ------------------------------------------------

    /// A link appeared but may not accept writes yet.
    pub fn on_device_connected(&self, device: &str) {
        self.pending_announce.lock().insert(device.to_string());
    }

    /// The link is writable; introduce ourselves if we were waiting to.
    pub async fn on_connection_ready(&self, device: &str) {
        let was_pending = self.pending_announce.lock().remove(device);
        if was_pending {
            let packet = self.build_announce();
            if let Err(e) = self.send_packet(packet, Some(device)).await {
                warn!(device, error = %e, "targeted announce failed");
            }
        }
    }

    pub fn on_device_disconnected(&self, device: &str) {
        self.pending_announce.lock().remove(device);
        self.reassembler.reset_device(device);
        if let Some((peer, last_link)) = self.device_index.remove_device(device) {
            // The peer stays connected while any other link to it is alive.
            if last_link {
                self.registry.mark_disconnected(&peer);
            }
        }
    }

    /// Feed one raw transport frame received from `device`.
    pub async fn handle_incoming(&self, device: &str, data: &[u8]) {
        let Some(frame) = self.reassembler.feed(device, data) else {
            return;
        };
        let Some(packet) = codec::decode(&frame) else {
            warn!(device, len = frame.len(), "undecodable frame dropped");
            return;
        };
        let outcome = self.processor.process(device, packet);
        self.execute(device, outcome).await;
    }

    async fn execute(&self, device: &str, outcome: ProcessOutcome) {
        for reply in outcome.replies {
            if let Err(e) = self.send_packet(reply, Some(device)).await {
                warn!(device, error = %e, "reply failed");
            }
        }
        if let Some(packet) = outcome.relay {
            if let Err(e) = self.relay_packet(packet).await {
                debug!(error = %e, "relay failed");
            }
        }
        if outcome.announce_back {
            if let Err(e) = self.send_broadcast_announce().await {
                warn!(error = %e, "announce-back failed");
            }
        }
    }

    // ---- sending ----------------------------------------------------------

    fn build_announce(&self) -> MeshPacket {
        let payload = IdentityAnnouncement::new(
            self.config.nickname.clone(),
            self.identity.noise.public_key_bytes().to_vec(),
            self.identity.signing.public_key_bytes().to_vec(),
        )
        .encode()
        .unwrap_or_default();
        MeshPacket::broadcast(PacketType::Announce, self.peer_id(), payload)
    }

    pub async fn send_broadcast_announce(&self) -> Result<(), MeshError> {
        self.send_packet(self.build_announce(), None).await
    }

    /// Broadcast a plaintext message to the whole mesh.
    pub async fn send_public_message(&self, content: &str) -> Result<(), MeshError> {
        let packet = MeshPacket::broadcast(
            PacketType::Message,
            self.peer_id(),
            content.as_bytes().to_vec(),
        );
        self.send_packet(packet, None).await
    }

    /// Send an end-to-end encrypted message to `peer`.
    ///
    /// Requires an established session; callers drive the handshake
    /// explicitly via [`initiate_noise_handshake`](Self::initiate_noise_handshake).
    pub async fn send_private_message(
        &self,
        peer: PeerId,
        message_id: &str,
        content: &str,
    ) -> Result<(), MeshError> {
        if !self.security.has_established_session(&peer) {
            return Err(MeshError::NoSession(peer));
        }
        let message = PrivateMessage::new(message_id.to_string(), content.to_string());
        let payload = NoisePayload::new(
            NoisePayloadType::PrivateMessage,
            message.encode().ok_or(MeshError::PayloadTooLarge)?,
        );
        let ciphertext = self.security.encrypt_for_peer(&peer, &payload.encode())?;
        let packet =
            MeshPacket::unicast(PacketType::NoiseEncrypted, self.peer_id(), peer, ciphertext);
        self.send_to_peer(peer, packet).await
    }

    /// Open a Noise session toward `peer`; no-op if one already exists.
    pub async fn initiate_noise_handshake(&self, peer: PeerId) -> Result<(), MeshError> {
        let Some(message) = self.security.initiate_handshake(peer)? else {
            return Ok(());
        };
        let packet =
            MeshPacket::unicast(PacketType::NoiseHandshake, self.peer_id(), peer, message);
        self.send_to_peer(peer, packet).await
    }

    /// Broadcast a file to everyone in range of the flood.
    pub async fn send_file_broadcast(&self, data: Vec<u8>) -> Result<(), MeshError> {
        let packet = MeshPacket::broadcast(PacketType::FileTransfer, self.peer_id(), data);
        self.send_packet(packet, None).await
    }

    /// Send a file inside the Noise session with `peer`.
    pub async fn send_file_private(&self, peer: PeerId, data: Vec<u8>) -> Result<(), MeshError> {
        if !self.security.has_established_session(&peer) {
            return Err(MeshError::NoSession(peer));
        }
        let payload = NoisePayload::new(NoisePayloadType::FileTransfer, data);
        let ciphertext = self.security.encrypt_for_peer(&peer, &payload.encode())?;
        let packet =
            MeshPacket::unicast(PacketType::NoiseEncrypted, self.peer_id(), peer, ciphertext);
        self.send_to_peer(peer, packet).await
    }

    /// Tell the mesh we are leaving.
    pub async fn send_leave(&self) -> Result<(), MeshError> {
        let packet = MeshPacket::broadcast(PacketType::Leave, self.peer_id(), Vec::new());
        self.send_packet(packet, None).await
    }

    /// Ask peers to re-announce (used after reconnecting).
    pub async fn send_sync_request(&self) -> Result<(), MeshError> {
        let packet = MeshPacket::broadcast(PacketType::RequestSync, self.peer_id(), Vec::new());
        self.send_packet(packet, None).await
    }

    /// Forward a packet for someone else, spending one hop of its TTL.
    async fn relay_packet(&self, mut packet: MeshPacket) -> Result<(), MeshError> {
        if packet.ttl <= 1 {
            return Ok(()); // hop budget spent
        }
        packet.ttl -= 1;
        // Everything but the TTL is forwarded untouched; in particular the
        // original signature stays valid.
        let frame = codec::encode(&packet).ok_or(MeshError::Encoding)?;
        self.send_frame(&frame, None).await
    }

    /// Route a unicast packet: a known direct link wins, the flood
    /// otherwise.
    async fn send_to_peer(&self, peer: PeerId, packet: MeshPacket) -> Result<(), MeshError> {
        let device = self.device_index.device_for_peer(&peer);
        self.send_packet(packet, device.as_deref()).await
    }

    /// Stamp, sign, encode, fragment if oversized, and send.
    async fn send_packet(
        &self,
        mut packet: MeshPacket,
        target: Option<&str>,
    ) -> Result<(), MeshError> {
        packet.ttl = self.config.ttl;
        packet.version = MeshPacket::required_version(packet.payload.len());
        if !self.security.sign_packet(&mut packet) {
            return Err(MeshError::Encoding);
        }
        let frame = codec::encode(&packet).ok_or(MeshError::Encoding)?;

        if frame.len() > self.config.fragment_threshold
            && packet.packet_type != PacketType::Fragment
        {
            debug!(
                len = frame.len(),
                packet_type = ?packet.packet_type,
                "fragmenting oversized frame"
            );
            for piece in FragmentManager::split(&frame, self.config.fragment_chunk) {
                let mut fragment =
                    MeshPacket::broadcast(PacketType::Fragment, self.peer_id(), piece);
                fragment.recipient = packet.recipient;
                fragment.ttl = self.config.ttl;
                if !self.security.sign_packet(&mut fragment) {
                    return Err(MeshError::Encoding);
                }
                let fragment_frame = codec::encode(&fragment).ok_or(MeshError::Encoding)?;
                self.send_frame(&fragment_frame, target).await?;
            }
            return Ok(());
        }
        self.send_frame(&frame, target).await
    }

    async fn send_frame(&self, frame: &[u8], target: Option<&str>) -> Result<(), MeshError> {
        for piece in chunk::split_frame(frame, self.config.mtu) {
            match target {
                Some(device) => self.transport.send_to(device, &piece).await?,
                None => self.transport.broadcast(&piece).await?,
            }
        }
        Ok(())
    }

    /// Everyone we currently consider reachable.
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.registry.connected()
    }
}
