//! Inbound packet dispatch.
//!
//! The processor turns a decoded packet into registry updates, delegate
//! callbacks, and a set of reply packets for the orchestrator to sign and
//! send. It never touches the transport itself, which keeps every branch
//! unit-testable without I/O.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::fragment::FragmentManager;
use crate::identity::keys::derive_peer_id;
use crate::noise::NoiseError;
use crate::peer::{DeviceIndex, PeerRegistry};
use crate::protocol::{
    codec, IdentityAnnouncement, MeshPacket, NoisePayload, NoisePayloadType, PacketType, PeerId,
    PrivateMessage, DEFAULT_TTL,
};
use crate::security::SecurityManager;
use crate::MeshDelegate;

/// Ceiling on ciphertexts queued per peer while its session is pending.
const MAX_PENDING_CIPHERTEXTS: usize = 16;

/// What the orchestrator should do after one packet was processed.
#[derive(Default)]
pub struct ProcessOutcome {
    /// Unsigned reply packets; sent back over the originating device.
    pub replies: Vec<MeshPacket>,
    /// Packet offered for relay; the orchestrator handles the TTL.
    pub relay: Option<MeshPacket>,
    /// Send our own announce (new peer discovered or sync requested).
    pub announce_back: bool,
}

pub struct PacketProcessor {
    security: Arc<SecurityManager>,
    registry: Arc<PeerRegistry>,
    device_index: Arc<DeviceIndex>,
    fragments: Arc<FragmentManager>,
    delegate: Arc<dyn MeshDelegate>,
    /// Ciphertexts that arrived before their session; replayed on
    /// establishment.
    pending_ciphertexts: Mutex<HashMap<PeerId, Vec<Vec<u8>>>>,
}

impl PacketProcessor {
    pub fn new(
        security: Arc<SecurityManager>,
        registry: Arc<PeerRegistry>,
        device_index: Arc<DeviceIndex>,
        fragments: Arc<FragmentManager>,
        delegate: Arc<dyn MeshDelegate>,
    ) -> Self {
        PacketProcessor {
            security,
            registry,
            device_index,
            fragments,
            delegate,
            pending_ciphertexts: Mutex::new(HashMap::new()),
        }
    }

    /// Process one decoded packet that arrived over `device`.
    pub fn process(&self, device: &str, packet: MeshPacket) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();
        let local = self.registry.local_peer_id();

        // Our own packets come back around the flood; drop them.
        if packet.sender == local {
            return outcome;
        }

        trace!(
            device,
            sender = %packet.sender,
            packet_type = ?packet.packet_type,
            ttl = packet.ttl,
            "packet received"
        );

        self.registry.touch(&packet.sender);

        // Offer for relay before consuming: anything still carrying TTL
        // that is not addressed exclusively to us keeps flooding.
        let exclusively_ours = packet
            .recipient
            .is_some_and(|r| r == local && !r.is_broadcast());
        if packet.ttl > 0 && !exclusively_ours {
            outcome.relay = Some(packet.clone());
        }

        if !packet.addressed_to(&local) {
            return outcome;
        }

        match packet.packet_type {
            PacketType::Announce => self.handle_announce(device, &packet, &mut outcome),
            PacketType::Message => self.handle_public_message(&packet),
            PacketType::Leave => {
                self.registry.remove(&packet.sender);
                self.delegate.peer_left(packet.sender);
            }
            PacketType::NoiseHandshake => self.handle_handshake(&packet, &mut outcome),
            PacketType::NoiseEncrypted => self.handle_encrypted(&packet, &mut outcome),
            PacketType::Fragment => self.handle_fragment(device, &packet, &mut outcome),
            PacketType::RequestSync => {
                debug!(peer = %packet.sender, "sync requested");
                self.delegate.sync_requested(packet.sender);
                outcome.announce_back = true;
            }
            PacketType::FileTransfer => {
                self.delegate
                    .file_received(packet.sender, packet.payload.clone(), false);
            }
        }
        outcome
    }

    fn handle_announce(&self, device: &str, packet: &MeshPacket, outcome: &mut ProcessOutcome) {
        let Some(announcement) = IdentityAnnouncement::decode(&packet.payload) else {
            warn!(peer = %packet.sender, "malformed announce payload");
            return;
        };

        // The sender ID must be the fingerprint of the announced signing
        // key, otherwise the announce is claiming someone else's identity.
        if derive_peer_id(&announcement.signing_public_key) != packet.sender {
            warn!(peer = %packet.sender, "announce identity mismatch, dropping");
            return;
        }

        let verified = match packet.signature {
            Some(_) => {
                if SecurityManager::verify_packet(packet, &announcement.signing_public_key) {
                    true
                } else {
                    warn!(peer = %packet.sender, "announce signature invalid, dropping");
                    return;
                }
            }
            None => false,
        };

        // Heuristic: a full-TTL packet has not been relayed yet, so the
        // link it arrived over leads straight to the sender.
        let direct = packet.ttl >= DEFAULT_TTL;
        if direct {
            self.device_index.record(device, packet.sender);
        }

        let is_new = self.registry.add_or_update(
            packet.sender,
            announcement.nickname,
            announcement.noise_public_key,
            announcement.signing_public_key,
            verified,
            direct,
        );
        if is_new {
            if let Some(info) = self.registry.get(&packet.sender) {
                self.delegate.peer_discovered(&info);
            }
            // Introduce ourselves so discovery is mutual.
            outcome.announce_back = true;
        }
    }

    fn handle_public_message(&self, packet: &MeshPacket) {
        // Best-effort authentication: verify when we know the key, accept
        // with a note when we have not seen an announce yet.
        if let Some(info) = self.registry.get(&packet.sender) {
            if packet.signature.is_some()
                && !SecurityManager::verify_packet(packet, &info.signing_public_key)
            {
                warn!(peer = %packet.sender, "message signature invalid, dropping");
                return;
            }
        } else {
            debug!(peer = %packet.sender, "message from unannounced peer");
        }

        let Ok(content) = String::from_utf8(packet.payload.clone()) else {
            warn!(peer = %packet.sender, "message payload is not utf-8");
            return;
        };
        let nickname = self
            .registry
            .get(&packet.sender)
            .map(|p| p.nickname)
            .unwrap_or_else(|| packet.sender.to_hex());
        self.delegate
            .public_message(packet.sender, nickname, content);
    }

    fn handle_handshake(&self, packet: &MeshPacket, outcome: &mut ProcessOutcome) {
        match self.security.process_handshake(packet.sender, &packet.payload) {
            Ok(result) => {
                if let Some(response) = result.response {
                    outcome.replies.push(MeshPacket::unicast(
                        PacketType::NoiseHandshake,
                        self.registry.local_peer_id(),
                        packet.sender,
                        response,
                    ));
                }
                if result.established {
                    debug!(peer = %packet.sender, "session established");
                    self.delegate.session_established(packet.sender);
                    self.flush_pending(packet.sender, outcome);
                }
            }
            Err(e) => warn!(peer = %packet.sender, error = %e, "handshake failed"),
        }
    }

    fn handle_encrypted(&self, packet: &MeshPacket, outcome: &mut ProcessOutcome) {
        match self.security.decrypt_from_peer(&packet.sender, &packet.payload) {
            Ok(plaintext) => self.dispatch_plaintext(packet.sender, &plaintext, outcome),
            Err(NoiseError::NotEstablished) => {
                debug!(peer = %packet.sender, "ciphertext before session, queueing");
                let mut pending = self.pending_ciphertexts.lock();
                let queue = pending.entry(packet.sender).or_default();
                if queue.len() < MAX_PENDING_CIPHERTEXTS {
                    queue.push(packet.payload.clone());
                }
            }
            Err(e) => warn!(peer = %packet.sender, error = %e, "decryption failed"),
        }
    }

    /// Replay ciphertexts that arrived before the session was up.
    fn flush_pending(&self, peer: PeerId, outcome: &mut ProcessOutcome) {
        let queued = self.pending_ciphertexts.lock().remove(&peer);
        let Some(queued) = queued else { return };
        debug!(peer = %peer, count = queued.len(), "replaying queued ciphertexts");
        for ciphertext in queued {
            match self.security.decrypt_from_peer(&peer, &ciphertext) {
                Ok(plaintext) => self.dispatch_plaintext(peer, &plaintext, outcome),
                Err(e) => warn!(peer = %peer, error = %e, "queued ciphertext failed"),
            }
        }
    }

    fn dispatch_plaintext(&self, from: PeerId, plaintext: &[u8], outcome: &mut ProcessOutcome) {
        let Some(payload) = NoisePayload::decode(plaintext) else {
            warn!(peer = %from, "unrecognized encrypted payload");
            return;
        };
        match payload.payload_type {
            NoisePayloadType::PrivateMessage => {
                let Some(message) = PrivateMessage::decode(&payload.data) else {
                    warn!(peer = %from, "malformed private message");
                    return;
                };
                // Acknowledge delivery inside the same session.
                let ack = NoisePayload::new(
                    NoisePayloadType::Delivered,
                    message.message_id.clone().into_bytes(),
                );
                match self.security.encrypt_for_peer(&from, &ack.encode()) {
                    Ok(ciphertext) => outcome.replies.push(MeshPacket::unicast(
                        PacketType::NoiseEncrypted,
                        self.registry.local_peer_id(),
                        from,
                        ciphertext,
                    )),
                    Err(e) => warn!(peer = %from, error = %e, "could not encrypt ack"),
                }
                self.delegate.private_message(from, message);
            }
            NoisePayloadType::Delivered => {
                if let Ok(message_id) = String::from_utf8(payload.data) {
                    self.delegate.delivery_confirmed(from, message_id);
                }
            }
            NoisePayloadType::ReadReceipt => {
                if let Ok(message_id) = String::from_utf8(payload.data) {
                    self.delegate.read_receipt(from, message_id);
                }
            }
            NoisePayloadType::FileTransfer => {
                self.delegate.file_received(from, payload.data, true);
            }
        }
    }

    fn handle_fragment(&self, device: &str, packet: &MeshPacket, outcome: &mut ProcessOutcome) {
        let Some(reassembled) = self.fragments.ingest(device, &packet.payload) else {
            return;
        };
        let Some(inner) = codec::decode(&reassembled) else {
            warn!(device, "reassembled fragment did not decode");
            return;
        };
        debug!(device, inner_type = ?inner.packet_type, "fragmented packet complete");
        // The inner packet re-enters dispatch as if it arrived whole. Its
        // own relay offer is suppressed; the fragments already relayed.
        let mut inner_outcome = self.process(device, inner);
        inner_outcome.relay = None;
        outcome.replies.append(&mut inner_outcome.replies);
        outcome.announce_back |= inner_outcome.announce_back;
    }
}
