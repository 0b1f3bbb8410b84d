//! Session ownership and packet authentication.
//!
//! One Noise session per peer lives behind a single lock, so cipher and
//! nonce mutation is serialized by construction. Packet signatures are
//! Ed25519 over the canonical encoding with the signature stripped and the
//! TTL pinned to zero, which keeps them valid across relay hops.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::identity::{MeshIdentity, SigningKeys};
use crate::noise::engine::{HandshakeRole, NoiseBackend};
use crate::noise::session::{NoiseSession, SessionState};
use crate::noise::NoiseError;
use crate::protocol::{codec, MeshPacket, PeerId};

/// Outcome of feeding one inbound handshake message.
pub struct HandshakeResult {
    /// Next handshake message to send back, if the pattern calls for one.
    pub response: Option<Vec<u8>>,
    /// The session reached Established with this message.
    pub established: bool,
}

/// Owns all Noise sessions plus the signing identity.
pub struct SecurityManager {
    identity: MeshIdentity,
    backend: Box<dyn NoiseBackend>,
    sessions: Mutex<HashMap<PeerId, NoiseSession>>,
}

impl SecurityManager {
    pub fn new(identity: MeshIdentity, backend: Box<dyn NoiseBackend>) -> Self {
        SecurityManager {
            identity,
            backend,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Open a handshake toward `peer`.
    ///
    /// Returns the first handshake message, or `None` when a session
    /// already exists in any live state (no duplicate handshakes).
    pub fn initiate_handshake(&self, peer: PeerId) -> Result<Option<Vec<u8>>, NoiseError> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&peer) {
            match existing.state() {
                SessionState::Established | SessionState::Handshaking => {
                    debug!(peer = %peer, state = ?existing.state(), "handshake skipped, session live");
                    return Ok(None);
                }
                SessionState::Uninitialized | SessionState::Failed => {
                    sessions.remove(&peer);
                }
            }
        }
        let mut session = NoiseSession::new(peer, HandshakeRole::Initiator);
        let message = session.start_handshake(self.backend.as_ref(), &self.identity.noise)?;
        sessions.insert(peer, session);
        Ok(Some(message))
    }

    /// Feed an inbound handshake message from `peer`.
    pub fn process_handshake(
        &self,
        peer: PeerId,
        message: &[u8],
    ) -> Result<HandshakeResult, NoiseError> {
        let is_opening = message.len() == crate::noise::xx::XX_MESSAGE_1_LEN;
        let mut sessions = self.sessions.lock();

        match sessions.get(&peer).map(|s| (s.state(), s.role())) {
            // Both sides initiated at once: the lexically lower peer ID
            // keeps its initiator role, the other yields and responds.
            Some((SessionState::Handshaking, HandshakeRole::Initiator)) if is_opening => {
                if self.local_peer_id().as_bytes() < peer.as_bytes() {
                    debug!(peer = %peer, "simultaneous handshake, keeping initiator role");
                    return Ok(HandshakeResult {
                        response: None,
                        established: false,
                    });
                }
                debug!(peer = %peer, "simultaneous handshake, yielding to peer");
                sessions.remove(&peer);
            }
            // A stale or broken session gives way to a fresh opening.
            Some((SessionState::Established | SessionState::Failed, _)) if is_opening => {
                debug!(peer = %peer, "replacing old session for new handshake");
                sessions.remove(&peer);
            }
            _ => {}
        }

        let session = sessions
            .entry(peer)
            .or_insert_with(|| NoiseSession::new(peer, HandshakeRole::Responder));
        let response =
            session.process_handshake_message(self.backend.as_ref(), &self.identity.noise, message)?;
        let established = session.is_established();
        Ok(HandshakeResult {
            response,
            established,
        })
    }

    pub fn has_established_session(&self, peer: &PeerId) -> bool {
        self.sessions
            .lock()
            .get(peer)
            .is_some_and(|s| s.is_established())
    }

    /// The static Noise key the peer proved during its handshake.
    pub fn remote_static_key(&self, peer: &PeerId) -> Option<[u8; 32]> {
        self.sessions
            .lock()
            .get(peer)
            .and_then(|s| s.remote_static_key())
    }

    /// Transcript hash of the handshake with `peer`, for channel binding.
    pub fn handshake_hash(&self, peer: &PeerId) -> Option<[u8; 32]> {
        self.sessions
            .lock()
            .get(peer)
            .and_then(|s| s.handshake_hash())
    }

    pub fn session_needs_rekey(&self, peer: &PeerId) -> bool {
        self.sessions
            .lock()
            .get(peer)
            .is_some_and(|s| s.needs_rekey())
    }

    /// Peers whose sessions have aged or chattered past the rekey limits.
    pub fn peers_needing_rekey(&self) -> Vec<PeerId> {
        self.sessions
            .lock()
            .iter()
            .filter(|(_, s)| s.needs_rekey())
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn encrypt_for_peer(&self, peer: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(peer).ok_or(NoiseError::NotEstablished)?;
        session.encrypt(plaintext)
    }

    pub fn decrypt_from_peer(&self, peer: &PeerId, data: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(peer).ok_or(NoiseError::NotEstablished)?;
        session.decrypt(data)
    }

    pub fn remove_session(&self, peer: &PeerId) {
        self.sessions.lock().remove(peer);
    }

    /// Drop every session (shutdown or panic-button).
    pub fn clear_all(&self) {
        self.sessions.lock().clear();
    }

    /// Sign `packet` in place over its canonical encoding.
    pub fn sign_packet(&self, packet: &mut MeshPacket) -> bool {
        let Some(canonical) = codec::encode(&packet.canonical_for_signing()) else {
            warn!("could not encode packet for signing");
            return false;
        };
        packet.signature = Some(self.identity.signing.sign(&canonical));
        true
    }

    /// Verify a packet's signature against `signing_public_key`.
    pub fn verify_packet(packet: &MeshPacket, signing_public_key: &[u8]) -> bool {
        let Some(signature) = &packet.signature else {
            return false;
        };
        let Some(canonical) = codec::encode(&packet.canonical_for_signing()) else {
            return false;
        };
        SigningKeys::verify_with(signing_public_key, &canonical, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::xx::XxBackend;
    use crate::protocol::PacketType;

    fn manager() -> SecurityManager {
        SecurityManager::new(MeshIdentity::generate(), Box::new(XxBackend))
    }

    fn establish(a: &SecurityManager, b: &SecurityManager) {
        let a_id = a.local_peer_id();
        let b_id = b.local_peer_id();
        let m1 = a.initiate_handshake(b_id).unwrap().unwrap();
        let r1 = b.process_handshake(a_id, &m1).unwrap();
        let r2 = a.process_handshake(b_id, &r1.response.unwrap()).unwrap();
        assert!(r2.established);
        let r3 = b.process_handshake(a_id, &r2.response.unwrap()).unwrap();
        assert!(r3.established);
        assert!(r3.response.is_none());
    }

    #[test]
    fn full_handshake_and_messaging() {
        let alice = manager();
        let bob = manager();
        establish(&alice, &bob);

        assert!(alice.has_established_session(&bob.local_peer_id()));
        assert!(bob.has_established_session(&alice.local_peer_id()));

        let wire = alice
            .encrypt_for_peer(&bob.local_peer_id(), b"secret hello")
            .unwrap();
        assert_eq!(
            bob.decrypt_from_peer(&alice.local_peer_id(), &wire).unwrap(),
            b"secret hello"
        );

        // Both sides bind to the same handshake transcript.
        let hash = alice.handshake_hash(&bob.local_peer_id()).unwrap();
        assert_eq!(bob.handshake_hash(&alice.local_peer_id()), Some(hash));
    }

    #[test]
    fn initiate_is_noop_with_live_session() {
        let alice = manager();
        let bob = manager();
        establish(&alice, &bob);
        assert!(alice.initiate_handshake(bob.local_peer_id()).unwrap().is_none());
    }

    #[test]
    fn simultaneous_handshake_resolves() {
        let alice = manager();
        let bob = manager();
        let a_id = alice.local_peer_id();
        let b_id = bob.local_peer_id();

        let ma = alice.initiate_handshake(b_id).unwrap().unwrap();
        let mb = bob.initiate_handshake(a_id).unwrap().unwrap();

        // Cross-deliver the opening messages; exactly one side yields.
        let ra = alice.process_handshake(b_id, &mb).unwrap();
        let rb = bob.process_handshake(a_id, &ma).unwrap();

        let (winner, loser, winner_id, loser_id, opening_response) =
            if a_id.as_bytes() < b_id.as_bytes() {
                assert!(ra.response.is_none());
                (&alice, &bob, a_id, b_id, rb.response.unwrap())
            } else {
                assert!(rb.response.is_none());
                (&bob, &alice, b_id, a_id, ra.response.unwrap())
            };

        // Winner consumes the loser's message 2, sends message 3.
        let r2 = winner.process_handshake(loser_id, &opening_response).unwrap();
        assert!(r2.established);
        let r3 = loser.process_handshake(winner_id, &r2.response.unwrap()).unwrap();
        assert!(r3.established);

        assert!(winner.has_established_session(&loser_id));
        assert!(loser.has_established_session(&winner_id));
    }

    #[test]
    fn fresh_opening_replaces_established_session() {
        let alice = manager();
        let bob = manager();
        establish(&alice, &bob);

        // Alice restarts from scratch (say, after an app restart).
        let alice2 = SecurityManager::new(alice.identity.clone(), Box::new(XxBackend));
        let m1 = alice2.initiate_handshake(bob.local_peer_id()).unwrap().unwrap();
        let r1 = bob.process_handshake(alice2.local_peer_id(), &m1).unwrap();
        assert!(r1.response.is_some());
    }

    #[test]
    fn encrypt_without_session_fails() {
        let alice = manager();
        let stranger = PeerId::from_hex("1234567812345678");
        assert_eq!(
            alice.encrypt_for_peer(&stranger, b"x"),
            Err(NoiseError::NotEstablished)
        );
    }

    #[test]
    fn sign_and_verify_survives_ttl_mutation() {
        let alice = manager();
        let signing_key = alice.identity.signing.public_key_bytes();
        let mut packet = MeshPacket::broadcast(
            PacketType::Message,
            alice.local_peer_id(),
            b"relayed".to_vec(),
        );
        packet.ttl = 5;
        assert!(alice.sign_packet(&mut packet));
        assert!(SecurityManager::verify_packet(&packet, &signing_key));

        // A relay decrements TTL; the signature must still hold.
        packet.ttl = 4;
        assert!(SecurityManager::verify_packet(&packet, &signing_key));

        // Payload tampering must not.
        packet.payload = b"tampered".to_vec();
        assert!(!SecurityManager::verify_packet(&packet, &signing_key));
    }

    #[test]
    fn clear_all_drops_sessions() {
        let alice = manager();
        let bob = manager();
        establish(&alice, &bob);
        alice.clear_all();
        assert!(!alice.has_established_session(&bob.local_peer_id()));
    }
}
