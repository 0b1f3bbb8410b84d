// Per-peer session state machine.
//
// A session moves Uninitialized -> Handshaking -> Established, or to
// Failed on any handshake error. Failed sessions are inert; the owner
// discards and re-creates them. Transport ciphertexts carry a 4-byte
// big-endian nonce prefix checked against a sliding replay window before
// decryption and marked seen only after the ciphertext authenticates.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::identity::NoiseKeypair;
use crate::protocol::PeerId;

use super::engine::{HandshakeEngine, HandshakeRole, NoiseBackend, TransportCipher};
use super::replay::{prepend_nonce, split_nonce, NonceWindow};
use super::xx::XX_MESSAGE_1_LEN;
use super::NoiseError;

/// Re-handshake once a session has been up this long.
pub const REKEY_AFTER: Duration = Duration::from_secs(60 * 60);

/// Re-handshake once this many transport messages have passed in either
/// direction.
pub const REKEY_MESSAGE_LIMIT: u64 = 10_000;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Established,
    Failed,
}

/// A Noise session with one peer.
pub struct NoiseSession {
    peer: PeerId,
    role: HandshakeRole,
    state: SessionState,
    handshake: Option<Box<dyn HandshakeEngine>>,
    send: Option<Box<dyn TransportCipher>>,
    recv: Option<Box<dyn TransportCipher>>,
    recv_window: NonceWindow,
    remote_static: Option<[u8; 32]>,
    handshake_hash: Option<[u8; 32]>,
    established_at: Option<Instant>,
    message_count: u64,
}

impl NoiseSession {
    pub fn new(peer: PeerId, role: HandshakeRole) -> Self {
        NoiseSession {
            peer,
            role,
            state: SessionState::Uninitialized,
            handshake: None,
            send: None,
            recv: None,
            recv_window: NonceWindow::new(),
            remote_static: None,
            handshake_hash: None,
            established_at: None,
            message_count: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// The peer's static Noise key, known once the handshake delivered it.
    pub fn remote_static_key(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    /// Transcript hash of the completed handshake, for channel binding.
    pub fn handshake_hash(&self) -> Option<[u8; 32]> {
        self.handshake_hash
    }

    /// Whether the session is due for a fresh handshake.
    pub fn needs_rekey(&self) -> bool {
        if self.state != SessionState::Established {
            return false;
        }
        let aged = self
            .established_at
            .map(|at| at.elapsed() >= REKEY_AFTER)
            .unwrap_or(false);
        aged || self.message_count >= REKEY_MESSAGE_LIMIT
    }

    /// Initiator: produce the opening handshake message.
    pub fn start_handshake(
        &mut self,
        backend: &dyn NoiseBackend,
        local_static: &NoiseKeypair,
    ) -> Result<Vec<u8>, NoiseError> {
        if self.state != SessionState::Uninitialized {
            return Err(NoiseError::HandshakeOutOfOrder);
        }
        let mut handshake = backend.new_handshake(HandshakeRole::Initiator, local_static);
        let message = handshake.write_message(&[]).inspect_err(|_| {
            self.state = SessionState::Failed;
        })?;
        self.role = HandshakeRole::Initiator;
        self.handshake = Some(handshake);
        self.state = SessionState::Handshaking;
        trace!(peer = %self.peer, "handshake initiated");
        Ok(message)
    }

    /// Feed an inbound handshake message; returns the response to send, if
    /// the pattern calls for one.
    pub fn process_handshake_message(
        &mut self,
        backend: &dyn NoiseBackend,
        local_static: &NoiseKeypair,
        message: &[u8],
    ) -> Result<Option<Vec<u8>>, NoiseError> {
        match self.state {
            SessionState::Uninitialized => {
                if self.role != HandshakeRole::Responder {
                    return Err(NoiseError::HandshakeOutOfOrder);
                }
                self.handshake =
                    Some(backend.new_handshake(HandshakeRole::Responder, local_static));
                self.state = SessionState::Handshaking;
            }
            SessionState::Handshaking => {
                // A repeated opening message means the peer restarted its
                // side; drop our progress and follow.
                if self.role == HandshakeRole::Responder && message.len() == XX_MESSAGE_1_LEN {
                    debug!(peer = %self.peer, "handshake restarted by peer");
                    self.handshake =
                        Some(backend.new_handshake(HandshakeRole::Responder, local_static));
                }
            }
            SessionState::Established | SessionState::Failed => {
                return Err(NoiseError::HandshakeOutOfOrder);
            }
        }

        let Some(handshake) = self.handshake.as_mut() else {
            return Err(NoiseError::HandshakeOutOfOrder);
        };

        if let Err(e) = handshake.read_message(message) {
            self.fail();
            return Err(e);
        }

        let response = if handshake.is_complete() {
            None
        } else {
            match handshake.write_message(&[]) {
                Ok(out) => Some(out),
                Err(e) => {
                    self.fail();
                    return Err(e);
                }
            }
        };

        if self.handshake.as_ref().is_some_and(|h| h.is_complete()) {
            self.finish_handshake()?;
        }
        Ok(response)
    }

    fn finish_handshake(&mut self) -> Result<(), NoiseError> {
        let Some(handshake) = self.handshake.take() else {
            return Err(NoiseError::HandshakeIncomplete);
        };
        self.remote_static = handshake.remote_static();
        self.handshake_hash = handshake.handshake_hash();
        let (send, recv) = handshake.into_transport().inspect_err(|_| self.fail())?;
        self.send = Some(send);
        self.recv = Some(recv);
        self.state = SessionState::Established;
        self.established_at = Some(Instant::now());
        self.message_count = 0;
        debug!(peer = %self.peer, role = ?self.role, "session established");
        Ok(())
    }

    fn fail(&mut self) {
        self.state = SessionState::Failed;
        self.handshake = None;
        self.send = None;
        self.recv = None;
    }

    /// Encrypt a transport message; the result carries its nonce prefix.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.state == SessionState::Failed {
            return Err(NoiseError::SessionFailed);
        }
        let send = self.send.as_mut().ok_or(NoiseError::NotEstablished)?;
        let (nonce, ciphertext) = send.encrypt_next(plaintext)?;
        self.message_count += 1;
        Ok(prepend_nonce(nonce, ciphertext))
    }

    /// Decrypt a nonce-prefixed transport message with replay filtering.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.state == SessionState::Failed {
            return Err(NoiseError::SessionFailed);
        }
        let recv = self.recv.as_ref().ok_or(NoiseError::NotEstablished)?;
        let (nonce, ciphertext) = split_nonce(data).ok_or(NoiseError::Malformed)?;
        if !self.recv_window.check(nonce as u64) {
            return Err(NoiseError::Replay);
        }
        let plaintext = recv.decrypt_at(nonce, ciphertext)?;
        // Authenticated: only now does the nonce count as seen.
        self.recv_window.mark(nonce as u64);
        self.message_count += 1;
        Ok(plaintext)
    }
}
