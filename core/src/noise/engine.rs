// Handshake and transport-cipher abstractions.
//
// Session management talks to these traits rather than a concrete pattern
// implementation, so the handshake backend can be swapped without touching
// session bookkeeping or replay protection.

use crate::identity::NoiseKeypair;

use super::NoiseError;

/// Which side of the handshake this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// An in-progress handshake.
///
/// Callers alternate `write_message`/`read_message` in pattern order and
/// call `into_transport` once `is_complete` reports true.
pub trait HandshakeEngine: Send {
    /// Produce the next outbound handshake message carrying `payload`.
    fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError>;

    /// Consume the next inbound handshake message, returning its payload.
    fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, NoiseError>;

    /// True once every pattern message has been processed.
    fn is_complete(&self) -> bool;

    /// The remote party's static public key, once it has been transmitted.
    fn remote_static(&self) -> Option<[u8; 32]>;

    /// The transcript hash over the completed handshake, usable for
    /// channel binding. `None` until `is_complete` reports true.
    fn handshake_hash(&self) -> Option<[u8; 32]>;

    /// Split into (send, receive) transport ciphers.
    fn into_transport(
        self: Box<Self>,
    ) -> Result<(Box<dyn TransportCipher>, Box<dyn TransportCipher>), NoiseError>;
}

/// One direction of an established session.
pub trait TransportCipher: Send {
    /// Encrypt with the next nonce; returns the nonce used so the caller
    /// can carry it explicitly on the wire.
    fn encrypt_next(&mut self, plaintext: &[u8]) -> Result<(u32, Vec<u8>), NoiseError>;

    /// Decrypt a ciphertext at an explicitly supplied nonce.
    fn decrypt_at(&self, nonce: u32, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError>;
}

/// Factory for handshake engines.
pub trait NoiseBackend: Send + Sync {
    fn new_handshake(
        &self,
        role: HandshakeRole,
        local_static: &NoiseKeypair,
    ) -> Box<dyn HandshakeEngine>;
}
