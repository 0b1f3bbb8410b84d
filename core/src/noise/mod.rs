//! Noise XX secure sessions: handshake, transport ciphers, replay
//! protection, and per-peer session state.

pub mod engine;
pub mod replay;
pub mod session;
pub mod xx;

pub use engine::{HandshakeEngine, HandshakeRole, NoiseBackend, TransportCipher};
pub use replay::NonceWindow;
pub use session::{NoiseSession, SessionState};
pub use xx::XxBackend;

use thiserror::Error;

/// Errors from handshakes, transport encryption, and session handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NoiseError {
    #[error("handshake message out of order")]
    HandshakeOutOfOrder,
    #[error("malformed handshake message")]
    Malformed,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("invalid remote public key")]
    InvalidKey,
    #[error("nonce replayed or outside the receive window")]
    Replay,
    #[error("outbound nonce space exhausted")]
    NonceExceeded,
    #[error("handshake not complete")]
    HandshakeIncomplete,
    #[error("no established session")]
    NotEstablished,
    #[error("session failed and must be re-established")]
    SessionFailed,
}
