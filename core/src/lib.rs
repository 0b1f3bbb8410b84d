// Lantern Core — Offline Mesh Spine
//
// "Does this help two nearby humans exchange a message
//  with no infrastructure between them?"
//
// If the answer is no, it doesn't belong here.

pub mod fragment;
pub mod handler;
pub mod identity;
pub mod mesh;
pub mod noise;
pub mod peer;
pub mod protocol;
pub mod security;
pub mod transport;

use thiserror::Error;

pub use identity::MeshIdentity;
pub use mesh::{MeshConfig, MeshService};
pub use noise::NoiseError;
pub use peer::PeerInfo;
pub use protocol::{MeshPacket, PacketType, PeerId, PrivateMessage};
pub use transport::{Transport, TransportError};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("no established session with {0}")]
    NoSession(PeerId),
    #[error("packet encoding failed")]
    Encoding,
    #[error("payload exceeds protocol limits")]
    PayloadTooLarge,
    #[error(transparent)]
    Noise(#[from] NoiseError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============================================================================
// DELEGATE
// ============================================================================

/// Callbacks from the engine to the embedding application.
///
/// Every method has a no-op default, so implementations pick the events
/// they care about. Callbacks run on whatever task drove the inbound
/// packet; keep them short and hand heavy work elsewhere.
pub trait MeshDelegate: Send + Sync {
    fn peer_discovered(&self, _info: &PeerInfo) {}
    fn peer_left(&self, _peer: PeerId) {}
    fn public_message(&self, _from: PeerId, _nickname: String, _content: String) {}
    fn private_message(&self, _from: PeerId, _message: PrivateMessage) {}
    fn delivery_confirmed(&self, _from: PeerId, _message_id: String) {}
    fn read_receipt(&self, _from: PeerId, _message_id: String) {}
    fn file_received(&self, _from: PeerId, _data: Vec<u8>, _private: bool) {}
    fn session_established(&self, _peer: PeerId) {}
    fn sync_requested(&self, _peer: PeerId) {}
}

/// A delegate that ignores everything; handy for tools and tests.
pub struct NullDelegate;

impl MeshDelegate for NullDelegate {}
