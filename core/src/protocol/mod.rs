//! Wire format: packet model, binary codec, padding, and TLV payloads.

pub mod announce;
pub mod codec;
pub mod noise_payload;
pub mod packet;
pub mod padding;

pub use announce::IdentityAnnouncement;
pub use noise_payload::{NoisePayload, NoisePayloadType, PrivateMessage};
pub use packet::{
    epoch_millis, flags, MeshPacket, PacketType, PeerId, DEFAULT_TTL, PEER_ID_LEN, SIGNATURE_LEN,
};
