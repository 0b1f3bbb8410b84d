// Mesh packet model.
//
// Binary layout (big-endian throughout):
// - Version: 1 byte (1 or 2)
// - Type: 1 byte
// - TTL: 1 byte
// - Timestamp: 8 bytes (epoch millis)
// - Flags: 1 byte (bit 0: has recipient, bit 1: has signature, bit 2: compressed)
// - PayloadLength: 2 bytes (v1) / 4 bytes (v2)
// - SenderID: 8 bytes
// - RecipientID: 8 bytes (if flagged)
// - Payload: variable (2-byte original size prefix when compressed)
// - Signature: 64 bytes (if flagged)

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of a wire peer identifier.
pub const PEER_ID_LEN: usize = 8;

/// Size of an Ed25519 packet signature.
pub const SIGNATURE_LEN: usize = 64;

/// Default hop budget for freshly built packets.
pub const DEFAULT_TTL: u8 = 3;

/// Packet flag bits.
pub mod flags {
    /// Packet carries an 8-byte recipient ID (unicast).
    pub const HAS_RECIPIENT: u8 = 0x01;
    /// Packet carries a 64-byte trailing signature.
    pub const HAS_SIGNATURE: u8 = 0x02;
    /// Payload is compressed and prefixed with its original size.
    pub const IS_COMPRESSED: u8 = 0x04;
}

/// Wire packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Peer presence + identity keys (TLV payload).
    Announce = 0x01,
    /// Plaintext broadcast message.
    Message = 0x02,
    /// Peer departure notification.
    Leave = 0x03,
    /// Noise XX handshake message.
    NoiseHandshake = 0x10,
    /// Noise transport-phase ciphertext.
    NoiseEncrypted = 0x11,
    /// Protocol-level fragment of a larger packet.
    Fragment = 0x20,
    /// Sync request from a reconnecting peer.
    RequestSync = 0x21,
    /// File transfer payload.
    FileTransfer = 0x22,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PacketType::Announce),
            0x02 => Some(PacketType::Message),
            0x03 => Some(PacketType::Leave),
            0x10 => Some(PacketType::NoiseHandshake),
            0x11 => Some(PacketType::NoiseEncrypted),
            0x20 => Some(PacketType::Fragment),
            0x21 => Some(PacketType::RequestSync),
            0x22 => Some(PacketType::FileTransfer),
            _ => None,
        }
    }
}

/// Stable 8-byte peer identifier carried on the wire.
///
/// Displayed and parsed as 16 lowercase hex characters. The all-ones value
/// is the broadcast sentinel used as an explicit "everyone" recipient.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Explicit broadcast recipient.
    pub const BROADCAST: PeerId = PeerId([0xFF; PEER_ID_LEN]);

    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        PeerId(bytes)
    }

    /// Parse from a hex string; zero-fills when fewer than 16 hex chars are
    /// available, mirroring the lenient wire behaviour for short IDs.
    pub fn from_hex(hex_str: &str) -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        let mut chars = hex_str.as_bytes().chunks_exact(2);
        for (slot, pair) in bytes.iter_mut().zip(&mut chars) {
            if let Ok(s) = std::str::from_utf8(pair) {
                if let Ok(b) = u8::from_str_radix(s, 16) {
                    *slot = b;
                }
            }
        }
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

/// A decoded mesh packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshPacket {
    pub version: u8,
    pub packet_type: PacketType,
    pub ttl: u8,
    /// Epoch milliseconds at the original sender.
    pub timestamp: u64,
    pub sender: PeerId,
    /// Present iff the packet is unicast (or explicitly broadcast-tagged).
    pub recipient: Option<PeerId>,
    pub payload: Vec<u8>,
    /// Ed25519 signature over the TTL=0 canonical encoding.
    pub signature: Option<[u8; SIGNATURE_LEN]>,
}

impl MeshPacket {
    /// Build a broadcast packet with the default TTL.
    pub fn broadcast(packet_type: PacketType, sender: PeerId, payload: Vec<u8>) -> Self {
        MeshPacket {
            version: 1,
            packet_type,
            ttl: DEFAULT_TTL,
            timestamp: epoch_millis(),
            sender,
            recipient: None,
            payload,
            signature: None,
        }
    }

    /// Build a unicast packet with the default TTL.
    pub fn unicast(
        packet_type: PacketType,
        sender: PeerId,
        recipient: PeerId,
        payload: Vec<u8>,
    ) -> Self {
        MeshPacket {
            version: 1,
            packet_type,
            ttl: DEFAULT_TTL,
            timestamp: epoch_millis(),
            sender,
            recipient: Some(recipient),
            payload,
            signature: None,
        }
    }

    /// The version required to carry this payload: v2 once the payload
    /// length no longer fits the v1 2-byte length field.
    pub fn required_version(payload_len: usize) -> u8 {
        if payload_len > u16::MAX as usize {
            2
        } else {
            1
        }
    }

    /// Whether this packet is addressed to `peer` (directly or broadcast).
    pub fn addressed_to(&self, peer: &PeerId) -> bool {
        match &self.recipient {
            None => true,
            Some(r) => r.is_broadcast() || r == peer,
        }
    }

    /// Canonical encoding used for signing and verification.
    ///
    /// The signature is stripped and the TTL pinned to zero: TTL is the one
    /// field relays mutate, so it must not participate in the signature.
    pub fn canonical_for_signing(&self) -> MeshPacket {
        let mut canonical = self.clone();
        canonical.signature = None;
        canonical.ttl = 0;
        canonical
    }
}

/// Current time as epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
