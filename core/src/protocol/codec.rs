// Binary wire codec for mesh packets.
//
// Encoding optionally compresses the payload, assembles the versioned
// header, then pads the whole frame to a standard block size. Decoding is
// the tolerant inverse: it first tries the raw bytes, then retries once
// with padding stripped. Malformed input is answered with `None`, never a
// panic — every slice is bounds-checked against the declared lengths first.

use tracing::{debug, warn};

use super::packet::{flags, MeshPacket, PacketType, PeerId, PEER_ID_LEN, SIGNATURE_LEN};
use super::padding;

const HEADER_LEN_V1: usize = 14; // version + type + ttl + timestamp(8) + flags + len(2)
const HEADER_LEN_V2: usize = 16; // version + type + ttl + timestamp(8) + flags + len(4)

/// Payloads below this size are never worth compressing.
const COMPRESSION_THRESHOLD: usize = 200;

/// The compressed-payload prefix is a 2-byte original size, so anything
/// larger than u16::MAX must go out uncompressed.
const MAX_COMPRESSIBLE: usize = u16::MAX as usize;

fn header_len(version: u8) -> usize {
    if version >= 2 {
        HEADER_LEN_V2
    } else {
        HEADER_LEN_V1
    }
}

/// Cheap pre-check: skip compression for small or high-entropy payloads.
///
/// Counts distinct byte values over the first 256 bytes; near-uniform byte
/// diversity is a strong signal the data is already compressed.
fn should_compress(payload: &[u8]) -> bool {
    if payload.len() < COMPRESSION_THRESHOLD {
        return false;
    }
    let window = &payload[..payload.len().min(256)];
    let mut seen = [false; 256];
    let mut unique = 0usize;
    for &b in window {
        if !seen[b as usize] {
            seen[b as usize] = true;
            unique += 1;
        }
    }
    (unique as f64) / (window.len() as f64) < 0.9
}

/// Compress if it actually shrinks the payload; `None` means "send raw".
fn try_compress(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() > MAX_COMPRESSIBLE || !should_compress(payload) {
        return None;
    }
    let compressed = lz4_flex::block::compress(payload);
    if !compressed.is_empty() && compressed.len() < payload.len() {
        Some(compressed)
    } else {
        None
    }
}

/// Encode a packet to its padded wire frame.
///
/// Returns `None` on any internal failure; encoding never panics into the
/// caller.
pub fn encode(packet: &MeshPacket) -> Option<Vec<u8>> {
    if packet.version != 1 && packet.version != 2 {
        return None;
    }

    // Payloads that overflow the v1 length field require a v2 header.
    if packet.version == 1 && packet.payload.len() > u16::MAX as usize {
        warn!(
            len = packet.payload.len(),
            "payload exceeds v1 length field; refusing to encode"
        );
        return None;
    }

    let (payload, original_size) = match try_compress(&packet.payload) {
        Some(compressed) => {
            let original = packet.payload.len() as u16;
            (compressed, Some(original))
        }
        None => (packet.payload.clone(), None),
    };
    let is_compressed = original_size.is_some();

    let payload_field_len = payload.len() + if is_compressed { 2 } else { 0 };
    if packet.version == 1 && payload_field_len > u16::MAX as usize {
        return None;
    }

    let mut flag_bits = 0u8;
    if packet.recipient.is_some() {
        flag_bits |= flags::HAS_RECIPIENT;
    }
    if packet.signature.is_some() {
        flag_bits |= flags::HAS_SIGNATURE;
    }
    if is_compressed {
        flag_bits |= flags::IS_COMPRESSED;
    }

    let capacity = header_len(packet.version)
        + PEER_ID_LEN
        + if packet.recipient.is_some() { PEER_ID_LEN } else { 0 }
        + payload_field_len
        + if packet.signature.is_some() { SIGNATURE_LEN } else { 0 };
    let mut out = Vec::with_capacity(capacity);

    out.push(packet.version);
    out.push(packet.packet_type as u8);
    out.push(packet.ttl);
    out.extend_from_slice(&packet.timestamp.to_be_bytes());
    out.push(flag_bits);
    if packet.version >= 2 {
        out.extend_from_slice(&(payload_field_len as u32).to_be_bytes());
    } else {
        out.extend_from_slice(&(payload_field_len as u16).to_be_bytes());
    }

    out.extend_from_slice(packet.sender.as_bytes());
    if let Some(recipient) = &packet.recipient {
        out.extend_from_slice(recipient.as_bytes());
    }

    if let Some(original) = original_size {
        out.extend_from_slice(&original.to_be_bytes());
    }
    out.extend_from_slice(&payload);

    if let Some(signature) = &packet.signature {
        out.extend_from_slice(signature);
    }

    // Pad the assembled frame to a standard block size.
    let target = padding::optimal_block_size(out.len());
    Some(padding::pad(&out, target))
}

/// Decode a wire frame into a packet.
///
/// Tries the raw bytes first, then once more with padding stripped.
pub fn decode(data: &[u8]) -> Option<MeshPacket> {
    if let Some(packet) = decode_core(data) {
        return Some(packet);
    }
    let unpadded = padding::unpad(data);
    if unpadded.len() == data.len() {
        return None; // nothing was stripped, no point retrying
    }
    decode_core(unpadded)
}

fn decode_core(raw: &[u8]) -> Option<MeshPacket> {
    if raw.len() < HEADER_LEN_V1 + PEER_ID_LEN {
        return None;
    }

    let version = raw[0];
    if version != 1 && version != 2 {
        return None;
    }
    let packet_type = PacketType::from_u8(raw[1])?;
    let ttl = raw[2];
    let timestamp = u64::from_be_bytes(raw[3..11].try_into().ok()?);

    let flag_bits = raw[11];
    let has_recipient = flag_bits & flags::HAS_RECIPIENT != 0;
    let has_signature = flag_bits & flags::HAS_SIGNATURE != 0;
    let is_compressed = flag_bits & flags::IS_COMPRESSED != 0;

    let mut offset = 12;
    let payload_len = if version >= 2 {
        let len = u32::from_be_bytes(raw.get(offset..offset + 4)?.try_into().ok()?) as usize;
        offset += 4;
        len
    } else {
        let len = u16::from_be_bytes(raw.get(offset..offset + 2)?.try_into().ok()?) as usize;
        offset += 2;
        len
    };

    // Validate the declared lengths against what we actually hold before
    // slicing anything out.
    let mut expected = header_len(version) + PEER_ID_LEN + payload_len;
    if has_recipient {
        expected += PEER_ID_LEN;
    }
    if has_signature {
        expected += SIGNATURE_LEN;
    }
    if raw.len() < expected {
        return None;
    }

    let sender = PeerId::from_bytes(raw[offset..offset + PEER_ID_LEN].try_into().ok()?);
    offset += PEER_ID_LEN;

    let recipient = if has_recipient {
        let id = PeerId::from_bytes(raw[offset..offset + PEER_ID_LEN].try_into().ok()?);
        offset += PEER_ID_LEN;
        Some(id)
    } else {
        None
    };

    let payload = if is_compressed {
        if payload_len < 2 {
            return None;
        }
        let original_size =
            u16::from_be_bytes(raw[offset..offset + 2].try_into().ok()?) as usize;
        let compressed = &raw[offset + 2..offset + payload_len];
        offset += payload_len;
        match lz4_flex::block::decompress(compressed, original_size) {
            Ok(decompressed) if decompressed.len() == original_size => decompressed,
            Ok(_) | Err(_) => {
                debug!(original_size, "payload decompression failed");
                return None;
            }
        }
    } else {
        let payload = raw[offset..offset + payload_len].to_vec();
        offset += payload_len;
        payload
    };

    let signature = if has_signature {
        let sig: [u8; SIGNATURE_LEN] =
            raw[offset..offset + SIGNATURE_LEN].try_into().ok()?;
        Some(sig)
    } else {
        None
    };

    Some(MeshPacket {
        version,
        packet_type,
        ttl,
        timestamp,
        sender,
        recipient,
        payload,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sender() -> PeerId {
        PeerId::from_hex("0011223344556677")
    }

    #[test]
    fn roundtrip_broadcast() {
        let packet = MeshPacket::broadcast(PacketType::Message, sender(), b"hello mesh".to_vec());
        let encoded = encode(&packet).unwrap();
        // Small frames pad to the first block size.
        assert_eq!(encoded.len(), 256);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn roundtrip_unicast_with_signature() {
        let mut packet = MeshPacket::unicast(
            PacketType::NoiseEncrypted,
            sender(),
            PeerId::from_hex("8899aabbccddeeff"),
            vec![0x42; 50],
        );
        packet.signature = Some([0xAB; SIGNATURE_LEN]);
        let decoded = decode(&encode(&packet).unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn roundtrip_compressible_payload() {
        // Long run of repeated bytes: low diversity, compresses well.
        let payload = vec![b'a'; 1000];
        let packet = MeshPacket::broadcast(PacketType::Message, sender(), payload);
        let encoded = encode(&packet).unwrap();
        // 1000 raw bytes must have shrunk below the 1024 block.
        assert!(encoded.len() <= 512);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn high_entropy_payload_skips_compression() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(512).collect();
        assert!(!should_compress(&payload));
    }

    #[test]
    fn roundtrip_v2_large_payload() {
        let mut packet =
            MeshPacket::broadcast(PacketType::FileTransfer, sender(), vec![0x5A; 70_000]);
        packet.version = 2;
        let decoded = decode(&encode(&packet).unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn v1_refuses_oversized_payload() {
        let packet = MeshPacket::broadcast(PacketType::FileTransfer, sender(), vec![0; 70_000]);
        assert!(encode(&packet).is_none());
    }

    #[test]
    fn truncated_header_rejected() {
        let packet = MeshPacket::broadcast(PacketType::Message, sender(), b"hi".to_vec());
        let encoded = encode(&packet).unwrap();
        assert!(decode(&encoded[..10]).is_none());
    }

    #[test]
    fn declared_length_beyond_buffer_rejected() {
        let packet = MeshPacket::broadcast(PacketType::Message, sender(), b"hi".to_vec());
        let mut encoded = encode(&packet).unwrap();
        // Blow up the declared payload length (bytes 12..14 for v1).
        encoded[12] = 0xFF;
        encoded[13] = 0xFF;
        assert!(decode(&encoded).is_none());
    }

    #[test]
    fn unknown_version_rejected() {
        let packet = MeshPacket::broadcast(PacketType::Message, sender(), b"hi".to_vec());
        let mut encoded = encode(&packet).unwrap();
        encoded[0] = 3;
        assert!(decode(&encoded).is_none());
    }

    #[test]
    fn unknown_type_rejected() {
        let packet = MeshPacket::broadcast(PacketType::Message, sender(), b"hi".to_vec());
        let mut encoded = encode(&packet).unwrap();
        encoded[1] = 0x7F;
        assert!(decode(&encoded).is_none());
    }

    #[test]
    fn garbage_input_is_not_fatal() {
        assert!(decode(&[]).is_none());
        assert!(decode(&[0x01]).is_none());
        assert!(decode(&vec![0xFF; 300]).is_none());
    }

    proptest! {
        #[test]
        fn roundtrip_property(
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            ttl in 0u8..8,
            unicast in any::<bool>(),
        ) {
            let mut packet = if unicast {
                MeshPacket::unicast(
                    PacketType::Message,
                    sender(),
                    PeerId::from_hex("8899aabbccddeeff"),
                    payload,
                )
            } else {
                MeshPacket::broadcast(PacketType::Message, sender(), payload)
            };
            packet.ttl = ttl;
            let encoded = encode(&packet).unwrap();
            let decoded = decode(&encoded).unwrap();
            prop_assert_eq!(decoded, packet);
        }
    }
}
