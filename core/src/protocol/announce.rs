// Identity announcement TLV payload.
//
// An announce packet carries the sender's nickname and both public keys in
// a compact type-length-value encoding. Unknown TLV types are skipped so
// newer peers can append fields without breaking older decoders; the three
// known fields are mandatory.

use tracing::debug;

const TLV_NICKNAME: u8 = 0x01;
const TLV_NOISE_PUBLIC_KEY: u8 = 0x02;
const TLV_SIGNING_PUBLIC_KEY: u8 = 0x03;

/// Maximum length a single TLV value can carry (1-byte length field).
const MAX_TLV_VALUE: usize = 255;

/// Decoded announce payload: who a peer is and how to reach it securely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityAnnouncement {
    pub nickname: String,
    /// X25519 static public key for Noise handshakes.
    pub noise_public_key: Vec<u8>,
    /// Ed25519 public key packets are signed with.
    pub signing_public_key: Vec<u8>,
}

impl IdentityAnnouncement {
    pub fn new(
        nickname: String,
        noise_public_key: Vec<u8>,
        signing_public_key: Vec<u8>,
    ) -> Self {
        IdentityAnnouncement {
            nickname,
            noise_public_key,
            signing_public_key,
        }
    }

    /// Encode to TLV bytes. Returns `None` if any field exceeds the 1-byte
    /// TLV length limit.
    pub fn encode(&self) -> Option<Vec<u8>> {
        let nickname = self.nickname.as_bytes();
        if nickname.len() > MAX_TLV_VALUE
            || self.noise_public_key.len() > MAX_TLV_VALUE
            || self.signing_public_key.len() > MAX_TLV_VALUE
        {
            return None;
        }

        let mut out = Vec::with_capacity(
            6 + nickname.len() + self.noise_public_key.len() + self.signing_public_key.len(),
        );
        write_tlv(&mut out, TLV_NICKNAME, nickname);
        write_tlv(&mut out, TLV_NOISE_PUBLIC_KEY, &self.noise_public_key);
        write_tlv(&mut out, TLV_SIGNING_PUBLIC_KEY, &self.signing_public_key);
        Some(out)
    }

    /// Decode from TLV bytes; all three known fields must be present.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut nickname = None;
        let mut noise_public_key = None;
        let mut signing_public_key = None;

        let mut offset = 0;
        while offset + 2 <= data.len() {
            let tlv_type = data[offset];
            let len = data[offset + 1] as usize;
            offset += 2;
            let value = data.get(offset..offset + len)?;
            offset += len;

            match tlv_type {
                TLV_NICKNAME => nickname = Some(String::from_utf8(value.to_vec()).ok()?),
                TLV_NOISE_PUBLIC_KEY => noise_public_key = Some(value.to_vec()),
                TLV_SIGNING_PUBLIC_KEY => signing_public_key = Some(value.to_vec()),
                other => {
                    // Forward compatibility: ignore fields we don't know.
                    debug!(tlv_type = other, len, "skipping unknown announce TLV");
                }
            }
        }

        Some(IdentityAnnouncement {
            nickname: nickname?,
            noise_public_key: noise_public_key?,
            signing_public_key: signing_public_key?,
        })
    }
}

fn write_tlv(out: &mut Vec<u8>, tlv_type: u8, value: &[u8]) {
    out.push(tlv_type);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IdentityAnnouncement {
        IdentityAnnouncement::new("alice".into(), vec![0x11; 32], vec![0x22; 32])
    }

    #[test]
    fn roundtrip() {
        let announce = sample();
        let encoded = announce.encode().unwrap();
        assert_eq!(IdentityAnnouncement::decode(&encoded).unwrap(), announce);
    }

    #[test]
    fn unknown_tlv_is_skipped() {
        let mut encoded = sample().encode().unwrap();
        // Append an unknown field; the decoder should step over it.
        encoded.push(0x7E);
        encoded.push(3);
        encoded.extend_from_slice(&[1, 2, 3]);
        assert_eq!(IdentityAnnouncement::decode(&encoded).unwrap(), sample());
    }

    #[test]
    fn missing_field_rejected() {
        let mut out = Vec::new();
        write_tlv(&mut out, TLV_NICKNAME, b"bob");
        write_tlv(&mut out, TLV_NOISE_PUBLIC_KEY, &[0x11; 32]);
        // No signing key.
        assert!(IdentityAnnouncement::decode(&out).is_none());
    }

    #[test]
    fn truncated_value_rejected() {
        let mut encoded = sample().encode().unwrap();
        encoded.truncate(encoded.len() - 5);
        assert!(IdentityAnnouncement::decode(&encoded).is_none());
    }

    #[test]
    fn oversized_nickname_refuses_to_encode() {
        let announce =
            IdentityAnnouncement::new("x".repeat(300), vec![0x11; 32], vec![0x22; 32]);
        assert!(announce.encode().is_none());
    }

    #[test]
    fn empty_input_rejected() {
        assert!(IdentityAnnouncement::decode(&[]).is_none());
    }
}
