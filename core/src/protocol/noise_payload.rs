// Inner payload envelope for Noise-encrypted packets.
//
// Once a transport ciphertext is decrypted, the plaintext starts with a
// single type byte that says what the rest is: a private message, a
// delivery acknowledgement, a read receipt, or a file transfer. Private
// messages use the same 1-byte TLV scheme as announcements.

/// Discriminant carried as the first plaintext byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NoisePayloadType {
    PrivateMessage = 0x01,
    ReadReceipt = 0x02,
    Delivered = 0x03,
    FileTransfer = 0x20,
}

impl NoisePayloadType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(NoisePayloadType::PrivateMessage),
            0x02 => Some(NoisePayloadType::ReadReceipt),
            0x03 => Some(NoisePayloadType::Delivered),
            0x20 => Some(NoisePayloadType::FileTransfer),
            _ => None,
        }
    }
}

/// A typed plaintext ready for encryption, or freshly decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoisePayload {
    pub payload_type: NoisePayloadType,
    pub data: Vec<u8>,
}

impl NoisePayload {
    pub fn new(payload_type: NoisePayloadType, data: Vec<u8>) -> Self {
        NoisePayload { payload_type, data }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(self.payload_type as u8);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let (&first, rest) = data.split_first()?;
        Some(NoisePayload {
            payload_type: NoisePayloadType::from_u8(first)?,
            data: rest.to_vec(),
        })
    }
}

const TLV_MESSAGE_ID: u8 = 0x00;
const TLV_CONTENT: u8 = 0x01;

const MAX_TLV_VALUE: usize = 255;

/// A direct message exchanged inside an established Noise session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    pub message_id: String,
    pub content: String,
}

impl PrivateMessage {
    pub fn new(message_id: String, content: String) -> Self {
        PrivateMessage {
            message_id,
            content,
        }
    }

    /// Encode to TLV bytes; `None` if either field exceeds the 1-byte TLV
    /// length limit.
    pub fn encode(&self) -> Option<Vec<u8>> {
        let id = self.message_id.as_bytes();
        let content = self.content.as_bytes();
        if id.len() > MAX_TLV_VALUE || content.len() > MAX_TLV_VALUE {
            return None;
        }
        let mut out = Vec::with_capacity(4 + id.len() + content.len());
        out.push(TLV_MESSAGE_ID);
        out.push(id.len() as u8);
        out.extend_from_slice(id);
        out.push(TLV_CONTENT);
        out.push(content.len() as u8);
        out.extend_from_slice(content);
        Some(out)
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut message_id = None;
        let mut content = None;

        let mut offset = 0;
        while offset + 2 <= data.len() {
            let tlv_type = data[offset];
            let len = data[offset + 1] as usize;
            offset += 2;
            let value = data.get(offset..offset + len)?;
            offset += len;

            match tlv_type {
                TLV_MESSAGE_ID => message_id = Some(String::from_utf8(value.to_vec()).ok()?),
                TLV_CONTENT => content = Some(String::from_utf8(value.to_vec()).ok()?),
                _ => {}
            }
        }

        Some(PrivateMessage {
            message_id: message_id?,
            content: content?,
        })
    }
}
