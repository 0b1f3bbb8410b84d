// MTU-bound frame chunking.
//
// Link layers cap a single write well below a padded packet frame, so
// frames are cut into MTU-sized chunks before sending. Each chunk opens
// with a marker byte; the first also carries the 4-byte big-endian total
// frame length. This is link plumbing only — protocol-level fragmentation
// of oversized packets is a separate concern.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::warn;

/// Default chunk budget, sized for a conservative BLE write.
pub const DEFAULT_MTU: usize = 500;

const CHUNK_FIRST: u8 = 0x01;
const CHUNK_MIDDLE: u8 = 0x02;
const CHUNK_LAST: u8 = 0x03;

/// Cut `frame` into chunks of at most `mtu` bytes each (header included).
pub fn split_frame(frame: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    // A first chunk needs 5 header bytes, later chunks 1.
    let mtu = mtu.max(8);
    let first_budget = mtu - 5;
    let rest_budget = mtu - 1;

    let total = (frame.len() as u32).to_be_bytes();
    let first_len = frame.len().min(first_budget);
    let mut first = Vec::with_capacity(5 + first_len);
    first.push(CHUNK_FIRST);
    first.extend_from_slice(&total);
    first.extend_from_slice(&frame[..first_len]);

    let mut out = vec![first];
    let mut offset = first_len;
    while offset < frame.len() {
        let end = (offset + rest_budget).min(frame.len());
        let marker = if end == frame.len() {
            CHUNK_LAST
        } else {
            CHUNK_MIDDLE
        };
        let mut chunk = Vec::with_capacity(1 + end - offset);
        chunk.push(marker);
        chunk.extend_from_slice(&frame[offset..end]);
        out.push(chunk);
        offset = end;
    }
    if out.len() == 1 {
        out.push(vec![CHUNK_LAST]);
    }
    out
}

struct PartialFrame {
    expected: usize,
    data: Vec<u8>,
}

/// Per-device reassembly of chunked frames.
pub struct ChunkReassembler {
    partial: Mutex<HashMap<String, PartialFrame>>,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        ChunkReassembler {
            partial: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one received chunk; returns the whole frame once complete.
    pub fn feed(&self, device: &str, chunk: &[u8]) -> Option<Vec<u8>> {
        let (&marker, rest) = chunk.split_first()?;
        let mut partial = self.partial.lock();
        match marker {
            CHUNK_FIRST => {
                if rest.len() < 4 {
                    warn!(device, "chunk header truncated");
                    return None;
                }
                let expected = u32::from_be_bytes(rest[..4].try_into().ok()?) as usize;
                partial.insert(
                    device.to_string(),
                    PartialFrame {
                        expected,
                        data: rest[4..].to_vec(),
                    },
                );
                None
            }
            CHUNK_MIDDLE => {
                if let Some(frame) = partial.get_mut(device) {
                    frame.data.extend_from_slice(rest);
                }
                None
            }
            CHUNK_LAST => {
                let mut frame = partial.remove(device)?;
                frame.data.extend_from_slice(rest);
                if frame.data.len() != frame.expected {
                    warn!(
                        device,
                        expected = frame.expected,
                        received = frame.data.len(),
                        "chunked frame length mismatch"
                    );
                    return None;
                }
                Some(frame.data)
            }
            _ => {
                warn!(device, marker, "unknown chunk marker");
                None
            }
        }
    }

    /// Forget any partial frame from `device` (link dropped).
    pub fn reset_device(&self, device: &str) {
        self.partial.lock().remove(device);
    }
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new()
    }
}
