//! Reassembly of packets split across transport-sized fragments.
//!
//! A fragment payload is one marker byte followed by data. START also
//! carries the declared total size so the receiver can pre-size its buffer
//! and sanity-check the result. Buffers are keyed by the device the
//! fragments arrive over, so interleaved transfers from different links
//! never mix.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Fragment markers.
pub const MARKER_START: u8 = 0x01;
pub const MARKER_CONTINUE: u8 = 0x02;
pub const MARKER_END: u8 = 0x03;

/// Ceiling on concurrent in-progress reassemblies; the oldest buffer is
/// evicted beyond it.
const MAX_PENDING: usize = 64;

/// Buffers untouched this long are dropped by the periodic sweep.
const STALE_AFTER: Duration = Duration::from_secs(30);

struct PendingBuffer {
    declared_size: usize,
    data: Vec<u8>,
    last_update: Instant,
}

/// Per-device fragment reassembler.
pub struct FragmentManager {
    pending: Mutex<HashMap<String, PendingBuffer>>,
}

impl FragmentManager {
    pub fn new() -> Self {
        FragmentManager {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one fragment payload from `device`.
    ///
    /// Returns the fully reassembled bytes when this fragment was the END
    /// marker, `None` otherwise (including malformed input, which is
    /// dropped).
    pub fn ingest(&self, device: &str, payload: &[u8]) -> Option<Vec<u8>> {
        let (&marker, rest) = payload.split_first()?;
        match marker {
            MARKER_START => {
                if rest.len() < 4 {
                    warn!(device, "start fragment too short");
                    return None;
                }
                let declared_size =
                    u32::from_be_bytes(rest[..4].try_into().ok()?) as usize;
                let mut data = Vec::with_capacity(declared_size.min(1 << 20));
                data.extend_from_slice(&rest[4..]);
                let mut pending = self.pending.lock();
                if pending.len() >= MAX_PENDING && !pending.contains_key(device) {
                    evict_oldest(&mut pending);
                }
                pending.insert(
                    device.to_string(),
                    PendingBuffer {
                        declared_size,
                        data,
                        last_update: Instant::now(),
                    },
                );
                None
            }
            MARKER_CONTINUE => {
                let mut pending = self.pending.lock();
                match pending.get_mut(device) {
                    Some(buffer) => {
                        buffer.data.extend_from_slice(rest);
                        buffer.last_update = Instant::now();
                    }
                    None => debug!(device, "continuation without a start fragment"),
                }
                None
            }
            MARKER_END => {
                let buffer = self.pending.lock().remove(device)?;
                let mut data = buffer.data;
                data.extend_from_slice(rest);
                if data.len() != buffer.declared_size {
                    // Deliver anyway; the inner decode is the arbiter.
                    warn!(
                        device,
                        declared = buffer.declared_size,
                        received = data.len(),
                        "fragment size mismatch"
                    );
                }
                Some(data)
            }
            other => {
                warn!(device, marker = other, "unknown fragment marker");
                None
            }
        }
    }

    /// Split `data` into marked fragment payloads of at most
    /// `chunk_size` data bytes each.
    pub fn split(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
        let chunk_size = chunk_size.max(1);
        let mut out = Vec::new();
        let total = (data.len() as u32).to_be_bytes();

        let first_len = data.len().min(chunk_size);
        let mut first = Vec::with_capacity(5 + first_len);
        first.push(MARKER_START);
        first.extend_from_slice(&total);
        first.extend_from_slice(&data[..first_len]);
        out.push(first);

        let mut offset = first_len;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            let marker = if end == data.len() {
                MARKER_END
            } else {
                MARKER_CONTINUE
            };
            let mut chunk = Vec::with_capacity(1 + end - offset);
            chunk.push(marker);
            chunk.extend_from_slice(&data[offset..end]);
            out.push(chunk);
            offset = end;
        }

        // A single chunk still needs a terminating END.
        if out.len() == 1 {
            out.push(vec![MARKER_END]);
        }
        out
    }

    /// Drop buffers not touched within the staleness window.
    pub fn expire_stale(&self) {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, buffer| buffer.last_update.elapsed() < STALE_AFTER);
        let dropped = before - pending.len();
        if dropped > 0 {
            debug!(dropped, "expired stale fragment buffers");
        }
    }

    /// Drop everything (service shutdown).
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

fn evict_oldest(pending: &mut HashMap<String, PendingBuffer>) {
    let oldest = pending
        .iter()
        .min_by_key(|(_, buffer)| buffer.last_update)
        .map(|(device, _)| device.clone());
    if let Some(device) = oldest {
        warn!(device = %device, "evicting oldest fragment buffer");
        pending.remove(&device);
    }
}

impl Default for FragmentManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_then_reassemble() {
        let manager = FragmentManager::new();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let fragments = FragmentManager::split(&data, 300);
        assert_eq!(fragments[0][0], MARKER_START);
        assert_eq!(fragments.last().unwrap()[0], MARKER_END);

        let mut result = None;
        for fragment in &fragments {
            result = manager.ingest("dev-a", fragment);
        }
        assert_eq!(result.unwrap(), data);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn small_payload_is_start_plus_end() {
        let fragments = FragmentManager::split(b"tiny", 300);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1], vec![MARKER_END]);

        let manager = FragmentManager::new();
        assert!(manager.ingest("d", &fragments[0]).is_none());
        assert_eq!(manager.ingest("d", &fragments[1]).unwrap(), b"tiny");
    }

    #[test]
    fn interleaved_devices_stay_separate() {
        let manager = FragmentManager::new();
        let a = vec![0xAA; 500];
        let b = vec![0xBB; 400];
        let fa = FragmentManager::split(&a, 200);
        let fb = FragmentManager::split(&b, 200);

        let mut ra = None;
        let mut rb = None;
        for i in 0..fa.len().max(fb.len()) {
            if let Some(f) = fa.get(i) {
                ra = manager.ingest("dev-a", f).or(ra);
            }
            if let Some(f) = fb.get(i) {
                rb = manager.ingest("dev-b", f).or(rb);
            }
        }
        assert_eq!(ra.unwrap(), a);
        assert_eq!(rb.unwrap(), b);
    }

    #[test]
    fn size_mismatch_still_delivers() {
        let manager = FragmentManager::new();
        let mut start = vec![MARKER_START];
        start.extend_from_slice(&100u32.to_be_bytes());
        start.extend_from_slice(&[1, 2, 3]);
        assert!(manager.ingest("d", &start).is_none());
        let result = manager.ingest("d", &[MARKER_END, 4, 5]).unwrap();
        assert_eq!(result, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn continuation_without_start_dropped() {
        let manager = FragmentManager::new();
        assert!(manager.ingest("d", &[MARKER_CONTINUE, 1, 2]).is_none());
        assert!(manager.ingest("d", &[MARKER_END, 3]).is_none());
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn unknown_marker_dropped() {
        let manager = FragmentManager::new();
        assert!(manager.ingest("d", &[0x7F, 1, 2]).is_none());
        assert!(manager.ingest("d", &[]).is_none());
    }

    #[test]
    fn pending_cap_evicts_oldest() {
        let manager = FragmentManager::new();
        for i in 0..MAX_PENDING {
            let mut start = vec![MARKER_START];
            start.extend_from_slice(&10u32.to_be_bytes());
            start.push(i as u8);
            manager.ingest(&format!("dev-{i}"), &start);
            if i == 0 {
                // Keep dev-0 strictly oldest on coarse clocks.
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        assert_eq!(manager.pending_count(), MAX_PENDING);

        let mut start = vec![MARKER_START];
        start.extend_from_slice(&10u32.to_be_bytes());
        manager.ingest("dev-overflow", &start);
        assert_eq!(manager.pending_count(), MAX_PENDING);
        // dev-0 was oldest; its transfer can no longer complete.
        assert!(manager.ingest("dev-0", &[MARKER_END]).is_none());
    }

    #[test]
    fn clear_drops_everything() {
        let manager = FragmentManager::new();
        let mut start = vec![MARKER_START];
        start.extend_from_slice(&4u32.to_be_bytes());
        manager.ingest("d", &start);
        manager.clear();
        assert_eq!(manager.pending_count(), 0);
    }
}
