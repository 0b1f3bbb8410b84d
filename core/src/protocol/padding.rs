// Traffic-analysis-resistant frame padding.
//
// Encoded frames are padded up to the next standard block size so an
// observer cannot distinguish packet types by length alone. Padding is
// PKCS7-style: every pad byte carries the pad length, which lets unpad
// validate the run before stripping it.

/// Standard block sizes frames are padded up to.
const BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];

/// Headroom reserved so a frame near a block boundary still pads.
const PAD_HEADROOM: usize = 16;

/// Pick the block size a frame of `data_size` bytes should be padded to.
///
/// Returns `data_size` unchanged when the frame is larger than every
/// standard block (such frames go out unpadded).
pub fn optimal_block_size(data_size: usize) -> usize {
    let total = data_size + PAD_HEADROOM;
    for block in BLOCK_SIZES {
        if total <= block {
            return block;
        }
    }
    data_size
}

/// Pad `data` up to `target_size` bytes.
///
/// No-op when the data already meets the target or when the pad run would
/// not fit in a single byte (PKCS7 caps the run at 255).
pub fn pad(data: &[u8], target_size: usize) -> Vec<u8> {
    if data.len() >= target_size {
        return data.to_vec();
    }
    let padding = target_size - data.len();
    if padding > 255 {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(target_size);
    out.extend_from_slice(data);
    out.resize(target_size, padding as u8);
    out
}

/// Strip a trailing pad run if, and only if, one is actually present.
///
/// All bytes of the candidate run must equal the pad length; anything else
/// means the input was never padded and is returned unchanged.
pub fn unpad(data: &[u8]) -> &[u8] {
    let Some(&last) = data.last() else {
        return data;
    };
    let pad_len = last as usize;
    if pad_len == 0 || pad_len > data.len() {
        return data;
    }
    let start = data.len() - pad_len;
    if data[start..].iter().all(|&b| b == last) {
        &data[..start]
    } else {
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_then_unpad_roundtrip() {
        for len in [0usize, 1, 100, 240, 255, 256, 511, 2000] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let target = optimal_block_size(data.len());
            let padded = pad(&data, target);
            assert_eq!(unpad(&padded), &data[..], "len={}", len);
        }
    }

    #[test]
    fn pads_to_standard_blocks() {
        assert_eq!(optimal_block_size(100), 256);
        assert_eq!(optimal_block_size(240), 256);
        // 241 + 16 headroom spills into the next block
        assert_eq!(optimal_block_size(241), 512);
        assert_eq!(optimal_block_size(1000), 1024);
        assert_eq!(optimal_block_size(2032), 2048);
        // Past the largest block the frame goes out unpadded.
        assert_eq!(optimal_block_size(2033), 2033);
        assert_eq!(optimal_block_size(5000), 5000);
    }

    #[test]
    fn unpad_leaves_unpadded_data_alone() {
        // Ends in 0x03 but the preceding bytes break the run.
        let data = [0x10u8, 0x20, 0x03];
        assert_eq!(unpad(&data), &data[..]);
        // A zero final byte never encodes padding.
        let data = [0x10u8, 0x00];
        assert_eq!(unpad(&data), &data[..]);
        let empty: [u8; 0] = [];
        assert_eq!(unpad(&empty), &empty[..]);
    }

    #[test]
    fn oversized_frames_stay_unpadded() {
        let data = vec![0xAAu8; 3000];
        let target = optimal_block_size(data.len());
        assert_eq!(target, data.len());
        assert_eq!(pad(&data, target), data);
    }
}
