// Sliding-window replay protection for explicit transport nonces.
//
// Each inbound ciphertext carries its nonce, so packets may arrive out of
// order. The window tracks the highest nonce accepted plus a bitmap of the
// 1024 nonces below it. A nonce is admitted when it is newer than anything
// seen, or when it falls inside the window and its bit is clear. Callers
// check first and mark only after the ciphertext authenticates, so a
// forged nonce cannot poison the window.

/// Width of the out-of-order acceptance window, in nonces.
const WINDOW_BITS: u64 = 1024;

const BITMAP_WORDS: usize = (WINDOW_BITS / 64) as usize;

/// Receive-side nonce window.
pub struct NonceWindow {
    highest: Option<u64>,
    bitmap: [u64; BITMAP_WORDS],
}

impl NonceWindow {
    pub fn new() -> Self {
        NonceWindow {
            highest: None,
            bitmap: [0; BITMAP_WORDS],
        }
    }

    /// Whether `nonce` would be accepted right now.
    pub fn check(&self, nonce: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if nonce > highest {
            return true;
        }
        let age = highest - nonce;
        if age >= WINDOW_BITS {
            return false;
        }
        !self.bit(age)
    }

    /// Record `nonce` as seen. Call only after the ciphertext at this nonce
    /// has authenticated.
    pub fn mark(&mut self, nonce: u64) {
        match self.highest {
            None => {
                self.highest = Some(nonce);
                self.bitmap = [0; BITMAP_WORDS];
                self.set_bit(0);
            }
            Some(highest) if nonce > highest => {
                self.slide(nonce - highest);
                self.highest = Some(nonce);
                self.set_bit(0);
            }
            Some(highest) => {
                let age = highest - nonce;
                if age < WINDOW_BITS {
                    self.set_bit(age);
                }
            }
        }
    }

    fn bit(&self, age: u64) -> bool {
        let word = (age / 64) as usize;
        let offset = age % 64;
        self.bitmap[word] & (1u64 << offset) != 0
    }

    fn set_bit(&mut self, age: u64) {
        let word = (age / 64) as usize;
        let offset = age % 64;
        self.bitmap[word] |= 1u64 << offset;
    }

    /// Shift the bitmap toward older ages by `distance` nonces.
    fn slide(&mut self, distance: u64) {
        if distance >= WINDOW_BITS {
            self.bitmap = [0; BITMAP_WORDS];
            return;
        }
        let word_shift = (distance / 64) as usize;
        let bit_shift = distance % 64;
        let mut next = [0u64; BITMAP_WORDS];
        for i in (0..BITMAP_WORDS).rev() {
            let src = i.checked_sub(word_shift);
            let mut value = match src {
                Some(s) => self.bitmap[s] << bit_shift,
                None => 0,
            };
            if bit_shift > 0 {
                if let Some(s) = src.and_then(|s| s.checked_sub(1)) {
                    value |= self.bitmap[s] >> (64 - bit_shift);
                }
            }
            next[i] = value;
        }
        self.bitmap = next;
    }
}

impl Default for NonceWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Prepend the 4-byte big-endian nonce a transport ciphertext travels with.
pub fn prepend_nonce(nonce: u32, ciphertext: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + ciphertext.len());
    out.extend_from_slice(&nonce.to_be_bytes());
    out.extend_from_slice(&ciphertext);
    out
}

/// Split a wire transport message into its nonce and ciphertext.
pub fn split_nonce(data: &[u8]) -> Option<(u32, &[u8])> {
    if data.len() < 4 {
        return None;
    }
    let nonce = u32::from_be_bytes(data[..4].try_into().ok()?);
    Some((nonce, &data[4..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_window_accepts_anything() {
        let window = NonceWindow::new();
        assert!(window.check(0));
        assert!(window.check(u64::MAX));
    }

    #[test]
    fn duplicate_rejected() {
        let mut window = NonceWindow::new();
        window.mark(5);
        assert!(!window.check(5));
        assert!(window.check(6));
        assert!(window.check(4));
    }

    #[test]
    fn out_of_order_within_window_accepted_once() {
        let mut window = NonceWindow::new();
        window.mark(100);
        assert!(window.check(50));
        window.mark(50);
        assert!(!window.check(50));
        assert!(window.check(51));
    }

    #[test]
    fn too_old_rejected() {
        let mut window = NonceWindow::new();
        window.mark(5000);
        assert!(window.check(5000 - 1023));
        assert!(!window.check(5000 - 1024));
        assert!(!window.check(0));
    }

    #[test]
    fn sliding_preserves_seen_bits() {
        let mut window = NonceWindow::new();
        window.mark(10);
        window.mark(12);
        // Slide forward; 10 and 12 stay marked, 11 stays open.
        window.mark(500);
        assert!(!window.check(10));
        assert!(window.check(11));
        assert!(!window.check(12));
        assert!(!window.check(500));
    }

    #[test]
    fn large_jump_clears_window() {
        let mut window = NonceWindow::new();
        window.mark(3);
        window.mark(3 + WINDOW_BITS + 10);
        // Everything below the new window is too old regardless of bits.
        assert!(!window.check(3));
    }

    #[test]
    fn nonce_prefix_roundtrip() {
        let framed = prepend_nonce(0xA1B2C3D4, vec![9, 8, 7]);
        let (nonce, ct) = split_nonce(&framed).unwrap();
        assert_eq!(nonce, 0xA1B2C3D4);
        assert_eq!(ct, &[9, 8, 7]);
        assert!(split_nonce(&[1, 2]).is_none());
    }
}
