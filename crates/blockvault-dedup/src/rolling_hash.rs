//! Fixed-window polynomial rolling hash used to find chunk boundaries

use std::collections::VecDeque;

/// Polynomial base.
const PRIME: u32 = 31;

/// Rolling hash over the last `window_size` bytes.
///
/// `hash = sum(b_i * 31^(n-1-i))` over the window, in wrapping `u32`
/// arithmetic. Pure function of the window contents; no I/O.
#[derive(Debug, Clone)]
pub struct RollingHash {
    window_size: usize,
    window: VecDeque<u8>,
    hash: u32,
    out_weight: u32,
}

impl RollingHash {
    /// Create a rolling hash with the given window size (must be at least 1).
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            window: VecDeque::with_capacity(window_size),
            hash: 0,
            out_weight: wrapping_pow(PRIME, window_size - 1),
        }
    }

    /// Push a byte, evicting the oldest one once the window is full.
    /// Returns the updated hash.
    #[inline]
    pub fn update(&mut self, byte: u8) -> u32 {
        if self.window.len() >= self.window_size {
            if let Some(old) = self.window.pop_front() {
                self.hash = self
                    .hash
                    .wrapping_sub((old as u32).wrapping_mul(self.out_weight));
            }
        }
        self.window.push_back(byte);
        self.hash = self.hash.wrapping_mul(PRIME).wrapping_add(byte as u32);
        self.hash
    }

    /// Clear the window and hash. Called at the start of every chunk.
    pub fn reset(&mut self) {
        self.window.clear();
        self.hash = 0;
    }

    /// Current hash value
    pub fn value(&self) -> u32 {
        self.hash
    }

    /// Configured window size
    pub fn window_size(&self) -> usize {
        self.window_size
    }
}

/// `base^exp` in wrapping `u32` arithmetic, so eviction cancels exactly.
fn wrapping_pow(mut base: u32, mut exp: usize) -> u32 {
    let mut result: u32 = 1;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hash_of(bytes: &[u8], window: usize) -> u32 {
        let mut h = RollingHash::new(window);
        let mut v = 0;
        for &b in bytes {
            v = h.update(b);
        }
        v
    }

    #[test]
    fn test_wrapping_pow() {
        assert_eq!(wrapping_pow(31, 0), 1);
        assert_eq!(wrapping_pow(31, 2), 961);
        assert_eq!(wrapping_pow(2, 32), 0);
        assert_eq!(wrapping_pow(31, 47), 31u32.wrapping_pow(47));
    }

    #[test]
    fn test_partial_window_is_plain_polynomial() {
        // 1*31^2 + 2*31 + 3
        assert_eq!(hash_of(&[1, 2, 3], 48), 961 + 62 + 3);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut h = RollingHash::new(4);
        for b in b"hello world" {
            h.update(*b);
        }
        h.reset();
        assert_eq!(h.value(), 0);
        assert_eq!(h.update(7), 7);
    }

    #[test]
    fn test_zero_window_clamped() {
        let h = RollingHash::new(0);
        assert_eq!(h.window_size(), 1);
    }

    proptest! {
        #[test]
        fn test_prop_small_window_depends_only_on_window(
            prefix in prop::collection::vec(any::<u8>(), 0..64),
            tail in prop::collection::vec(any::<u8>(), 1..=1),
        ) {
            // With a window of one byte the weight is 31^0 = 1, so the hash
            // after each update equals the last byte.
            let mut data = prefix.clone();
            data.extend_from_slice(&tail);
            prop_assert_eq!(hash_of(&data, 1), tail[0] as u32);
        }

        #[test]
        fn test_prop_hash_is_function_of_window(
            prefix in prop::collection::vec(any::<u8>(), 0..256),
            window in prop::collection::vec(any::<u8>(), 48..=48),
        ) {
            let mut data = prefix.clone();
            data.extend_from_slice(&window);
            prop_assert_eq!(hash_of(&data, 48), hash_of(&window, 48));
        }

        #[test]
        fn test_prop_deterministic(data in prop::collection::vec(any::<u8>(), 0..2048)) {
            prop_assert_eq!(hash_of(&data, 48), hash_of(&data, 48));
        }
    }
}
