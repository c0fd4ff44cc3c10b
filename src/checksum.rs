//! Centralized hashing utilities for PAR3 operations
//!
//! All CRC-64 and BLAKE3 hashing goes through this module to avoid
//! duplication and keep behavior consistent.
//!
//! ## Design Philosophy
//!
//! - **Thin wrappers**: hot functions are `#[inline]` with zero overhead
//! - **Domain types**: return `Crc64Value` and `Hash128` for type safety
//! - **Sliding window**: the slide-scan needs a windowed CRC-64 whose shift
//!   tables depend on the block size, so the tables are built per scan

use crate::domain::{Crc64Value, Hash128};

// ============================================================================
// CRC-64 (XZ polynomial, reflected, init/xorout = !0)
// ============================================================================

const CRC64_POLY_REFLECTED: u64 = 0xC96C_5795_D787_0F42;

const fn build_crc64_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC64_POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC64_TABLE: [u64; 256] = build_crc64_table();

/// Compute the CRC-64 of a byte slice in one shot.
#[inline]
pub fn crc64(data: &[u8]) -> Crc64Value {
    let mut crc = !0u64;
    for &byte in data {
        crc = (crc >> 8) ^ CRC64_TABLE[((crc ^ byte as u64) & 0xFF) as usize];
    }
    Crc64Value::new(!crc)
}

/// Compute the CRC-64 of `data` as if zero-padded to `padded_len` bytes.
///
/// Tail slices are checksummed over their real bytes, but full blocks that
/// end a file are hashed with zero padding up to the block size.
pub fn crc64_padded(data: &[u8], padded_len: usize) -> Crc64Value {
    let mut crc = !0u64;
    for &byte in data {
        crc = (crc >> 8) ^ CRC64_TABLE[((crc ^ byte as u64) & 0xFF) as usize];
    }
    for _ in data.len()..padded_len {
        crc = (crc >> 8) ^ CRC64_TABLE[(crc & 0xFF) as usize];
    }
    Crc64Value::new(!crc)
}

/// Sliding-window CRC-64 over a fixed window length.
///
/// `slide` removes the oldest byte and appends a new one in O(1), so a
/// damaged file can be scanned for surviving blocks at every byte offset.
/// The shift table folds the effect of a byte aged by `window` positions;
/// the mask compensates for the `!0` initial value travelling through the
/// window, so callers work with presented CRC values throughout.
pub struct CrcWindow {
    window: u64,
    shift_table: [u64; 256],
    mask: u64,
}

impl CrcWindow {
    pub fn new(window: u64) -> Self {
        let mut shift_table = [0u64; 256];
        for (value, entry) in shift_table.iter_mut().enumerate() {
            let mut crc = CRC64_TABLE[value];
            for _ in 0..window {
                crc = (crc >> 8) ^ CRC64_TABLE[(crc & 0xFF) as usize];
            }
            *entry = crc;
        }

        let mut mask = !0u64;
        for _ in 0..window {
            mask = (mask >> 8) ^ CRC64_TABLE[(mask & 0xFF) as usize];
        }
        mask ^= !0u64;

        CrcWindow {
            window,
            shift_table,
            mask,
        }
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    /// CRC of the window after dropping `outgoing` and appending `incoming`.
    #[inline]
    pub fn slide(&self, crc: Crc64Value, incoming: u8, outgoing: u8) -> Crc64Value {
        let crc = crc.as_u64() ^ self.mask;
        let crc = (crc >> 8)
            ^ CRC64_TABLE[((crc ^ incoming as u64) & 0xFF) as usize]
            ^ self.shift_table[outgoing as usize];
        Crc64Value::new(crc ^ self.mask)
    }
}

// ============================================================================
// BLAKE3 truncations
// ============================================================================

/// 16-byte fingerprint of a byte slice.
#[inline]
pub fn blake3_128(data: &[u8]) -> Hash128 {
    let hash = blake3::hash(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash.as_bytes()[..16]);
    Hash128::new(out)
}

/// 8-byte truncation, used for the Set-ID and the per-set random.
#[inline]
pub fn blake3_64(data: &[u8]) -> [u8; 8] {
    let hash = blake3::hash(data);
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash.as_bytes()[..8]);
    out
}

/// Incremental fingerprint over multiple slices of input.
pub struct Fingerprint {
    hasher: blake3::Hasher,
}

impl Fingerprint {
    pub fn new() -> Self {
        Fingerprint {
            hasher: blake3::Hasher::new(),
        }
    }

    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize_128(&self) -> Hash128 {
        let hash = self.hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&hash.as_bytes()[..16]);
        Hash128::new(out)
    }

    pub fn finalize_64(&self) -> [u8; 8] {
        let hash = self.hasher.finalize();
        let mut out = [0u8; 8];
        out.copy_from_slice(&hash.as_bytes()[..8]);
        out
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute CRC-64 and fingerprint of a block in one pass.
#[inline]
pub fn block_checksums(data: &[u8]) -> (Crc64Value, Hash128) {
    (crc64(data), blake3_128(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc64_known_vector() {
        // CRC-64/XZ check value for "123456789"
        assert_eq!(crc64(b"123456789").as_u64(), 0x995D_C9BB_DF19_39FA);
    }

    #[test]
    fn crc64_of_empty_is_zero() {
        assert_eq!(crc64(b"").as_u64(), 0);
    }

    #[test]
    fn padded_crc_matches_explicit_padding() {
        let data = b"tail bytes";
        let mut padded = data.to_vec();
        padded.resize(64, 0);
        assert_eq!(crc64_padded(data, 64), crc64(&padded));
    }

    #[test]
    fn window_slide_matches_direct_computation() {
        let data: Vec<u8> = (0u16..512).map(|i| (i * 7 + 3) as u8).collect();
        let window = 64u64;
        let slider = CrcWindow::new(window);

        let mut crc = crc64(&data[..window as usize]);
        for start in 1..(data.len() - window as usize) {
            crc = slider.slide(crc, data[start + window as usize - 1], data[start - 1]);
            assert_eq!(
                crc,
                crc64(&data[start..start + window as usize]),
                "slide diverged at offset {start}"
            );
        }
    }

    #[test]
    fn fingerprint_incremental_equals_one_shot() {
        let mut fp = Fingerprint::new();
        fp.update(b"hello ");
        fp.update(b"world");
        assert_eq!(fp.finalize_128(), blake3_128(b"hello world"));
    }

    #[test]
    fn blake3_64_is_prefix_of_128() {
        let h128 = blake3_128(b"prefix check");
        let h64 = blake3_64(b"prefix check");
        assert_eq!(&h128.as_bytes()[..8], &h64);
    }
}
