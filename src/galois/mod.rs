//! Galois-field arithmetic for the Cauchy Reed-Solomon engine
//!
//! Two fields are supported, selected once at codec construction:
//!
//! - GF(2^8), generator 0x11D, with a full 64 KiB multiplication table
//! - GF(2^16), generator 0x1100B, with log/ilog tables and per-coefficient
//!   4-bit half-tables for region multiplication (a full table would be
//!   256 KiB per coefficient)
//!
//! Region buffers carry 4 parity bytes at their tail holding the XOR of all
//! preceding 32-bit words. Because every region operation is GF(2)-linear,
//! the parity stays valid through arbitrary multiply-accumulate chains and
//! doubles as a self-check on the arithmetic after a decode.

pub mod gf16;
pub mod gf8;

pub use gf16::Gf16Table;
pub use gf8::Gf8Table;

/// Field capability set used by the Cauchy codec.
///
/// One instance is picked when the codec is constructed; nothing downstream
/// branches on the field width again.
pub trait GaloisField: Send + Sync {
    /// Number of elements in the field (256 or 65536).
    fn order(&self) -> u32;

    /// Bytes per field element (1 or 2).
    fn element_bytes(&self) -> usize;

    fn mul(&self, a: u16, b: u16) -> u16;

    fn div(&self, a: u16, b: u16) -> u16;

    fn reciprocal(&self, a: u16) -> u16;

    /// `dst ^= factor * src` over the whole region, parity bytes included.
    fn region_multiply_add(&self, factor: u16, src: &[u8], dst: &mut [u8]);
}

/// Construct the field instance for a Start-Packet `(gf_size, polynomial)`.
pub fn field_for(gf_size: u8, polynomial: u32) -> Option<Box<dyn GaloisField>> {
    match gf_size {
        1 => Some(Box::new(Gf8Table::new(polynomial))),
        2 => Some(Box::new(Gf16Table::new(polynomial))),
        _ => None,
    }
}

/// Region length for a Cauchy block: data plus 4 parity bytes, rounded up
/// to 4-byte alignment.
pub const fn cauchy_region_size(block_size: u64) -> u64 {
    (block_size + 4 + 3) & !3
}

/// Region length for an FFT block: data plus 4 parity bytes, rounded up to
/// the 64-byte alignment the FFT kernels require.
pub const fn fft_region_size(block_size: u64) -> u64 {
    (block_size + 4 + 63) & !63
}

/// Store the XOR of all leading 32-bit words into the last word.
///
/// The region length must be a multiple of 4.
pub fn region_create_parity(region: &mut [u8]) {
    debug_assert_eq!(region.len() % 4, 0);
    let split = region.len() - 4;
    let parity = region[..split]
        .chunks_exact(4)
        .fold(0u32, |acc, w| acc ^ u32::from_le_bytes(w.try_into().unwrap()));
    region[split..].copy_from_slice(&parity.to_le_bytes());
}

/// Verify the parity word. Returns `true` when the region is consistent.
pub fn region_check_parity(region: &[u8]) -> bool {
    debug_assert_eq!(region.len() % 4, 0);
    region
        .chunks_exact(4)
        .fold(0u32, |acc, w| acc ^ u32::from_le_bytes(w.try_into().unwrap()))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_sizes_are_aligned_and_cover_parity() {
        assert_eq!(cauchy_region_size(1024), 1028);
        assert_eq!(cauchy_region_size(1021), 1028);
        assert_eq!(fft_region_size(1024), 1088);
        assert_eq!(fft_region_size(60), 64);
        assert!(cauchy_region_size(999) >= 999 + 4);
    }

    #[test]
    fn parity_round_trip_and_detects_corruption() {
        let mut region = vec![0u8; 64];
        for (i, b) in region.iter_mut().enumerate() {
            *b = (i * 13 + 5) as u8;
        }
        region_create_parity(&mut region);
        assert!(region_check_parity(&region));

        region[10] ^= 0x40;
        assert!(!region_check_parity(&region));
    }

    #[test]
    fn parity_survives_multiply_accumulate() {
        // Parity is linear, so c*src accumulated into dst keeps dst's
        // parity valid when src's parity was valid.
        let gf = Gf16Table::new(0x1100B);
        let mut src = vec![0u8; 64];
        for (i, b) in src.iter_mut().enumerate() {
            *b = (i * 31 + 7) as u8;
        }
        region_create_parity(&mut src);

        let mut dst = vec![0u8; 64];
        region_create_parity(&mut dst);

        gf.region_multiply_add(0x1234, &src, &mut dst);
        assert!(region_check_parity(&dst));

        gf.region_multiply_add(0xBEEF, &src, &mut dst);
        assert!(region_check_parity(&dst));
    }
}
