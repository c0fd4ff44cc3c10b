//! Recovery-code engines
//!
//! Two code families produce and consume recovery blocks:
//!
//! - [`cauchy`]: Reed-Solomon with a Cauchy matrix, for modest block counts
//! - [`fft`]: an additive-FFT Reed-Solomon code for large sets, with
//!   optional cohort interleaving handled by the caller
//!
//! The Galois field is chosen here, once, from the block geometry; the
//! codecs never branch on field width afterwards.

pub mod cauchy;
pub mod fft;

use thiserror::Error;

/// Errors raised while building or running a recovery codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("too many blocks for the Galois field: {0} needed")]
    TooManyBlocks(u64),

    #[error("not enough recovery blocks: {missing} lost, {available} available")]
    NotEnoughRecovery { missing: usize, available: usize },

    #[error("recovery matrix is singular at column {0}")]
    SingularMatrix(usize),

    #[error("unsupported Galois field size {0}")]
    UnsupportedField(u8),

    #[error("region length mismatch")]
    RegionMismatch,
}

/// Which error-correction code a set uses. The discriminants match the
/// CLI's `-e` selector and the bits the original format stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccMethod {
    Cauchy = 1,
    Fft = 8,
}

/// A Galois field selection recorded in the Start Packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldChoice {
    /// Bytes per element: 1 or 2.
    pub gf_size: u8,
    /// Full generator polynomial including the top bit.
    pub polynomial: u32,
}

pub const GF8_CAUCHY: FieldChoice = FieldChoice {
    gf_size: 1,
    polynomial: 0x11D,
};
pub const GF16_CAUCHY: FieldChoice = FieldChoice {
    gf_size: 2,
    polynomial: 0x1100B,
};
pub const GF8_FFT: FieldChoice = FieldChoice {
    gf_size: 1,
    polynomial: 0x11D,
};
pub const GF16_FFT: FieldChoice = FieldChoice {
    gf_size: 2,
    polynomial: 0x1002D,
};

pub(crate) fn next_pow2(x: u64) -> u64 {
    x.next_power_of_two()
}

fn per_cohort(count: u64, cohorts: u32) -> u64 {
    count.div_ceil(cohorts as u64)
}

/// Pick the field for a set's geometry.
///
/// Cauchy stays in GF(2^8) while every input and recovery element fits in
/// 256 field values; the FFT code stays in GF(2^8) while the padded
/// transform length fits. Everything else runs in the 16-bit field.
pub fn select_field(
    ecc: EccMethod,
    block_count: u64,
    first_recovery: u64,
    recovery_count: u64,
    max_recovery: u64,
    cohorts: u32,
) -> Result<FieldChoice, CodecError> {
    let max_recovery = max_recovery.max(first_recovery + recovery_count);
    match ecc {
        EccMethod::Cauchy => {
            if block_count <= 128
                && block_count + first_recovery + recovery_count <= 256
                && block_count + max_recovery <= 256
            {
                Ok(GF8_CAUCHY)
            } else if block_count + max_recovery <= 65536 {
                Ok(GF16_CAUCHY)
            } else {
                Err(CodecError::TooManyBlocks(block_count + max_recovery))
            }
        }
        EccMethod::Fft => {
            let m = next_pow2(per_cohort(max_recovery, cohorts));
            let n = next_pow2(m + per_cohort(block_count, cohorts));
            if per_cohort(max_recovery, cohorts) > fft::MAX_RECOVERY_COUNT {
                Err(CodecError::TooManyBlocks(max_recovery))
            } else if n <= 256 {
                Ok(GF8_FFT)
            } else if n <= 65536 {
                Ok(GF16_FFT)
            } else {
                Err(CodecError::TooManyBlocks(block_count + max_recovery))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cauchy_switches_field_at_129_blocks() {
        // 129 inputs with no recovery bound still fit the 16-bit field
        let f = select_field(EccMethod::Cauchy, 129, 0, 0, 0, 1).unwrap();
        assert_eq!(f, GF16_CAUCHY);

        let f = select_field(EccMethod::Cauchy, 128, 0, 100, 0, 1).unwrap();
        assert_eq!(f, GF8_CAUCHY);

        // 129 + 200 > 256 forces the 16-bit field
        let f = select_field(EccMethod::Cauchy, 129, 0, 0, 200, 1).unwrap();
        assert_eq!(f, GF16_CAUCHY);
    }

    #[test]
    fn cauchy_rejects_oversized_sets() {
        assert!(select_field(EccMethod::Cauchy, 65000, 0, 1000, 0, 1).is_err());
    }

    #[test]
    fn fft_uses_padded_lengths() {
        // next_pow2(4) + next_pow2(100) = 4 + 128 -> padded to 256, fits 8-bit
        let f = select_field(EccMethod::Fft, 100, 0, 4, 0, 1).unwrap();
        assert_eq!(f, GF8_FFT);

        let f = select_field(EccMethod::Fft, 1000, 0, 100, 0, 1).unwrap();
        assert_eq!(f, GF16_FFT);
    }

    #[test]
    fn fft_interleave_divides_the_geometry() {
        // 600 recovery over 3 cohorts is 200 per cohort; with 150 inputs
        // per cohort the padded length stays within the 16-bit field.
        let f = select_field(EccMethod::Fft, 450, 0, 600, 0, 3).unwrap();
        assert_eq!(f, GF16_FFT);
    }
}
