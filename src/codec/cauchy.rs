//! Cauchy-matrix Reed-Solomon codec
//!
//! The recovery matrix is `M[r][j] = 1 / (x_r XOR y_j)` with input block `j`
//! mapped to field element `j` and recovery block `r` mapped to element
//! `block_count + r`. The two element sets never intersect, so every matrix
//! entry is well defined, and any square submatrix of a Cauchy matrix is
//! invertible, which is what makes every combination of surviving recovery
//! blocks usable.
//!
//! Encoding streams one input block at a time: each recovery region
//! accumulates `M[r][j] * input_j`, so only a single input buffer is alive.
//! Decoding inverts the submatrix for the lost inputs and streams known
//! inputs and recovery blocks through the combined coefficients the same
//! way.

use super::{CodecError, FieldChoice};
use crate::galois::{field_for, GaloisField};
use rayon::prelude::*;

/// Field-bound Cauchy codec for one set geometry.
pub struct CauchyCodec {
    gf: Box<dyn GaloisField>,
    block_count: u64,
}

impl CauchyCodec {
    pub fn new(choice: FieldChoice, block_count: u64) -> Result<Self, CodecError> {
        let gf = field_for(choice.gf_size, choice.polynomial)
            .ok_or(CodecError::UnsupportedField(choice.gf_size))?;
        if block_count >= gf.order() as u64 {
            return Err(CodecError::TooManyBlocks(block_count));
        }
        Ok(CauchyCodec { gf, block_count })
    }

    pub fn field(&self) -> &dyn GaloisField {
        self.gf.as_ref()
    }

    /// Matrix entry for (recovery block r, input block j).
    #[inline]
    pub fn factor(&self, recovery_index: u64, input_index: u64) -> u16 {
        debug_assert!(input_index < self.block_count);
        let x = self.block_count + recovery_index;
        debug_assert!(x < self.gf.order() as u64);
        self.gf.reciprocal((x ^ input_index) as u16)
    }

    /// Accumulate one input region into every recovery region.
    ///
    /// `recovery_regions` is a flat buffer of `recovery_ids.len()` regions of
    /// `region_size` bytes each. Rows are independent, so they run in
    /// parallel.
    pub fn encode_block(
        &self,
        input_index: u64,
        input_region: &[u8],
        recovery_ids: &[u64],
        recovery_regions: &mut [u8],
        region_size: usize,
    ) {
        debug_assert_eq!(recovery_regions.len(), recovery_ids.len() * region_size);
        recovery_regions
            .par_chunks_mut(region_size)
            .zip(recovery_ids.par_iter())
            .for_each(|(region, &recovery_index)| {
                let factor = self.factor(recovery_index, input_index);
                self.gf.region_multiply_add(factor, input_region, region);
            });
    }
}

/// Solver for one repair run: a fixed set of lost inputs and the recovery
/// blocks chosen to replace them.
pub struct CauchyDecoder<'a> {
    codec: &'a CauchyCodec,
    lost: Vec<u64>,
    recovery: Vec<u64>,
    /// Row-major inverse of the lost-columns submatrix.
    inverse: Vec<u16>,
}

impl<'a> std::fmt::Debug for CauchyDecoder<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CauchyDecoder")
            .field("lost", &self.lost)
            .field("recovery", &self.recovery)
            .finish()
    }
}

impl<'a> CauchyDecoder<'a> {
    /// Build the solver. `recovery` must name at least as many blocks as
    /// `lost`; only the first `lost.len()` are used.
    pub fn new(
        codec: &'a CauchyCodec,
        lost: Vec<u64>,
        recovery: Vec<u64>,
    ) -> Result<Self, CodecError> {
        if recovery.len() < lost.len() {
            return Err(CodecError::NotEnoughRecovery {
                missing: lost.len(),
                available: recovery.len(),
            });
        }
        let recovery = recovery[..lost.len()].to_vec();
        let n = lost.len();

        // Submatrix A[i][k] = M[recovery_i][lost_k]
        let mut matrix = vec![0u16; n * n];
        for i in 0..n {
            for k in 0..n {
                matrix[i * n + k] = codec.factor(recovery[i], lost[k]);
            }
        }
        let inverse = invert(codec.gf.as_ref(), matrix, n)?;

        Ok(CauchyDecoder {
            codec,
            lost,
            recovery,
            inverse,
        })
    }

    pub fn lost(&self) -> &[u64] {
        &self.lost
    }

    pub fn recovery_used(&self) -> &[u64] {
        &self.recovery
    }

    /// Combined coefficient applied to a known input block `j` when it is
    /// folded into lost slot `k`:
    /// `sum_i inverse[k][i] * M[recovery_i][j]`.
    fn input_coefficient(&self, slot: usize, input_index: u64) -> u16 {
        let n = self.lost.len();
        let gf = self.codec.gf.as_ref();
        let mut coeff = 0u16;
        for i in 0..n {
            let m = self.codec.factor(self.recovery[i], input_index);
            coeff ^= gf.mul(self.inverse[slot * n + i], m);
        }
        coeff
    }

    /// Fold one known input region into all lost-block regions.
    pub fn accumulate_input(
        &self,
        input_index: u64,
        region: &[u8],
        lost_regions: &mut [u8],
        region_size: usize,
    ) {
        let gf = self.codec.gf.as_ref();
        lost_regions
            .par_chunks_mut(region_size)
            .enumerate()
            .for_each(|(slot, out)| {
                let coeff = self.input_coefficient(slot, input_index);
                gf.region_multiply_add(coeff, region, out);
            });
    }

    /// Fold one of the selected recovery regions into all lost-block
    /// regions. `position` is the index into [`Self::recovery_used`].
    pub fn accumulate_recovery(
        &self,
        position: usize,
        region: &[u8],
        lost_regions: &mut [u8],
        region_size: usize,
    ) {
        let n = self.lost.len();
        let gf = self.codec.gf.as_ref();
        lost_regions
            .par_chunks_mut(region_size)
            .enumerate()
            .for_each(|(slot, out)| {
                let coeff = self.inverse[slot * n + position];
                gf.region_multiply_add(coeff, region, out);
            });
    }
}

/// Invert a square matrix over the field by Gauss-Jordan elimination on
/// `[A | I]`.
fn invert(gf: &dyn GaloisField, mut matrix: Vec<u16>, n: usize) -> Result<Vec<u16>, CodecError> {
    let mut inverse = vec![0u16; n * n];
    for i in 0..n {
        inverse[i * n + i] = 1;
    }

    for col in 0..n {
        // Find a pivot; a Cauchy submatrix is always invertible, but a bad
        // caller-supplied geometry surfaces here instead of corrupting data
        let pivot_row = (col..n)
            .find(|&r| matrix[r * n + col] != 0)
            .ok_or(CodecError::SingularMatrix(col))?;
        if pivot_row != col {
            for c in 0..n {
                matrix.swap(pivot_row * n + c, col * n + c);
                inverse.swap(pivot_row * n + c, col * n + c);
            }
        }

        let pivot = matrix[col * n + col];
        if pivot != 1 {
            let inv = gf.reciprocal(pivot);
            for c in 0..n {
                matrix[col * n + c] = gf.mul(matrix[col * n + c], inv);
                inverse[col * n + c] = gf.mul(inverse[col * n + c], inv);
            }
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = matrix[row * n + col];
            if factor == 0 {
                continue;
            }
            for c in 0..n {
                let m = gf.mul(matrix[col * n + c], factor);
                matrix[row * n + c] ^= m;
                let v = gf.mul(inverse[col * n + c], factor);
                inverse[row * n + c] ^= v;
            }
        }
    }

    Ok(inverse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{select_field, EccMethod};
    use crate::galois::{cauchy_region_size, region_check_parity, region_create_parity};

    fn make_regions(count: usize, region_size: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; count * region_size];
        let mut state = seed;
        for region in data.chunks_mut(region_size) {
            let data_len = region.len() - 4;
            for b in region[..data_len].iter_mut() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                *b = (state >> 33) as u8;
            }
            region_create_parity(region);
        }
        data
    }

    fn roundtrip(block_count: u64, recovery_count: u64, lose: &[u64]) {
        let choice = select_field(EccMethod::Cauchy, block_count, 0, recovery_count, 0, 1).unwrap();
        let codec = CauchyCodec::new(choice, block_count).unwrap();
        let region_size = cauchy_region_size(96) as usize;

        let inputs = make_regions(block_count as usize, region_size, 0xFEED);

        // Encode all recovery blocks
        let recovery_ids: Vec<u64> = (0..recovery_count).collect();
        let mut recovery = vec![0u8; recovery_count as usize * region_size];
        for j in 0..block_count {
            let region = &inputs[j as usize * region_size..(j as usize + 1) * region_size];
            codec.encode_block(j, region, &recovery_ids, &mut recovery, region_size);
        }
        for region in recovery.chunks(region_size) {
            assert!(region_check_parity(region));
        }

        // Decode the chosen losses
        let decoder =
            CauchyDecoder::new(&codec, lose.to_vec(), recovery_ids.clone()).unwrap();
        let mut restored = vec![0u8; lose.len() * region_size];
        for j in 0..block_count {
            if lose.contains(&j) {
                continue;
            }
            let region = &inputs[j as usize * region_size..(j as usize + 1) * region_size];
            decoder.accumulate_input(j, region, &mut restored, region_size);
        }
        for (pos, &r) in decoder.recovery_used().iter().enumerate() {
            let region = &recovery[r as usize * region_size..(r as usize + 1) * region_size];
            decoder.accumulate_recovery(pos, region, &mut restored, region_size);
        }

        for (slot, &lost_index) in lose.iter().enumerate() {
            let got = &restored[slot * region_size..(slot + 1) * region_size];
            let want =
                &inputs[lost_index as usize * region_size..(lost_index as usize + 1) * region_size];
            assert!(region_check_parity(got), "parity after decode, slot {slot}");
            assert_eq!(got, want, "block {lost_index} not restored");
        }
    }

    #[test]
    fn roundtrip_gf8() {
        roundtrip(10, 4, &[2, 7]);
    }

    #[test]
    fn roundtrip_gf8_all_recovery_used() {
        roundtrip(8, 3, &[0, 4, 7]);
    }

    #[test]
    fn roundtrip_gf16() {
        // 200 blocks forces the 16-bit field
        roundtrip(200, 5, &[0, 99, 199]);
    }

    #[test]
    fn decoder_rejects_insufficient_recovery() {
        let choice = select_field(EccMethod::Cauchy, 10, 0, 1, 0, 1).unwrap();
        let codec = CauchyCodec::new(choice, 10).unwrap();
        let err = CauchyDecoder::new(&codec, vec![1, 2], vec![0]).unwrap_err();
        assert!(matches!(err, CodecError::NotEnoughRecovery { .. }));
    }

    #[test]
    fn submatrix_inversion_is_exact() {
        let choice = select_field(EccMethod::Cauchy, 16, 0, 8, 0, 1).unwrap();
        let codec = CauchyCodec::new(choice, 16).unwrap();
        let decoder = CauchyDecoder::new(&codec, vec![3, 5, 11], vec![1, 4, 6]).unwrap();

        // inverse * A must be the identity
        let n = 3;
        let gf = codec.field();
        for row in 0..n {
            for col in 0..n {
                let mut sum = 0u16;
                for k in 0..n {
                    let a = codec.factor(decoder.recovery_used()[k], decoder.lost()[col]);
                    sum ^= gf.mul(decoder.inverse[row * n + k], a);
                }
                let expected = if row == col { 1 } else { 0 };
                assert_eq!(sum, expected, "({row},{col})");
            }
        }
    }
}
