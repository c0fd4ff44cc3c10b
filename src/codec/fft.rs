//! FFT-based Reed-Solomon codec
//!
//! An additive-FFT erasure code over GF(2^8) or GF(2^16). Recovery blocks
//! are the first `recovery_count` evaluations of the polynomial that
//! interpolates the input blocks over a contiguous range of field points;
//! decoding evaluates the error-locator polynomial over the whole field via
//! a Walsh-Hadamard transform of the log table, then recovers erased points
//! with one inverse transform, a formal derivative, and one forward
//! transform.
//!
//! The codec works on 64-byte-aligned regions (parity bytes included) and
//! needs a caller-provided scratch area:
//!
//! - encode: `2 * next_pow2(recovery_count)` regions; recovery blocks land
//!   in the first `recovery_count` of them
//! - decode: `next_pow2(next_pow2(max_recovery) + block_count)` regions;
//!   restored inputs land in the first `block_count` of them
//!
//! Positions are mapped to field elements through the polynomial basis
//! {1, 2, 4, ...}; the transform twiddles are derived from that basis, so
//! encode and decode agree on the geometry by construction.

use super::{next_pow2, CodecError, FieldChoice};

/// Hard ceiling on recovery blocks per cohort.
pub const MAX_RECOVERY_COUNT: u64 = 32768;

/// Scratch regions needed to encode `recovery_count` blocks.
pub fn encode_work_count(recovery_count: u64) -> u64 {
    2 * next_pow2(recovery_count.max(1))
}

/// Scratch regions needed to decode.
pub fn decode_work_count(block_count: u64, max_recovery: u64) -> u64 {
    let m = next_pow2(max_recovery.max(1));
    next_pow2(m + block_count)
}

/// Field tables for the transform: discrete logs, antilogs, per-position
/// twiddles, and the Walsh transform of the log table used by the decoder's
/// error locator.
pub struct FftCodec {
    order: usize,
    modulus: u32,
    element_bytes: usize,
    log: Vec<u16>,
    exp: Vec<u16>,
    skew_log: Vec<u16>,
    log_walsh: Vec<u16>,
}

impl FftCodec {
    pub fn new(choice: FieldChoice) -> Result<Self, CodecError> {
        let (bits, polynomial) = match choice.gf_size {
            1 => (8u32, choice.polynomial),
            2 => (16u32, choice.polynomial),
            other => return Err(CodecError::UnsupportedField(other)),
        };
        let order = 1usize << bits;
        let modulus = (order - 1) as u32;

        // LFSR log/antilog tables; log[0] is the "no multiplier" sentinel
        let mut log = vec![0u16; order];
        let mut exp = vec![0u16; order];
        let mut state = 1u32;
        for i in 0..modulus {
            log[state as usize] = i as u16;
            exp[i as usize] = state as u16;
            state <<= 1;
            if state & order as u32 != 0 {
                state ^= polynomial;
            }
        }
        log[0] = modulus as u16;
        exp[modulus as usize] = exp[0];

        let skew_log = build_skews(bits, modulus, &log, &exp);

        // Walsh transform of the log table, reused by every decode
        let mut log_walsh: Vec<u16> = log.clone();
        log_walsh[0] = 0;
        fwht(&mut log_walsh, modulus);

        Ok(FftCodec {
            order,
            modulus,
            element_bytes: choice.gf_size as usize,
            log,
            exp,
            skew_log,
            log_walsh,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Compute `recovery_count` recovery regions from the input regions.
    ///
    /// `originals` holds one region per input block; `work` is a flat
    /// buffer of `encode_work_count(recovery_count)` regions. On success
    /// the first `recovery_count` work regions hold the recovery blocks.
    pub fn encode(
        &self,
        region_size: usize,
        originals: &[&[u8]],
        recovery_count: usize,
        work: &mut [u8],
    ) -> Result<(), CodecError> {
        let m = next_pow2(recovery_count.max(1) as u64) as usize;
        if work.len() != 2 * m * region_size {
            return Err(CodecError::RegionMismatch);
        }
        if originals.iter().any(|o| o.len() != region_size) {
            return Err(CodecError::RegionMismatch);
        }
        let original_count = originals.len();
        if m + original_count > self.order || recovery_count as u64 > MAX_RECOVERY_COUNT {
            return Err(CodecError::TooManyBlocks((m + original_count) as u64));
        }

        // First chunk of up to m inputs lands directly in the accumulator
        let first = original_count.min(m);
        for (slot, original) in originals[..first].iter().enumerate() {
            region_at_mut(work, region_size, slot).copy_from_slice(original);
        }
        for slot in first..2 * m {
            region_at_mut(work, region_size, slot).fill(0);
        }
        self.ifft(work, region_size, 0, m, first, m);

        // Remaining chunks accumulate through the temp half of the work area
        let mut i = m;
        while i < original_count {
            let chunk = &originals[i..];
            let take = chunk.len().min(m);
            for slot in 0..m {
                let out = region_at_mut(work, region_size, m + slot);
                if slot < take {
                    out.copy_from_slice(chunk[slot]);
                } else {
                    out.fill(0);
                }
            }
            self.ifft(work, region_size, m, m, take, m + i);
            for slot in 0..m {
                let (dst, src) = region_pair(work, region_size, slot, m + slot);
                xor_region(dst, src);
            }
            i += m;
        }

        // Evaluate at the recovery positions
        self.fft(work, region_size, 0, m, 0);
        Ok(())
    }

    /// Reconstruct missing inputs.
    ///
    /// `originals[i]` is the region of input block `i` when it survived;
    /// `recoveries[r]` is the region of recovery block `r` when available
    /// (the slice length is the code's `max_recovery`). `work` is a flat
    /// buffer of `decode_work_count` regions; on success the restored input
    /// `i` can be read from work region `i` for every missing input.
    pub fn decode(
        &self,
        region_size: usize,
        originals: &[Option<&[u8]>],
        recoveries: &[Option<&[u8]>],
        work: &mut [u8],
    ) -> Result<(), CodecError> {
        let original_count = originals.len();
        let recovery_count = recoveries.len();
        let m = next_pow2(recovery_count.max(1) as u64) as usize;
        let n = next_pow2((m + original_count) as u64) as usize;
        if work.len() != n * region_size {
            return Err(CodecError::RegionMismatch);
        }
        if n > self.order {
            return Err(CodecError::TooManyBlocks(n as u64));
        }

        let missing = originals.iter().filter(|o| o.is_none()).count();
        let available = recoveries.iter().filter(|r| r.is_some()).count();
        if missing > available {
            return Err(CodecError::NotEnoughRecovery { missing, available });
        }
        if missing == 0 {
            return Ok(());
        }

        // Error locator: mark every erased code position
        let mut err_loc = vec![0u16; self.order];
        for (i, r) in recoveries.iter().enumerate() {
            if r.is_none() {
                err_loc[i] = 1;
            }
        }
        for e in err_loc.iter_mut().take(m).skip(recovery_count) {
            *e = 1;
        }
        for (i, o) in originals.iter().enumerate() {
            if o.is_none() {
                err_loc[m + i] = 1;
            }
        }

        // Evaluate the locator polynomial over the whole field:
        // FWHT, pointwise product with the log-table transform, FWHT back
        fwht(&mut err_loc, self.modulus);
        for (e, &w) in err_loc.iter_mut().zip(&self.log_walsh) {
            *e = ((*e as u32 * w as u32) % self.modulus) as u16;
        }
        fwht(&mut err_loc, self.modulus);

        // Scale surviving code positions by the locator evaluations
        for (i, r) in recoveries.iter().enumerate() {
            let out = region_at_mut(work, region_size, i);
            match r {
                Some(region) => {
                    if region.len() != region_size {
                        return Err(CodecError::RegionMismatch);
                    }
                    self.mul_region(out, region, err_loc[i]);
                }
                None => out.fill(0),
            }
        }
        for i in recovery_count..m {
            region_at_mut(work, region_size, i).fill(0);
        }
        for (i, o) in originals.iter().enumerate() {
            let out = region_at_mut(work, region_size, m + i);
            match o {
                Some(region) => {
                    if region.len() != region_size {
                        return Err(CodecError::RegionMismatch);
                    }
                    self.mul_region(out, region, err_loc[m + i]);
                }
                None => out.fill(0),
            }
        }
        for i in m + original_count..n {
            region_at_mut(work, region_size, i).fill(0);
        }

        // Interpolate, differentiate, evaluate
        self.ifft(work, region_size, 0, n, m + original_count, 0);

        for i in 1..n {
            let width = i & i.wrapping_neg();
            for j in 0..width {
                let (dst, src) = region_pair(work, region_size, i - width + j, i + j);
                xor_region(dst, src);
            }
        }

        self.fft(work, region_size, 0, n, 0);

        // The derivative evaluation at an erased data position, divided by
        // the locator derivative, is the missing input
        for (i, o) in originals.iter().enumerate() {
            if o.is_some() {
                continue;
            }
            let log_m = (self.modulus - err_loc[m + i] as u32) as u16;
            let (dst, src) = region_pair(work, region_size, i, m + i);
            self.mul_region(dst, src, log_m);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transforms
    // ------------------------------------------------------------------

    /// Decimation-in-time inverse transform over `size` regions starting at
    /// work region `base`, for a chunk whose code position offset is `shift`.
    fn ifft(
        &self,
        work: &mut [u8],
        region_size: usize,
        base: usize,
        size: usize,
        truncated: usize,
        shift: usize,
    ) {
        let mut dist = 1;
        while dist < size {
            let range = dist * 2;
            let mut r = 0;
            while r < size {
                // Nothing but zero padding beyond the truncation point
                if r >= truncated && dist >= truncated {
                    break;
                }
                let log_m = self.skew_log[r + dist + shift - 1];
                for pair in r..r + dist {
                    let (x, y) = region_pair(work, region_size, base + pair, base + pair + dist);
                    xor_region(y, x);
                    if (log_m as u32) < self.modulus {
                        self.mul_add_region(x, y, log_m);
                    }
                }
                r += range;
            }
            dist = range;
        }
    }

    /// Decimation-in-time forward transform, inverse of [`Self::ifft`].
    fn fft(&self, work: &mut [u8], region_size: usize, base: usize, size: usize, shift: usize) {
        let mut dist = size / 2;
        while dist > 0 {
            let range = dist * 2;
            let mut r = 0;
            while r < size {
                let log_m = self.skew_log[r + dist + shift - 1];
                for pair in r..r + dist {
                    let (x, y) = region_pair(work, region_size, base + pair, base + pair + dist);
                    if (log_m as u32) < self.modulus {
                        self.mul_add_region(x, y, log_m);
                    }
                    xor_region(y, x);
                }
                r += range;
            }
            dist /= 2;
        }
    }

    // ------------------------------------------------------------------
    // Region arithmetic
    // ------------------------------------------------------------------

    #[inline]
    fn mul_value(&self, value: u16, log_m: u16) -> u16 {
        if value == 0 {
            return 0;
        }
        let sum = (self.log[value as usize] as u32 + log_m as u32) % self.modulus;
        self.exp[sum as usize]
    }

    /// `dst ^= src * exp(log_m)`
    fn mul_add_region(&self, dst: &mut [u8], src: &[u8], log_m: u16) {
        match self.element_bytes {
            1 => {
                let row = self.byte_row(log_m);
                for (d, s) in dst.iter_mut().zip(src) {
                    *d ^= row[*s as usize];
                }
            }
            _ => {
                let nibble = self.nibble_rows(log_m);
                for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
                    let word = u16::from_le_bytes([s[0], s[1]]);
                    let prod = nibble_mul(&nibble, word);
                    d[0] ^= prod as u8;
                    d[1] ^= (prod >> 8) as u8;
                }
            }
        }
    }

    /// `region *= exp(log_m)` in place.
    fn mul_region(&self, out: &mut [u8], src: &[u8], log_m: u16) {
        if log_m == 0 {
            out.copy_from_slice(src);
            return;
        }
        match self.element_bytes {
            1 => {
                let row = self.byte_row(log_m);
                for (d, s) in out.iter_mut().zip(src) {
                    *d = row[*s as usize];
                }
            }
            _ => {
                let nibble = self.nibble_rows(log_m);
                for (d, s) in out.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
                    let word = u16::from_le_bytes([s[0], s[1]]);
                    let prod = nibble_mul(&nibble, word);
                    d[0] = prod as u8;
                    d[1] = (prod >> 8) as u8;
                }
            }
        }
    }

    fn byte_row(&self, log_m: u16) -> [u8; 256] {
        let mut row = [0u8; 256];
        for (v, out) in row.iter_mut().enumerate().skip(1) {
            *out = self.mul_value(v as u16, log_m) as u8;
        }
        row
    }

    fn nibble_rows(&self, log_m: u16) -> [[u16; 16]; 4] {
        let mut rows = [[0u16; 16]; 4];
        for k in 0..4 {
            for n in 1..16u16 {
                rows[k][n as usize] = self.mul_value(n << (4 * k), log_m);
            }
        }
        rows
    }
}

#[inline]
fn nibble_mul(rows: &[[u16; 16]; 4], word: u16) -> u16 {
    rows[0][(word & 0xF) as usize]
        ^ rows[1][((word >> 4) & 0xF) as usize]
        ^ rows[2][((word >> 8) & 0xF) as usize]
        ^ rows[3][(word >> 12) as usize]
}

#[inline]
fn xor_region(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

#[inline]
fn region_at_mut(work: &mut [u8], region_size: usize, index: usize) -> &mut [u8] {
    &mut work[index * region_size..(index + 1) * region_size]
}

/// Disjoint mutable views of regions `i` and `j` (`i < j`).
fn region_pair(work: &mut [u8], region_size: usize, i: usize, j: usize) -> (&mut [u8], &mut [u8]) {
    debug_assert!(i < j);
    let (head, tail) = work.split_at_mut(j * region_size);
    (
        &mut head[i * region_size..(i + 1) * region_size],
        &mut tail[..region_size],
    )
}

/// Per-position twiddle factors, in the log domain, for the basis
/// {1, 2, 4, ...}. Built once per codec with the recursive subspace
/// construction; entries that come out as field zero read as the modulus
/// sentinel so the butterflies skip the multiply.
fn build_skews(bits: u32, modulus: u32, log: &[u16], exp: &[u16]) -> Vec<u16> {
    let order = 1usize << bits;
    let mul_log = |value: u16, log_m: u16| -> u16 {
        if value == 0 {
            0
        } else {
            exp[((log[value as usize] as u32 + log_m as u32) % modulus) as usize]
        }
    };

    let mut skew = vec![0u16; order];
    let mut temp = vec![0u16; (bits - 1) as usize];
    for (i, t) in temp.iter_mut().enumerate() {
        *t = 1 << (i + 1);
    }

    for m in 0..(bits - 1) as usize {
        let step = 1usize << (m + 1);
        skew[(1usize << m) - 1] = 0;
        for i in m..(bits - 1) as usize {
            let s = 1usize << (i + 1);
            let mut j = (1usize << m) - 1;
            while j < s {
                skew[j + s] = skew[j] ^ temp[i];
                j += step;
            }
        }
        // Twist the remaining basis elements into the next subspace
        let log_sum = log[(temp[m] ^ 1) as usize];
        temp[m] = ((modulus - log[mul_log(temp[m], log_sum) as usize] as u32) % modulus) as u16;
        for i in (m + 1)..(bits - 1) as usize {
            let sum = ((log[(temp[i] ^ 1) as usize] as u32 + temp[m] as u32) % modulus) as u16;
            temp[i] = mul_log(temp[i], sum);
        }
    }

    for entry in skew.iter_mut() {
        *entry = log[*entry as usize];
    }
    skew
}

/// In-place Walsh-Hadamard transform with entries taken modulo the field's
/// multiplicative group order.
fn fwht(data: &mut [u16], modulus: u32) {
    let n = data.len();
    let mut width = 1;
    while width < n {
        let mut i = 0;
        while i < n {
            for j in i..i + width {
                let a = data[j] as u32;
                let b = data[j + width] as u32;
                data[j] = ((a + b) % modulus) as u16;
                data[j + width] = ((modulus + a - b) % modulus) as u16;
            }
            i += width * 2;
        }
        width <<= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{GF16_FFT, GF8_FFT};
    use crate::galois::{fft_region_size, region_check_parity, region_create_parity};

    fn make_region(region_size: usize, seed: u64) -> Vec<u8> {
        let mut region = vec![0u8; region_size];
        let mut state = seed.wrapping_add(0x9E3779B97F4A7C15);
        for b in region[..region_size - 4].iter_mut() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *b = (state >> 56) as u8;
        }
        region_create_parity(&mut region);
        region
    }

    fn roundtrip(choice: FieldChoice, original_count: usize, recovery_count: usize, lose: &[usize]) {
        assert!(lose.len() <= recovery_count);
        let codec = FftCodec::new(choice).unwrap();
        let region_size = fft_region_size(128) as usize;

        let inputs: Vec<Vec<u8>> = (0..original_count)
            .map(|i| make_region(region_size, i as u64))
            .collect();

        // Encode
        let work_regions = encode_work_count(recovery_count as u64) as usize;
        let mut work = vec![0u8; work_regions * region_size];
        let refs: Vec<&[u8]> = inputs.iter().map(|v| v.as_slice()).collect();
        codec
            .encode(region_size, &refs, recovery_count, &mut work)
            .unwrap();
        let recovery: Vec<Vec<u8>> = (0..recovery_count)
            .map(|i| work[i * region_size..(i + 1) * region_size].to_vec())
            .collect();
        for r in &recovery {
            assert!(region_check_parity(r), "recovery parity");
        }

        // Decode with the chosen inputs erased
        let originals: Vec<Option<&[u8]>> = (0..original_count)
            .map(|i| (!lose.contains(&i)).then(|| inputs[i].as_slice()))
            .collect();
        let recoveries: Vec<Option<&[u8]>> =
            recovery.iter().map(|r| Some(r.as_slice())).collect();

        let n = decode_work_count(original_count as u64, recovery_count as u64) as usize;
        let mut decode_work = vec![0u8; n * region_size];
        codec
            .decode(region_size, &originals, &recoveries, &mut decode_work)
            .unwrap();

        for &i in lose {
            let got = &decode_work[i * region_size..(i + 1) * region_size];
            assert!(region_check_parity(got), "parity of restored block {i}");
            assert_eq!(got, inputs[i].as_slice(), "block {i} not restored");
        }
    }

    #[test]
    fn roundtrip_gf8_two_losses() {
        roundtrip(GF8_FFT, 10, 4, &[2, 7]);
    }

    #[test]
    fn roundtrip_gf8_max_losses() {
        roundtrip(GF8_FFT, 12, 3, &[0, 5, 11]);
    }

    #[test]
    fn roundtrip_single_recovery_is_xor_parity() {
        roundtrip(GF8_FFT, 7, 1, &[3]);
    }

    #[test]
    fn roundtrip_gf16() {
        roundtrip(GF16_FFT, 20, 6, &[0, 10, 19]);
    }

    #[test]
    fn roundtrip_gf16_more_inputs_than_transform_chunk() {
        // original_count well above m exercises the chunked accumulation
        roundtrip(GF16_FFT, 37, 4, &[1, 36]);
    }

    #[test]
    fn decode_with_partial_recovery_set() {
        let codec = FftCodec::new(GF8_FFT).unwrap();
        let region_size = fft_region_size(64) as usize;
        let original_count = 9;
        let recovery_count = 4;

        let inputs: Vec<Vec<u8>> = (0..original_count)
            .map(|i| make_region(region_size, 100 + i as u64))
            .collect();
        let refs: Vec<&[u8]> = inputs.iter().map(|v| v.as_slice()).collect();
        let mut work =
            vec![0u8; encode_work_count(recovery_count as u64) as usize * region_size];
        codec
            .encode(region_size, &refs, recovery_count, &mut work)
            .unwrap();
        let recovery: Vec<Vec<u8>> = (0..recovery_count)
            .map(|i| work[i * region_size..(i + 1) * region_size].to_vec())
            .collect();

        // Lose inputs 2 and 6, and also recovery blocks 0 and 3
        let originals: Vec<Option<&[u8]>> = (0..original_count)
            .map(|i| (i != 2 && i != 6).then(|| inputs[i].as_slice()))
            .collect();
        let recoveries: Vec<Option<&[u8]>> = (0..recovery_count)
            .map(|r| (r != 0 && r != 3).then(|| recovery[r].as_slice()))
            .collect();

        let n = decode_work_count(original_count as u64, recovery_count as u64) as usize;
        let mut decode_work = vec![0u8; n * region_size];
        codec
            .decode(region_size, &originals, &recoveries, &mut decode_work)
            .unwrap();

        for &i in &[2usize, 6] {
            let got = &decode_work[i * region_size..(i + 1) * region_size];
            assert_eq!(got, inputs[i].as_slice());
        }
    }

    #[test]
    fn decode_refuses_when_losses_exceed_recovery() {
        let codec = FftCodec::new(GF8_FFT).unwrap();
        let region_size = fft_region_size(64) as usize;
        let region = make_region(region_size, 1);

        let originals: Vec<Option<&[u8]>> = vec![None, None, Some(&region)];
        let recoveries: Vec<Option<&[u8]>> = vec![Some(&region)];
        let n = decode_work_count(3, 1) as usize;
        let mut work = vec![0u8; n * region_size];
        let err = codec
            .decode(region_size, &originals, &recoveries, &mut work)
            .unwrap_err();
        assert!(matches!(err, CodecError::NotEnoughRecovery { .. }));
    }

    #[test]
    fn work_counts_match_contract() {
        assert_eq!(encode_work_count(4), 8);
        assert_eq!(encode_work_count(5), 16);
        assert_eq!(decode_work_count(100, 4), 128);
        assert_eq!(decode_work_count(100, 0), 128);
        assert_eq!(decode_work_count(1, 1), 2);
    }
}
