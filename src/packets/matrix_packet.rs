//! Matrix packets: parameters of the recovery code
//!
//! A set carries exactly one matrix packet naming the code family and its
//! geometry. Recovery Data packets reference it by checksum, so recovery
//! blocks from a differently-parameterized run can never be mixed in.

use binrw::{BinRead, BinReaderExt, BinWrite};
use std::io::Cursor;

use crate::error::{Error, Result};

pub const CAUCHY_TYPE_TAG: &[u8; 8] = b"PAR CAU\0";
pub const FFT_TYPE_TAG: &[u8; 8] = b"PAR FFT\0";

/// Cauchy-matrix parameters. Zeroed bounds mean "recovery for every input
/// block, count unknown"; the hint mirrors the `-cm` option.
#[derive(Debug, Clone, Copy, BinRead, BinWrite)]
#[brw(little)]
pub struct CauchyMatrixPacket {
    pub first_recovery: u64,
    /// One past the last recovery block, or zero when unbounded.
    pub last_recovery: u64,
    pub max_recovery_hint: u64,
}

impl CauchyMatrixPacket {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(body);
        cursor
            .read_le()
            .map_err(|e| Error::Logic(format!("malformed Cauchy matrix packet: {e}")))
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        self.write_le(&mut cursor).expect("in-memory write");
        cursor.into_inner()
    }
}

/// FFT-code parameters. The recovery ceiling is stored as a power of two;
/// the interleave count takes the shortest little-endian encoding that
/// fits and is omitted entirely when zero.
#[derive(Debug, Clone, Copy)]
pub struct FftMatrixPacket {
    pub first_recovery: u64,
    pub last_recovery: u64,
    /// log2 of the maximum recovery blocks per cohort (0..=15).
    pub log2_max_recovery: u8,
    pub interleave: u32,
}

impl FftMatrixPacket {
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 17 || body.len() > 21 {
            return Err(Error::Logic(format!(
                "malformed FFT matrix packet: {} body bytes",
                body.len()
            )));
        }
        let first_recovery = u64::from_le_bytes(body[..8].try_into().unwrap());
        let last_recovery = u64::from_le_bytes(body[8..16].try_into().unwrap());
        let log2_max_recovery = body[16];
        let mut interleave = 0u32;
        for (i, &byte) in body[17..].iter().enumerate() {
            interleave |= (byte as u32) << (8 * i);
        }
        Ok(FftMatrixPacket {
            first_recovery,
            last_recovery,
            log2_max_recovery,
            interleave,
        })
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(21);
        body.extend_from_slice(&self.first_recovery.to_le_bytes());
        body.extend_from_slice(&self.last_recovery.to_le_bytes());
        body.push(self.log2_max_recovery);
        let bytes = match self.interleave {
            0 => 0,
            1..=0xFF => 1,
            0x100..=0xFFFF => 2,
            0x1_0000..=0xFF_FFFF => 3,
            _ => 4,
        };
        body.extend_from_slice(&self.interleave.to_le_bytes()[..bytes]);
        body
    }

    /// Number of independent cohorts (`interleave + 1`).
    pub fn cohorts(&self) -> u32 {
        self.interleave + 1
    }

    /// Recovery ceiling per cohort.
    pub fn max_recovery_per_cohort(&self) -> u64 {
        1u64 << self.log2_max_recovery
    }
}

/// The code family of a set.
#[derive(Debug, Clone)]
pub enum MatrixPacket {
    Cauchy(CauchyMatrixPacket),
    Fft(FftMatrixPacket),
}

impl MatrixPacket {
    pub fn type_tag(&self) -> &'static [u8; 8] {
        match self {
            MatrixPacket::Cauchy(_) => CAUCHY_TYPE_TAG,
            MatrixPacket::Fft(_) => FFT_TYPE_TAG,
        }
    }

    pub fn to_body(&self) -> Vec<u8> {
        match self {
            MatrixPacket::Cauchy(p) => p.to_body(),
            MatrixPacket::Fft(p) => p.to_body(),
        }
    }

    pub fn cohorts(&self) -> u32 {
        match self {
            MatrixPacket::Cauchy(_) => 1,
            MatrixPacket::Fft(p) => p.cohorts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cauchy_body_round_trips() {
        let packet = CauchyMatrixPacket {
            first_recovery: 3,
            last_recovery: 0,
            max_recovery_hint: 100,
        };
        let body = packet.to_body();
        assert_eq!(body.len(), 24);
        let parsed = CauchyMatrixPacket::parse(&body).unwrap();
        assert_eq!(parsed.first_recovery, 3);
        assert_eq!(parsed.max_recovery_hint, 100);
    }

    #[test]
    fn fft_interleave_takes_shortest_encoding() {
        let mut packet = FftMatrixPacket {
            first_recovery: 0,
            last_recovery: 16,
            log2_max_recovery: 4,
            interleave: 0,
        };
        assert_eq!(packet.to_body().len(), 17);

        packet.interleave = 3;
        assert_eq!(packet.to_body().len(), 18);

        packet.interleave = 300;
        assert_eq!(packet.to_body().len(), 19);

        let parsed = FftMatrixPacket::parse(&packet.to_body()).unwrap();
        assert_eq!(parsed.interleave, 300);
        assert_eq!(parsed.cohorts(), 301);
        assert_eq!(parsed.max_recovery_per_cohort(), 16);
    }

    #[test]
    fn fft_rejects_oversized_interleave_field() {
        let mut body = FftMatrixPacket {
            first_recovery: 0,
            last_recovery: 1,
            log2_max_recovery: 0,
            interleave: 0,
        }
        .to_body();
        body.extend_from_slice(&[0; 5]);
        assert!(FftMatrixPacket::parse(&body).is_err());
    }
}
