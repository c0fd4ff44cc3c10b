//! External Data Packet: per-block checksums for the slide scan
//!
//! One packet covers a run of consecutive full-size input blocks, carrying
//! the rolling CRC-64 and the 16-byte fingerprint of each. Tail blocks are
//! excluded; their hashes travel in the chunk descriptors instead.

use super::file_packet::Reader;
use crate::domain::{Crc64Value, Hash128};
use crate::error::Result;

pub const TYPE_TAG: &[u8; 8] = b"PAR EXT\0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalDataPacket {
    /// Index of the first covered input block.
    pub first_block: u64,
    pub checksums: Vec<(Crc64Value, Hash128)>,
}

impl ExternalDataPacket {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let first_block = r.u64()?;
        let mut checksums = Vec::new();
        while !r.done() {
            let crc = Crc64Value::new(r.u64()?);
            let hash = Hash128::new(r.array16()?);
            checksums.push((crc, hash));
        }
        Ok(ExternalDataPacket {
            first_block,
            checksums,
        })
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + self.checksums.len() * 24);
        body.extend_from_slice(&self.first_block.to_le_bytes());
        for (crc, hash) in &self.checksums {
            body.extend_from_slice(&crc.to_le_bytes());
            body.extend_from_slice(hash.as_bytes());
        }
        body
    }
}
