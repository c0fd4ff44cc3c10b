//! Data Packet: a verbatim input block
//!
//! Data volumes carry input blocks next to the metadata so a damaged input
//! file can be rebuilt without touching recovery arithmetic. The scanner
//! keeps only the preamble and the payload location; block bytes are read
//! on demand during repair.

use crate::domain::SetId;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

pub const TYPE_TAG: &[u8; 8] = b"PAR DAT\0";
pub const PREAMBLE_LEN: u64 = 8;

#[derive(Debug, Clone)]
pub struct DataPacketMeta {
    pub block_index: u64,
    pub source: PathBuf,
    pub payload_offset: u64,
    pub payload_len: u64,
}

impl DataPacketMeta {
    pub fn from_preamble(
        preamble: &[u8],
        source: &Path,
        payload_offset: u64,
        payload_len: u64,
    ) -> Result<Self> {
        if preamble.len() != PREAMBLE_LEN as usize {
            return Err(Error::Logic("short Data packet preamble".into()));
        }
        Ok(DataPacketMeta {
            block_index: u64::from_le_bytes(preamble.try_into().unwrap()),
            source: source.to_path_buf(),
            payload_offset,
            payload_len,
        })
    }
}

/// Build a complete Data packet.
pub fn make_data_packet(set_id: SetId, block_index: u64, block: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(PREAMBLE_LEN as usize + block.len());
    body.extend_from_slice(&block_index.to_le_bytes());
    body.extend_from_slice(block);
    super::make_packet(set_id, TYPE_TAG, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_round_trips() {
        let packet = make_data_packet(SetId::new([1; 8]), 77, &[0x55; 128]);
        let preamble = &packet[48..56];
        let meta =
            DataPacketMeta::from_preamble(preamble, Path::new("x.par3"), 56, 128).unwrap();
        assert_eq!(meta.block_index, 77);
        assert_eq!(meta.payload_len, 128);
    }
}
