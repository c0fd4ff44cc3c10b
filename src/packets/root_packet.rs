//! Root Packet: top of the directory tree
//!
//! Carries the lowest unused input-block index (the set's block count), the
//! set attributes, and the sorted checksums of the top-level children.

use super::file_packet::Reader;
use crate::error::Result;

pub const TYPE_TAG: &[u8; 8] = b"PAR ROO\0";

/// Attribute bit: paths are absolute.
pub const ATTR_ABSOLUTE_PATH: u8 = 0x1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootPacket {
    /// Lowest index not used by any input block, i.e. the block count.
    pub lowest_unused_block: u64,
    pub attributes: u8,
    pub options: Vec<[u8; 16]>,
    /// Sorted checksums of top-level File/Directory packets.
    pub children: Vec<[u8; 16]>,
}

impl RootPacket {
    pub fn new(block_count: u64, attributes: u8, mut children: Vec<[u8; 16]>) -> Self {
        children.sort_unstable();
        RootPacket {
            lowest_unused_block: block_count,
            attributes,
            options: Vec::new(),
            children,
        }
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let lowest_unused_block = r.u64()?;
        let attributes = r.u8()?;
        let option_count = r.u32()? as usize;
        let mut options = Vec::with_capacity(option_count);
        for _ in 0..option_count {
            options.push(r.array16()?);
        }
        let mut children = Vec::new();
        while !r.done() {
            children.push(r.array16()?);
        }
        Ok(RootPacket {
            lowest_unused_block,
            attributes,
            options,
            children,
        })
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.lowest_unused_block.to_le_bytes());
        body.push(self.attributes);
        body.extend_from_slice(&(self.options.len() as u32).to_le_bytes());
        for option in &self.options {
            body.extend_from_slice(option);
        }
        for child in &self.children {
            body.extend_from_slice(child);
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let packet = RootPacket::new(42, ATTR_ABSOLUTE_PATH, vec![[8; 16], [2; 16]]);
        let parsed = RootPacket::parse(&packet.to_body()).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.lowest_unused_block, 42);
        assert_eq!(parsed.children, vec![[2; 16], [8; 16]]);
    }

    #[test]
    fn fixed_prefix_is_13_bytes() {
        let packet = RootPacket::new(7, 0, vec![]);
        assert_eq!(packet.to_body().len(), 13);
    }
}
