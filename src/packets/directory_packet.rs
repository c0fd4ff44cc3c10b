//! Directory Packet: one path component and its children
//!
//! Children are referenced by the checksums of their File or Directory
//! packets, kept in memcmp order so the packet body (and therefore its own
//! checksum) is independent of scan order.

use super::file_packet::Reader;
use crate::error::Result;

pub const TYPE_TAG: &[u8; 8] = b"PAR DIR\0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryPacket {
    pub name: String,
    pub options: Vec<[u8; 16]>,
    /// Sorted checksums of child File/Directory packets.
    pub children: Vec<[u8; 16]>,
}

impl DirectoryPacket {
    pub fn new(name: String, mut children: Vec<[u8; 16]>) -> Self {
        children.sort_unstable();
        DirectoryPacket {
            name,
            options: Vec::new(),
            children,
        }
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let name_len = r.u16()? as usize;
        let name = String::from_utf8_lossy(r.bytes(name_len)?).into_owned();
        let option_count = r.u32()? as usize;
        let mut options = Vec::with_capacity(option_count);
        for _ in 0..option_count {
            options.push(r.array16()?);
        }
        let mut children = Vec::new();
        while !r.done() {
            children.push(r.array16()?);
        }
        Ok(DirectoryPacket {
            name,
            options,
            children,
        })
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        body.extend_from_slice(self.name.as_bytes());
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
    fn round_trips_and_sorts_children() {
        let packet = DirectoryPacket::new("subdir".into(), vec![[9; 16], [1; 16], [5; 16]]);
        assert_eq!(packet.children, vec![[1; 16], [5; 16], [9; 16]]);

        let parsed = DirectoryPacket::parse(&packet.to_body()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn empty_directory_has_no_children() {
        let packet = DirectoryPacket::new("empty".into(), vec![]);
        let parsed = DirectoryPacket::parse(&packet.to_body()).unwrap();
        assert!(parsed.children.is_empty());
    }
}
