//! File Packet: name, content hashes, and chunk descriptors
//!
//! The chunk descriptors are position-dependent: which fields follow the
//! size depends on how the chunk relates to the block size, and remainders
//! under 40 bytes are embedded verbatim where the tail reference fields
//! would sit. That coupling to the set's block size is why this body is
//! decoded by hand rather than with a declarative reader.

use crate::block::{Chunk, Tail};
use crate::domain::{Crc64Value, Hash128};
use crate::error::{Error, Result};

pub const TYPE_TAG: &[u8; 8] = b"PAR FIL\0";

/// Smallest tail stored in a block; shorter remainders live inline here.
pub const MIN_PACKED_TAIL: u64 = 40;

#[derive(Debug, Clone)]
pub struct FilePacket {
    /// Final path component only; placement comes from Directory packets.
    pub name: String,
    /// CRC-64 of the first 16 KiB of the file.
    pub crc_16k: Crc64Value,
    /// Fingerprint of the protected data.
    pub hash: Hash128,
    /// Checksums of option packets (permissions and the like).
    pub options: Vec<[u8; 16]>,
    pub chunks: Vec<Chunk>,
}

impl FilePacket {
    pub fn file_size(&self) -> u64 {
        self.chunks.iter().map(Chunk::byte_len).sum()
    }

    pub fn parse(body: &[u8], block_size: u64) -> Result<Self> {
        let mut r = Reader::new(body);
        let name_len = r.u16()? as usize;
        let name = String::from_utf8(r.bytes(name_len)?.to_vec())
            .map_err(|_| Error::Logic("File packet name is not UTF-8".into()))?;
        let crc_16k = Crc64Value::new(r.u64()?);
        let hash = Hash128::new(r.array16()?);
        let option_count = r.u8()? as usize;
        let mut options = Vec::with_capacity(option_count);
        for _ in 0..option_count {
            options.push(r.array16()?);
        }

        let mut chunks = Vec::new();
        while !r.done() {
            let size = r.u64()?;
            if size == 0 {
                let length = r.u64()?;
                chunks.push(Chunk::Unprotected { length });
                continue;
            }
            let first_block = if size >= block_size { r.u64()? } else { 0 };
            let tail_size = size % block_size;
            let tail = if tail_size >= MIN_PACKED_TAIL {
                Tail::Packed {
                    crc: Crc64Value::new(r.u64()?),
                    hash: Hash128::new(r.array16()?),
                    block: r.u64()?,
                    offset: r.u64()?,
                }
            } else if tail_size > 0 {
                Tail::Inline(r.bytes(tail_size as usize)?.to_vec())
            } else {
                Tail::None
            };
            chunks.push(Chunk::Protected {
                size,
                first_block,
                tail,
            });
        }

        Ok(FilePacket {
            name,
            crc_16k,
            hash,
            options,
            chunks,
        })
    }

    pub fn to_body(&self, block_size: u64) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        body.extend_from_slice(self.name.as_bytes());
        body.extend_from_slice(&self.crc_16k.to_le_bytes());
        body.extend_from_slice(self.hash.as_bytes());
        body.push(self.options.len() as u8);
        for option in &self.options {
            body.extend_from_slice(option);
        }

        for chunk in &self.chunks {
            match chunk {
                Chunk::Unprotected { length } => {
                    body.extend_from_slice(&0u64.to_le_bytes());
                    body.extend_from_slice(&length.to_le_bytes());
                }
                Chunk::Protected {
                    size,
                    first_block,
                    tail,
                } => {
                    body.extend_from_slice(&size.to_le_bytes());
                    if *size >= block_size {
                        body.extend_from_slice(&first_block.to_le_bytes());
                    }
                    match tail {
                        Tail::None => {}
                        Tail::Inline(bytes) => {
                            debug_assert_eq!(bytes.len() as u64, size % block_size);
                            body.extend_from_slice(bytes);
                        }
                        Tail::Packed {
                            crc,
                            hash,
                            block,
                            offset,
                        } => {
                            body.extend_from_slice(&crc.to_le_bytes());
                            body.extend_from_slice(hash.as_bytes());
                            body.extend_from_slice(&block.to_le_bytes());
                            body.extend_from_slice(&offset.to_le_bytes());
                        }
                    }
                }
            }
        }
        body
    }
}

/// Minimal byte-slice reader for hand-decoded packet bodies.
pub(crate) struct Reader<'a> {
    body: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Reader { body, at: 0 }
    }

    pub fn done(&self) -> bool {
        self.at >= self.body.len()
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.at + len > self.body.len() {
            return Err(Error::Logic("packet body truncated".into()));
        }
        let out = &self.body[self.at..self.at + len];
        self.at += len;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    pub fn array16(&mut self) -> Result<[u8; 16]> {
        Ok(self.bytes(16)?.try_into().unwrap())
    }
}
