//! Block, slice, and chunk model
//!
//! The protected set is described by four arenas that reference each other
//! by index: input files own chunks, chunks map file ranges onto blocks,
//! and slices tie byte ranges of files to byte ranges of blocks. Blocks
//! keep a list of the slices living in them (tail blocks pack slices from
//! several files), replacing the intrusive next-index chains of a classic
//! C layout.

use crate::domain::{BlockIndex, Crc64Value, FileIndex, Hash128, SliceIndex};
use smallvec::SmallVec;

// Block state bits
pub const BLOCK_FOUND: u32 = 0x1;
pub const BLOCK_DAMAGED: u32 = 0x2;
pub const BLOCK_HAS_FULL: u32 = 0x4;
pub const BLOCK_HAS_TAILS: u32 = 0x10;

// File state bits
pub const FILE_MISSING: u32 = 0x1;
pub const FILE_DAMAGED: u32 = 0x2;
pub const FILE_MISNAMED: u32 = 0x4;
pub const FILE_RESTORED: u32 = 0x100;
pub const FILE_REPAIRED: u32 = 0x200;
pub const FILE_BAD_TIMESTAMP: u32 = 0x1_0000;
pub const FILE_BAD_PERMISSIONS: u32 = 0x2_0000;
pub const FILE_UNPROTECTED_CHUNKS: u32 = 0x8000_0000;

/// Extra-file index carried alongside [`FILE_MISNAMED`] in bits 3 and up.
pub fn misnamed_state(extra_index: usize) -> u32 {
    FILE_MISNAMED | ((extra_index as u32) << 3)
}

pub fn misnamed_extra_index(state: u32) -> usize {
    ((state >> 3) & 0x1FFF) as usize
}

/// One fixed-size unit of protected content.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub state: u32,
    /// Bytes of real data, `<= block_size`; shorter only for a tail block
    /// that was never filled.
    pub size: u64,
    pub crc: Crc64Value,
    pub hash: Hash128,
    /// Slices whose data lives wholly or partially in this block.
    pub slices: SmallVec<[SliceIndex; 2]>,
    /// Where the content was found during verification.
    pub found_in: Option<(FileIndex, u64)>,
}

impl Block {
    pub fn is_found(&self) -> bool {
        self.state & BLOCK_FOUND != 0
    }
}

/// A contiguous run of bytes belonging to one file and one block.
#[derive(Debug, Clone)]
pub struct Slice {
    pub file: FileIndex,
    pub file_offset: u64,
    pub block: BlockIndex,
    /// Offset of this slice inside the block.
    pub tail_offset: u64,
    pub size: u64,
    /// Where the slice's bytes were found during verification (tail scan).
    pub found_in: Option<(FileIndex, u64)>,
}

/// Tail disposition of a protected chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tail {
    /// Chunk size is an exact multiple of the block size.
    None,
    /// A remainder under 40 bytes, stored verbatim in the File Packet.
    Inline(Vec<u8>),
    /// A remainder of 40 bytes or more, packed into a tail block.
    Packed {
        crc: Crc64Value,
        hash: Hash128,
        block: u64,
        offset: u64,
    },
}

/// A maximal run of one file under a single protection scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Protected {
        size: u64,
        /// Index of the first input block; meaningful when
        /// `size >= block_size`.
        first_block: u64,
        tail: Tail,
    },
    /// A gap that is not protected; filled with zero bytes after repair.
    Unprotected { length: u64 },
}

impl Chunk {
    pub fn byte_len(&self) -> u64 {
        match self {
            Chunk::Protected { size, .. } => *size,
            Chunk::Unprotected { length } => *length,
        }
    }
}

/// One protected input file.
#[derive(Debug, Clone)]
pub struct InputFile {
    /// Path relative to the base, `/`-separated.
    pub name: String,
    pub size: u64,
    /// CRC-64 of the first 16 KiB (whole file when shorter).
    pub crc_16k: Crc64Value,
    /// Fingerprint over the concatenation of protected chunks.
    pub hash: Hash128,
    /// Indices into the chunk arena.
    pub chunks: std::ops::Range<usize>,
    /// Checksums of option packets (permissions) attached to this file.
    pub options: Vec<[u8; 16]>,
    pub state: u32,
}

impl InputFile {
    pub fn is_missing(&self) -> bool {
        self.state & FILE_MISSING != 0
    }

    pub fn is_damaged(&self) -> bool {
        self.state & FILE_DAMAGED != 0
    }

    /// Missing or damaged, and not already matched to a misnamed file.
    pub fn needs_restore(&self) -> bool {
        self.state & (FILE_MISSING | FILE_DAMAGED) != 0 && self.state & FILE_MISNAMED == 0
    }
}

/// One protected input directory.
#[derive(Debug, Clone)]
pub struct InputDir {
    pub name: String,
}

/// The complete slice/block/chunk/file graph for one set.
#[derive(Debug, Default)]
pub struct BlockMap {
    pub block_size: u64,
    pub blocks: Vec<Block>,
    pub slices: Vec<Slice>,
    pub chunks: Vec<Chunk>,
    pub files: Vec<InputFile>,
    pub dirs: Vec<InputDir>,
}

impl BlockMap {
    pub fn block_count(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Total bytes of protected data.
    pub fn protected_size(&self) -> u64 {
        self.chunks
            .iter()
            .filter_map(|c| match c {
                Chunk::Protected { size, .. } => Some(*size),
                Chunk::Unprotected { .. } => None,
            })
            .sum()
    }

    /// Every slice of `file`, in file-offset order.
    pub fn slices_of_file(&self, file: FileIndex) -> impl Iterator<Item = (SliceIndex, &Slice)> {
        self.slices
            .iter()
            .enumerate()
            .filter(move |(_, s)| s.file == file)
            .map(|(i, s)| (SliceIndex(i), s))
    }

    /// Check the covering invariants: every slice total matches its file
    /// size net of inline tails and unprotected gaps, and every block's
    /// slice list stays inside the block's data range.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (index, file) in self.files.iter().enumerate() {
            let chunk_total: u64 = self.chunks[file.chunks.clone()]
                .iter()
                .map(Chunk::byte_len)
                .sum();
            if chunk_total != file.size {
                return Err(format!(
                    "file {index}: chunks cover {chunk_total} of {} bytes",
                    file.size
                ));
            }

            let inline_total: u64 = self.chunks[file.chunks.clone()]
                .iter()
                .filter_map(|c| match c {
                    Chunk::Protected {
                        tail: Tail::Inline(bytes),
                        ..
                    } => Some(bytes.len() as u64),
                    Chunk::Unprotected { length } => Some(*length),
                    _ => None,
                })
                .sum();
            let slice_total: u64 = self
                .slices_of_file(FileIndex(index as u32))
                .map(|(_, s)| s.size)
                .sum();
            if slice_total + inline_total != file.size {
                return Err(format!(
                    "file {index}: slices cover {slice_total} + inline {inline_total} of {} bytes",
                    file.size
                ));
            }
        }

        for (index, block) in self.blocks.iter().enumerate() {
            for &slice_index in &block.slices {
                let slice = &self.slices[slice_index.0];
                if slice.block.as_usize() != index {
                    return Err(format!("block {index}: foreign slice in list"));
                }
                if slice.tail_offset + slice.size > block.size.max(self.block_size) {
                    return Err(format!("block {index}: slice outside data range"));
                }
            }
        }
        Ok(())
    }
}

impl BlockMap {
    /// Rebuild the slice/block/chunk/file graph from a parsed packet set.
    ///
    /// File paths come from walking the Root/Directory tree; block indices
    /// are absolute in the chunk descriptors, so slices can be re-derived
    /// without the original mapping order. Tail-block fingerprints are not
    /// carried in packets (tail hashes live per chunk), so those blocks
    /// keep default hashes.
    pub fn from_packets(set: &crate::packets::PacketSet) -> crate::error::Result<BlockMap> {
        use crate::error::Error;
        use crate::packets::PacketSet;

        let block_size = set.start.block_size;
        let mut map = BlockMap {
            block_size,
            ..Default::default()
        };
        map.blocks = vec![Block::default(); set.root.lowest_unused_block as usize];

        fn walk(
            set: &PacketSet,
            prefix: &str,
            children: &[[u8; 16]],
            map: &mut BlockMap,
        ) -> crate::error::Result<()> {
            for checksum in children {
                if let Some((_, packet)) = set
                    .files
                    .iter()
                    .find(|(c, _)| c.as_bytes() == checksum)
                {
                    let name = if prefix.is_empty() {
                        packet.name.clone()
                    } else {
                        format!("{prefix}/{}", packet.name)
                    };
                    let name = crate::paths::normalize_relative(&name)?;
                    add_file(map, name, packet)?;
                } else if let Some((_, dir)) = set
                    .dirs
                    .iter()
                    .find(|(c, _)| c.as_bytes() == checksum)
                {
                    let name = if prefix.is_empty() {
                        dir.name.clone()
                    } else {
                        format!("{prefix}/{}", dir.name)
                    };
                    let name = crate::paths::normalize_relative(&name)?;
                    map.dirs.push(InputDir { name: name.clone() });
                    walk(set, &name, &dir.children, map)?;
                } else {
                    return Err(Error::Logic(
                        "directory tree references a missing packet".into(),
                    ));
                }
            }
            Ok(())
        }

        fn add_file(
            map: &mut BlockMap,
            name: String,
            packet: &crate::packets::FilePacket,
        ) -> crate::error::Result<()> {
            use crate::error::Error;

            let file_index = FileIndex(map.files.len() as u32);
            let block_size = map.block_size;
            let first_chunk = map.chunks.len();
            let mut state = 0u32;
            let mut file_offset = 0u64;

            for chunk in &packet.chunks {
                match chunk {
                    Chunk::Unprotected { length } => {
                        state |= FILE_UNPROTECTED_CHUNKS;
                        file_offset += length;
                    }
                    Chunk::Protected {
                        size,
                        first_block,
                        tail,
                    } => {
                        let full = size / block_size;
                        for i in 0..full {
                            let block = first_block + i;
                            if block >= map.blocks.len() as u64 {
                                return Err(Error::Logic(format!(
                                    "chunk references block {block} beyond the set"
                                )));
                            }
                            let slice = SliceIndex(map.slices.len());
                            map.slices.push(Slice {
                                file: file_index,
                                file_offset,
                                block: BlockIndex(block),
                                tail_offset: 0,
                                size: block_size,
                                found_in: None,
                            });
                            let entry = &mut map.blocks[block as usize];
                            entry.state |= BLOCK_HAS_FULL;
                            entry.size = block_size;
                            entry.slices.push(slice);
                            file_offset += block_size;
                        }
                        match tail {
                            Tail::None => {}
                            Tail::Inline(bytes) => file_offset += bytes.len() as u64,
                            Tail::Packed { block, offset, .. } => {
                                let tail_size = size % block_size;
                                if *block >= map.blocks.len() as u64 {
                                    return Err(Error::Logic(format!(
                                        "tail references block {block} beyond the set"
                                    )));
                                }
                                let slice = SliceIndex(map.slices.len());
                                map.slices.push(Slice {
                                    file: file_index,
                                    file_offset,
                                    block: BlockIndex(*block),
                                    tail_offset: *offset,
                                    size: tail_size,
                                    found_in: None,
                                });
                                let entry = &mut map.blocks[*block as usize];
                                entry.state |= BLOCK_HAS_TAILS;
                                entry.size = entry.size.max(offset + tail_size);
                                entry.slices.push(slice);
                                file_offset += tail_size;
                            }
                        }
                    }
                }
                map.chunks.push(chunk.clone());
            }

            map.files.push(InputFile {
                name,
                size: file_offset,
                crc_16k: packet.crc_16k,
                hash: packet.hash,
                chunks: first_chunk..map.chunks.len(),
                options: packet.options.clone(),
                state,
            });
            Ok(())
        }

        walk(set, "", &set.root.children, &mut map)?;

        // Full-block checksums come from the External Data packets
        for external in &set.external {
            for (i, &(crc, hash)) in external.checksums.iter().enumerate() {
                let index = external.first_block as usize + i;
                if let Some(block) = map.blocks.get_mut(index) {
                    block.crc = crc;
                    block.hash = hash;
                }
            }
        }

        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misnamed_state_round_trips_extra_index() {
        let state = misnamed_state(11);
        assert!(state & FILE_MISNAMED != 0);
        assert_eq!(misnamed_extra_index(state), 11);
    }

    #[test]
    fn chunk_byte_len_covers_both_kinds() {
        let protected = Chunk::Protected {
            size: 1500,
            first_block: 0,
            tail: Tail::None,
        };
        assert_eq!(protected.byte_len(), 1500);
        assert_eq!(Chunk::Unprotected { length: 77 }.byte_len(), 77);
    }

    #[test]
    fn invariant_check_flags_uncovered_bytes() {
        let mut map = BlockMap {
            block_size: 100,
            ..Default::default()
        };
        map.chunks.push(Chunk::Protected {
            size: 90,
            first_block: 0,
            tail: Tail::Packed {
                crc: Crc64Value::new(0),
                hash: Hash128::default(),
                block: 0,
                offset: 0,
            },
        });
        map.files.push(InputFile {
            name: "a.bin".into(),
            size: 90,
            crc_16k: Crc64Value::new(0),
            hash: Hash128::default(),
            chunks: 0..1,
            options: vec![],
            state: 0,
        });
        // No slice covering the tail yet
        assert!(map.check_invariants().is_err());

        map.blocks.push(Block {
            size: 90,
            slices: smallvec::smallvec![SliceIndex(0)],
            ..Default::default()
        });
        map.slices.push(Slice {
            file: FileIndex(0),
            file_offset: 0,
            block: BlockIndex(0),
            tail_offset: 0,
            size: 90,
            found_in: None,
        });
        assert!(map.check_invariants().is_ok());
    }
}
