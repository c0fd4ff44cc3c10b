//! Slice mapper: cut input files into blocks, slices, and chunks
//!
//! Files are processed largest-first so chunk tails pack densely. Each file
//! contributes whole-block slices for `size / block_size` blocks; the
//! remainder is dropped (empty), embedded in the File Packet (under 40
//! bytes), or packed first-fit into a shared tail block. With
//! deduplication enabled, a candidate block's checksums are probed against
//! the blocks already mapped, and a match reuses the existing block, so
//! several slices may share one block.

use crate::block::{
    Block, BlockMap, Chunk, InputDir, InputFile, Slice, Tail, BLOCK_HAS_FULL, BLOCK_HAS_TAILS,
};
use crate::checksum::{blake3_128, block_checksums, crc64, Fingerprint};
use crate::domain::{BlockIndex, Crc64Value, FileIndex, Hash128, SliceIndex};
use crate::error::Result;
use crate::packets::file_packet::MIN_PACKED_TAIL;
use log::debug;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

/// Dedup levels: 0 off, 1 full blocks, 2 full blocks and chunk tails.
pub const DEDUP_OFF: u8 = 0;
pub const DEDUP_BLOCKS: u8 = 1;
pub const DEDUP_FULL: u8 = 2;

/// One input file to be mapped.
#[derive(Debug, Clone)]
pub struct InputEntry {
    /// Path relative to the base, `/`-separated, as stored in packets.
    pub name: String,
    /// Where to read the bytes from.
    pub path: PathBuf,
    pub size: u64,
}

struct TailBlock {
    block: usize,
    data: Vec<u8>,
}

struct MapperState {
    map: BlockMap,
    dedup: u8,
    /// (crc, hash, size) of full blocks already mapped.
    block_index: FxHashMap<(u64, Hash128), u64>,
    /// (crc of tail, hash, size) of packed tails already mapped.
    tail_index: FxHashMap<(u64, Hash128, u64), (u64, u64)>,
    open_tails: Vec<TailBlock>,
}

/// Map the input set onto blocks and slices.
pub fn map_inputs(
    mut files: Vec<InputEntry>,
    dirs: Vec<String>,
    block_size: u64,
    dedup: u8,
) -> Result<BlockMap> {
    assert!(block_size >= MIN_PACKED_TAIL, "block size below minimum");

    // Largest first, name as tie-break for a deterministic layout
    files.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.name.cmp(&b.name)));

    let mut state = MapperState {
        map: BlockMap {
            block_size,
            ..Default::default()
        },
        dedup,
        block_index: FxHashMap::default(),
        tail_index: FxHashMap::default(),
        open_tails: Vec::new(),
    };

    for entry in files {
        map_one_file(&mut state, &entry)?;
    }

    // Seal the open tail blocks with their content hashes
    for tail in &state.open_tails {
        let block = &mut state.map.blocks[tail.block];
        let (crc, hash) = block_checksums(&tail.data);
        block.crc = crc;
        block.hash = hash;
        block.size = tail.data.len() as u64;
    }

    state.map.dirs = dirs.into_iter().map(|name| InputDir { name }).collect();

    debug!(
        "mapped {} files into {} blocks, {} slices, {} chunks",
        state.map.files.len(),
        state.map.blocks.len(),
        state.map.slices.len(),
        state.map.chunks.len()
    );
    Ok(state.map)
}

fn map_one_file(state: &mut MapperState, entry: &InputEntry) -> Result<()> {
    let file_index = FileIndex(state.map.files.len() as u32);
    let block_size = state.map.block_size;
    let first_chunk = state.map.chunks.len();

    let mut reader = BufReader::with_capacity(1 << 20, File::open(&entry.path)?);
    let mut fingerprint = Fingerprint::new();
    let mut head = Vec::with_capacity(16384.min(entry.size as usize));

    let full_blocks = entry.size / block_size;
    let tail_size = entry.size % block_size;

    // Chunk under construction: (size so far, first block index)
    let mut chunk: Option<(u64, u64)> = None;
    let mut buffer = vec![0u8; block_size as usize];

    for slot in 0..full_blocks {
        reader.read_exact(&mut buffer)?;
        fingerprint.update(&buffer);
        take_head(&mut head, &buffer);

        let (crc, hash) = block_checksums(&buffer);
        let block = match lookup_block(state, crc, hash) {
            Some(found) => found,
            None => {
                let block = state.map.blocks.len() as u64;
                state.map.blocks.push(Block {
                    state: BLOCK_HAS_FULL,
                    size: block_size,
                    crc,
                    hash,
                    ..Default::default()
                });
                if state.dedup >= DEDUP_BLOCKS {
                    state.block_index.insert((crc.as_u64(), hash), block);
                }
                block
            }
        };

        let slice = SliceIndex(state.map.slices.len());
        state.map.slices.push(Slice {
            file: file_index,
            file_offset: slot * block_size,
            block: BlockIndex(block),
            tail_offset: 0,
            size: block_size,
            found_in: None,
        });
        state.map.blocks[block as usize].slices.push(slice);

        // Extend the running chunk while blocks stay consecutive
        chunk = match chunk {
            Some((size, first)) if first + size / block_size == block => {
                Some((size + block_size, first))
            }
            Some((size, first)) => {
                state.map.chunks.push(Chunk::Protected {
                    size,
                    first_block: first,
                    tail: Tail::None,
                });
                Some((block_size, block))
            }
            None => Some((block_size, block)),
        };
    }

    // Remainder of the file
    let tail = if tail_size == 0 {
        Tail::None
    } else {
        let mut tail_data = vec![0u8; tail_size as usize];
        reader.read_exact(&mut tail_data)?;
        fingerprint.update(&tail_data);
        take_head(&mut head, &tail_data);

        if tail_size < MIN_PACKED_TAIL {
            Tail::Inline(tail_data)
        } else {
            let crc = crc64(&tail_data);
            let hash = blake3_128(&tail_data);
            let (block, offset) = place_tail(state, file_index, &tail_data, crc, hash);
            Tail::Packed {
                crc: crc64(&tail_data[..MIN_PACKED_TAIL as usize]),
                hash,
                block,
                offset,
            }
        }
    };

    match (chunk, &tail) {
        (Some((size, first)), _) => state.map.chunks.push(Chunk::Protected {
            size: size + tail_size,
            first_block: first,
            tail: tail.clone(),
        }),
        (None, Tail::None) => {} // empty file, no chunks
        (None, _) => state.map.chunks.push(Chunk::Protected {
            size: tail_size,
            first_block: 0,
            tail: tail.clone(),
        }),
    }

    state.map.files.push(InputFile {
        name: entry.name.clone(),
        size: entry.size,
        crc_16k: crc64(&head),
        hash: fingerprint.finalize_128(),
        chunks: first_chunk..state.map.chunks.len(),
        options: Vec::new(),
        state: 0,
    });
    Ok(())
}

fn take_head(head: &mut Vec<u8>, data: &[u8]) {
    let want = 16384usize.saturating_sub(head.len());
    head.extend_from_slice(&data[..want.min(data.len())]);
}

fn lookup_block(state: &MapperState, crc: Crc64Value, hash: Hash128) -> Option<u64> {
    if state.dedup < DEDUP_BLOCKS {
        return None;
    }
    state.block_index.get(&(crc.as_u64(), hash)).copied()
}

/// First-fit a tail into the open tail blocks, or open a new one.
fn place_tail(
    state: &mut MapperState,
    file: FileIndex,
    tail_data: &[u8],
    crc: Crc64Value,
    hash: Hash128,
) -> (u64, u64) {
    let len = tail_data.len() as u64;
    // The tail starts after all of the file's full-block slices
    let file_offset = state
        .map
        .slices
        .iter()
        .rev()
        .take_while(|s| s.file == file)
        .map(|s| s.size)
        .sum::<u64>();

    // Duplicate tail content shares its block range
    if state.dedup >= DEDUP_FULL {
        if let Some(&(block, offset)) = state.tail_index.get(&(crc.as_u64(), hash, len)) {
            let slice = SliceIndex(state.map.slices.len());
            state.map.slices.push(Slice {
                file,
                file_offset,
                block: BlockIndex(block),
                tail_offset: offset,
                size: len,
                found_in: None,
            });
            state.map.blocks[block as usize].slices.push(slice);
            return (block, offset);
        }
    }

    let block_size = state.map.block_size;
    let slot = state
        .open_tails
        .iter()
        .position(|t| t.data.len() as u64 + len <= block_size);
    let slot = match slot {
        Some(slot) => slot,
        None => {
            let block = state.map.blocks.len();
            state.map.blocks.push(Block {
                state: BLOCK_HAS_TAILS,
                ..Default::default()
            });
            state.open_tails.push(TailBlock {
                block,
                data: Vec::with_capacity(block_size as usize),
            });
            state.open_tails.len() - 1
        }
    };

    let tail_block = &mut state.open_tails[slot];
    let offset = tail_block.data.len() as u64;
    tail_block.data.extend_from_slice(tail_data);
    let block = tail_block.block as u64;

    let slice = SliceIndex(state.map.slices.len());
    state.map.slices.push(Slice {
        file,
        file_offset,
        block: BlockIndex(block),
        tail_offset: offset,
        size: len,
        found_in: None,
    });
    state.map.blocks[block as usize].slices.push(slice);

    if state.dedup >= DEDUP_FULL {
        state
            .tail_index
            .insert((crc.as_u64(), hash, len), (block, offset));
    }
    (block, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_input(dir: &TempDir, name: &str, data: &[u8]) -> InputEntry {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(data).unwrap();
        InputEntry {
            name: name.to_string(),
            path,
            size: data.len() as u64,
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let x = (i as u32).wrapping_add(seed as u32).wrapping_mul(2654435761);
                (x >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn single_file_maps_to_full_blocks_and_tail() {
        let dir = TempDir::new().unwrap();
        let entry = write_input(&dir, "a.bin", &pattern(2500, 1));
        let map = map_inputs(vec![entry], vec![], 1024, DEDUP_OFF).unwrap();

        // 2 full blocks and one tail block holding the 452-byte remainder
        assert_eq!(map.blocks.len(), 3);
        assert_eq!(map.blocks[0].state & BLOCK_HAS_FULL, BLOCK_HAS_FULL);
        assert_eq!(map.blocks[2].state & BLOCK_HAS_TAILS, BLOCK_HAS_TAILS);
        assert_eq!(map.blocks[2].size, 2500 - 2048);
        assert_eq!(map.slices.len(), 3);
        assert_eq!(map.chunks.len(), 1);
        map.check_invariants().unwrap();
    }

    #[test]
    fn file_of_exactly_one_block_has_no_tail() {
        let dir = TempDir::new().unwrap();
        let entry = write_input(&dir, "exact.bin", &pattern(1024, 2));
        let map = map_inputs(vec![entry], vec![], 1024, DEDUP_OFF).unwrap();
        assert_eq!(map.blocks.len(), 1);
        assert_eq!(map.slices.len(), 1);
        match &map.chunks[0] {
            Chunk::Protected { size, tail, .. } => {
                assert_eq!(*size, 1024);
                assert_eq!(*tail, Tail::None);
            }
            other => panic!("unexpected chunk {other:?}"),
        }
    }

    #[test]
    fn tiny_file_is_inlined_without_blocks() {
        let dir = TempDir::new().unwrap();
        let data = pattern(39, 3);
        let entry = write_input(&dir, "tiny.bin", &data);
        let map = map_inputs(vec![entry], vec![], 1024, DEDUP_OFF).unwrap();
        assert!(map.blocks.is_empty());
        assert!(map.slices.is_empty());
        match &map.chunks[0] {
            Chunk::Protected { tail: Tail::Inline(bytes), .. } => assert_eq!(bytes, &data),
            other => panic!("unexpected chunk {other:?}"),
        }
        map.check_invariants().unwrap();
    }

    #[test]
    fn tails_pack_into_a_shared_block() {
        let dir = TempDir::new().unwrap();
        let a = write_input(&dir, "a.bin", &pattern(1500, 4));
        let b = write_input(&dir, "b.bin", &pattern(500, 5));
        let map = map_inputs(vec![a, b], vec![], 1024, DEDUP_OFF).unwrap();

        // One full block from a, one tail block packing 476 + 500
        assert_eq!(map.blocks.len(), 2);
        let tail_block = &map.blocks[1];
        assert_eq!(tail_block.size, 476 + 500);
        assert_eq!(tail_block.slices.len(), 2);

        let offsets: Vec<u64> = tail_block
            .slices
            .iter()
            .map(|&s| map.slices[s.0].tail_offset)
            .collect();
        assert_eq!(offsets, vec![0, 476]);
        map.check_invariants().unwrap();
    }

    #[test]
    fn overflowing_tail_opens_a_second_block() {
        let dir = TempDir::new().unwrap();
        let a = write_input(&dir, "a.bin", &pattern(1500, 6));
        let b = write_input(&dir, "b.bin", &pattern(600, 7));
        let map = map_inputs(vec![a, b], vec![], 1024, DEDUP_OFF).unwrap();

        // 476 + 600 exceeds the block size, so the tails cannot share
        assert_eq!(map.blocks.len(), 3);
        map.check_invariants().unwrap();
    }

    #[test]
    fn duplicate_content_shares_blocks_under_dedup() {
        let dir = TempDir::new().unwrap();
        let data = pattern(10240, 8);
        let a = write_input(&dir, "a.bin", &data);
        let copy = write_input(&dir, "a.copy.bin", &data);
        let map = map_inputs(vec![a, copy], vec![], 1024, DEDUP_FULL).unwrap();

        assert_eq!(map.blocks.len(), 10);
        assert_eq!(map.slices.len(), 20);
        // Both files' chunks reference the same first block
        let firsts: Vec<u64> = map
            .chunks
            .iter()
            .map(|c| match c {
                Chunk::Protected { first_block, .. } => *first_block,
                _ => panic!(),
            })
            .collect();
        assert_eq!(firsts, vec![0, 0]);
        map.check_invariants().unwrap();
    }

    #[test]
    fn without_dedup_duplicate_content_is_mapped_twice() {
        let dir = TempDir::new().unwrap();
        let data = pattern(4096, 9);
        let a = write_input(&dir, "a.bin", &data);
        let b = write_input(&dir, "b.bin", &data);
        let map = map_inputs(vec![a, b], vec![], 1024, DEDUP_OFF).unwrap();
        assert_eq!(map.blocks.len(), 8);
    }

    #[test]
    fn files_process_largest_first() {
        let dir = TempDir::new().unwrap();
        let small = write_input(&dir, "small.bin", &pattern(100, 10));
        let large = write_input(&dir, "large.bin", &pattern(5000, 11));
        let map = map_inputs(vec![small, large], vec![], 1024, DEDUP_OFF).unwrap();
        assert_eq!(map.files[0].name, "large.bin");
        assert_eq!(map.files[1].name, "small.bin");
    }
}
