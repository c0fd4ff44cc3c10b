//! Verification: whole-file checks, sliding-window search, misnamed files
//!
//! Each input file gets a fast sequential check first; only files that
//! fail it are slide-scanned. The scan keeps a rolling CRC-64 over a
//! block-size window (and a second 40-byte window for chunk tails),
//! probes a hash set of known checksums at every byte offset, and confirms
//! candidates with the 16-byte fingerprint before marking a block found.
//! Extra files are matched against missing inputs by size and full hash
//! (misnamed detection) and then scanned like damaged files so their
//! surviving blocks count toward repair.

use crate::block::{
    misnamed_state, Block, BlockMap, Chunk, Tail, BLOCK_FOUND, BLOCK_HAS_FULL, BLOCK_HAS_TAILS,
    FILE_BAD_PERMISSIONS, FILE_BAD_TIMESTAMP, FILE_DAMAGED, FILE_MISSING,
    FILE_UNPROTECTED_CHUNKS,
};
use crate::checksum::{blake3_128, crc64, CrcWindow};
use crate::domain::{FileIndex, SliceIndex};
use crate::error::Result;
use crate::packets::file_packet::MIN_PACKED_TAIL;
use crate::packets::PacketSet;
use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Soft wall-clock budget for the sliding search, in milliseconds.
    pub search_limit_ms: Option<u64>,
    /// Suppress the per-file verdict lines.
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyVerdict {
    AllCorrect,
    RepairPossible,
    RepairNotPossible,
}

#[derive(Debug)]
pub struct VerifyReport {
    pub verdict: VerifyVerdict,
    pub map: BlockMap,
    /// Paths indexed by the `found_in` file indices: input files first,
    /// then every extra file that was scanned.
    pub search_paths: Vec<PathBuf>,
    pub complete_files: usize,
    pub damaged_files: usize,
    pub missing_files: usize,
    pub misnamed_files: usize,
    /// Files whose content is intact but whose stored permissions or
    /// timestamps no longer match.
    pub bad_property_files: usize,
    pub known_blocks: u64,
    pub lost_blocks: u64,
    /// Distinct usable recovery block indices, per cohort.
    pub recovery_per_cohort: Vec<u64>,
    pub cohorts: u32,
}

impl VerifyReport {
    pub fn repair_required(&self) -> bool {
        self.map.files.iter().any(|f| f.state != 0) || self.lost_blocks > 0
    }
}

/// Is a block's content fully recoverable from scan results alone?
///
/// Full blocks are known once their fingerprint matched somewhere. Tail
/// blocks are known when every byte of their data range is covered by a
/// found slice.
pub fn block_known(map: &BlockMap, block: &Block) -> bool {
    if block.state & BLOCK_FOUND != 0 {
        return true;
    }
    if block.state & BLOCK_HAS_TAILS == 0 {
        return false;
    }
    // Coverage check over the found tail slices
    let mut ranges: Vec<(u64, u64)> = block
        .slices
        .iter()
        .map(|&s| &map.slices[s.0])
        .filter(|s| s.found_in.is_some())
        .map(|s| (s.tail_offset, s.tail_offset + s.size))
        .collect();
    ranges.sort_unstable();
    let mut covered = 0u64;
    for (begin, end) in ranges {
        if begin > covered {
            return false;
        }
        covered = covered.max(end);
    }
    covered >= block.size
}

pub fn verify(
    set: &PacketSet,
    base: &Path,
    extra_files: &[PathBuf],
    options: &VerifyOptions,
) -> Result<VerifyReport> {
    let mut map = BlockMap::from_packets(set)?;
    let mut search_paths: Vec<PathBuf> =
        map.files.iter().map(|f| base.join(&f.name)).collect();

    let mut complete_files = 0usize;
    let mut damaged_files = 0usize;
    let mut missing_files = 0usize;
    let mut misnamed_files = 0usize;
    let mut bad_property_files = 0usize;

    let probes = ProbeIndex::build(&map);
    let deadline = options
        .search_limit_ms
        .map(|ms| Instant::now() + std::time::Duration::from_millis(ms));

    // Pass 1: files on disk at their recorded names
    for index in 0..map.files.len() {
        let file_index = FileIndex(index as u32);
        let path = search_paths[index].clone();
        let name = map.files[index].name.clone();

        let metadata = match std::fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            _ => {
                map.files[index].state |= FILE_MISSING;
                missing_files += 1;
                if !options.quiet {
                    println!("Target: \"{name}\" - missing.");
                }
                continue;
            }
        };

        if metadata.len() == map.files[index].size
            && check_file_complete(&mut map, file_index, &path)?
        {
            complete_files += 1;
            let bad = check_file_properties(set, &path, &map.files[index].options)?;
            map.files[index].state |= bad;
            if bad != 0 {
                bad_property_files += 1;
            }
            if !options.quiet {
                if bad & FILE_BAD_PERMISSIONS != 0 {
                    println!("Target: \"{name}\" - different permissions.");
                } else if bad & FILE_BAD_TIMESTAMP != 0 {
                    println!("Target: \"{name}\" - different timestamp.");
                } else {
                    println!("Target: \"{name}\" - complete.");
                }
            }
            continue;
        }

        map.files[index].state |= FILE_DAMAGED;
        damaged_files += 1;
        let found = scan_for_blocks(&mut map, &probes, file_index, &path, deadline)?;
        if !options.quiet {
            println!(
                "Target: \"{name}\" - damaged. {found} of {} bytes available.",
                map.files[index].size
            );
        }
    }

    // Pass 2: extra files, misnamed matching first, then block salvage
    for extra in extra_files {
        let scan_index = FileIndex(search_paths.len() as u32);
        search_paths.push(extra.clone());

        let size = match std::fs::metadata(extra) {
            Ok(m) if m.is_file() => m.len(),
            _ => continue,
        };

        if let Some(owner) = match_misnamed(&mut map, extra, size)? {
            misnamed_files += 1;
            let owner_index = owner.as_usize();
            map.files[owner_index].state = misnamed_state(scan_index.as_usize());
            mark_file_found_at(&mut map, owner, scan_index);
            if !options.quiet {
                println!(
                    "File: \"{}\" - is a match for \"{}\".",
                    extra.display(),
                    map.files[owner_index].name
                );
            }
            continue;
        }

        let found = scan_for_blocks(&mut map, &probes, scan_index, extra, deadline)?;
        if found > 0 {
            debug!("extra file {} held {found} bytes", extra.display());
            if !options.quiet {
                println!("File: \"{}\" - found {found} bytes.", extra.display());
            }
        }
    }

    // Blocks stored verbatim in data volumes count as found; their
    // packets were already checksum-verified during the scan
    for meta in &set.data {
        let Some(block) = map.blocks.get_mut(meta.block_index as usize) else {
            continue;
        };
        if block.state & BLOCK_FOUND != 0 || meta.payload_len < block.size {
            continue;
        }
        let scan_index = match search_paths.iter().position(|p| *p == meta.source) {
            Some(at) => FileIndex(at as u32),
            None => {
                search_paths.push(meta.source.clone());
                FileIndex(search_paths.len() as u32 - 1)
            }
        };
        block.state |= BLOCK_FOUND;
        block.found_in = Some((scan_index, meta.payload_offset));
    }

    // Tally blocks and decide the verdict
    let cohorts = set.matrix.cohorts();
    let mut known_blocks = 0u64;
    let mut lost_per_cohort = vec![0u64; cohorts as usize];
    for (index, block) in map.blocks.iter().enumerate() {
        if block_known(&map, block) {
            known_blocks += 1;
        } else {
            lost_per_cohort[index % cohorts as usize] += 1;
        }
    }
    let lost_blocks: u64 = lost_per_cohort.iter().sum();

    let mut recovery_per_cohort = vec![0u64; cohorts as usize];
    let mut seen_recovery = FxHashSet::default();
    for meta in set.usable_recovery() {
        if seen_recovery.insert(meta.recovery_index) {
            recovery_per_cohort[(meta.recovery_index % cohorts as u64) as usize] += 1;
        }
    }

    let repair_required = lost_blocks > 0
        || missing_files + damaged_files + misnamed_files > 0;
    let verdict = if !repair_required {
        VerifyVerdict::AllCorrect
    } else if lost_per_cohort
        .iter()
        .zip(&recovery_per_cohort)
        .all(|(&lost, &have)| lost <= have)
    {
        VerifyVerdict::RepairPossible
    } else {
        VerifyVerdict::RepairNotPossible
    };

    if !options.quiet {
        match verdict {
            VerifyVerdict::AllCorrect => {
                println!("All files are correct, repair is not required.")
            }
            VerifyVerdict::RepairPossible => println!("Repair is possible."),
            VerifyVerdict::RepairNotPossible => println!("Repair is not possible."),
        }
    }

    Ok(VerifyReport {
        verdict,
        map,
        search_paths,
        complete_files,
        damaged_files,
        missing_files,
        misnamed_files,
        bad_property_files,
        known_blocks,
        lost_blocks,
        recovery_per_cohort,
        cohorts,
    })
}

/// Compare a complete file's current metadata against its stored option
/// packets. Returns the property-mismatch state bits.
fn check_file_properties(set: &PacketSet, path: &Path, options: &[[u8; 16]]) -> Result<u32> {
    if options.is_empty() {
        return Ok(0);
    }
    let metadata = std::fs::metadata(path)?;
    let mut bits = 0u32;
    for checksum in options {
        match set.permission(checksum) {
            Some(crate::packets::PermissionsPacket::Unix(stored)) => {
                let current =
                    crate::packets::UnixPermissionsPacket::from_metadata(&metadata);
                if stored.mtime != current.mtime {
                    bits |= FILE_BAD_TIMESTAMP;
                }
                if stored.mode != current.mode {
                    bits |= FILE_BAD_PERMISSIONS;
                }
            }
            Some(crate::packets::PermissionsPacket::Fat(stored)) => {
                let current =
                    crate::packets::FatPermissionsPacket::from_metadata(&metadata);
                if stored.write_time != current.write_time {
                    bits |= FILE_BAD_TIMESTAMP;
                }
            }
            None => {
                debug!("option packet {:02x?} not found in the set", &checksum[..4]);
            }
        }
    }
    Ok(bits)
}

// ----------------------------------------------------------------------
// Fast path
// ----------------------------------------------------------------------

/// Sequentially verify a file that has the right size. On success, every
/// block and tail slice it carries is marked found at its natural offset.
fn check_file_complete(map: &mut BlockMap, file_index: FileIndex, path: &Path) -> Result<bool> {
    let mut reader = std::io::BufReader::with_capacity(1 << 20, File::open(path)?);
    let block_size = map.block_size;
    let file = map.files[file_index.as_usize()].clone();

    struct FoundBlock {
        block: u64,
        offset: u64,
    }
    struct FoundTail {
        slice: SliceIndex,
        offset: u64,
    }
    let mut found_blocks = Vec::new();
    let mut found_tails = Vec::new();

    let mut offset = 0u64;
    let mut buffer = vec![0u8; block_size as usize];
    for chunk in &map.chunks[file.chunks.clone()] {
        match chunk {
            Chunk::Unprotected { length } => {
                // Content is unprotected; only its length is checked
                reader.seek(SeekFrom::Current(*length as i64))?;
                offset += length;
            }
            Chunk::Protected {
                size,
                first_block,
                tail,
            } => {
                let full = size / block_size;
                for i in 0..full {
                    if reader.read_exact(&mut buffer).is_err() {
                        return Ok(false);
                    }
                    let block = &map.blocks[(first_block + i) as usize];
                    if crc64(&buffer) != block.crc || blake3_128(&buffer) != block.hash {
                        return Ok(false);
                    }
                    found_blocks.push(FoundBlock {
                        block: first_block + i,
                        offset,
                    });
                    offset += block_size;
                }
                match tail {
                    Tail::None => {}
                    Tail::Inline(bytes) => {
                        let mut data = vec![0u8; bytes.len()];
                        if reader.read_exact(&mut data).is_err() || &data != bytes {
                            return Ok(false);
                        }
                        offset += bytes.len() as u64;
                    }
                    Tail::Packed {
                        hash,
                        block,
                        offset: tail_offset,
                        ..
                    } => {
                        let tail_size = size % block_size;
                        let mut data = vec![0u8; tail_size as usize];
                        if reader.read_exact(&mut data).is_err() || blake3_128(&data) != *hash {
                            return Ok(false);
                        }
                        if let Some(slice) = find_tail_slice(map, file_index, *block, *tail_offset)
                        {
                            found_tails.push(FoundTail {
                                slice,
                                offset,
                            });
                        }
                        offset += tail_size;
                    }
                }
            }
        }
    }
    if offset != file.size {
        return Ok(false);
    }

    for found in found_blocks {
        let block = &mut map.blocks[found.block as usize];
        block.state |= BLOCK_FOUND;
        block.found_in.get_or_insert((file_index, found.offset));
    }
    for found in found_tails {
        map.slices[found.slice.0]
            .found_in
            .get_or_insert((file_index, found.offset));
    }
    Ok(true)
}

fn find_tail_slice(
    map: &BlockMap,
    file: FileIndex,
    block: u64,
    tail_offset: u64,
) -> Option<SliceIndex> {
    map.blocks[block as usize]
        .slices
        .iter()
        .copied()
        .find(|&s| {
            let slice = &map.slices[s.0];
            slice.file == file && slice.tail_offset == tail_offset
        })
}

/// A misnamed extra file is byte-identical to a missing or damaged input,
/// so all of that input's blocks are present at their natural offsets.
fn mark_file_found_at(map: &mut BlockMap, owner: FileIndex, scan_index: FileIndex) {
    let slice_list: Vec<SliceIndex> = map
        .slices_of_file(owner)
        .map(|(index, _)| index)
        .collect();
    for slice_index in slice_list {
        let slice = map.slices[slice_index.0].clone();
        if slice.size == map.block_size {
            let block = &mut map.blocks[slice.block.as_usize()];
            block.state |= BLOCK_FOUND;
            block.found_in.get_or_insert((scan_index, slice.file_offset));
        } else {
            map.slices[slice_index.0]
                .found_in
                .get_or_insert((scan_index, slice.file_offset));
        }
    }
}

fn match_misnamed(map: &mut BlockMap, path: &Path, size: u64) -> Result<Option<FileIndex>> {
    let candidates: Vec<usize> = map
        .files
        .iter()
        .enumerate()
        .filter(|(_, f)| {
            f.needs_restore() && f.size == size && f.state & FILE_UNPROTECTED_CHUNKS == 0
        })
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        return Ok(None);
    }

    let mut hasher = blake3::Hasher::new();
    let mut reader = std::io::BufReader::with_capacity(1 << 20, File::open(path)?);
    let mut buffer = vec![0u8; 1 << 20];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&hasher.finalize().as_bytes()[..16]);

    Ok(candidates
        .into_iter()
        .find(|&i| map.files[i].hash == hash)
        .map(|i| FileIndex(i as u32)))
}

// ----------------------------------------------------------------------
// Sliding search
// ----------------------------------------------------------------------

/// Checksum probes shared by every scan of one verify run.
struct ProbeIndex {
    /// CRC-64 of a full block -> candidate block indices.
    blocks: FxHashMap<u64, SmallVec<[u64; 1]>>,
    /// CRC-64 of a tail's first 40 bytes -> candidate tail slices.
    tails: FxHashMap<u64, SmallVec<[TailProbe; 1]>>,
    block_window: CrcWindow,
    tail_window: CrcWindow,
}

#[derive(Clone, Copy)]
struct TailProbe {
    slice: SliceIndex,
    size: u64,
    hash: crate::domain::Hash128,
}

impl ProbeIndex {
    fn build(map: &BlockMap) -> Self {
        let mut blocks: FxHashMap<u64, SmallVec<[u64; 1]>> = FxHashMap::default();
        for (index, block) in map.blocks.iter().enumerate() {
            if block.state & BLOCK_HAS_FULL != 0 {
                blocks
                    .entry(block.crc.as_u64())
                    .or_default()
                    .push(index as u64);
            }
        }

        let mut tails: FxHashMap<u64, SmallVec<[TailProbe; 1]>> = FxHashMap::default();
        for (file_index, file) in map.files.iter().enumerate() {
            for chunk in &map.chunks[file.chunks.clone()] {
                if let Chunk::Protected {
                    size,
                    tail:
                        Tail::Packed {
                            crc,
                            hash,
                            block,
                            offset,
                        },
                    ..
                } = chunk
                {
                    let tail_size = size % map.block_size;
                    if let Some(slice) =
                        find_tail_slice(map, FileIndex(file_index as u32), *block, *offset)
                    {
                        tails.entry(crc.as_u64()).or_default().push(TailProbe {
                            slice,
                            size: tail_size,
                            hash: *hash,
                        });
                    }
                }
            }
        }

        ProbeIndex {
            blocks,
            tails,
            block_window: CrcWindow::new(map.block_size),
            tail_window: CrcWindow::new(MIN_PACKED_TAIL),
        }
    }
}

/// Buffered view over a file for the sliding windows: keeps a segment of
/// the file in memory and refills on demand.
struct ScanBuffer {
    file: File,
    file_len: u64,
    base: u64,
    data: Vec<u8>,
}

impl ScanBuffer {
    fn new(path: &Path, keep: usize) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(ScanBuffer {
            file,
            file_len,
            base: 0,
            data: Vec::with_capacity(keep),
        })
    }

    /// Bytes `[pos, pos + len)`; `None` past end of file.
    fn bytes(&mut self, pos: u64, len: usize) -> std::io::Result<Option<&[u8]>> {
        if pos + len as u64 > self.file_len {
            return Ok(None);
        }
        if pos < self.base || pos + len as u64 > self.base + self.data.len() as u64 {
            // Refill from pos; read generously to amortize the syscalls
            let want = (len.max(1 << 20) as u64).min(self.file_len - pos) as usize;
            self.data.resize(want, 0);
            self.file.seek(SeekFrom::Start(pos))?;
            self.file.read_exact(&mut self.data[..want])?;
            self.base = pos;
        }
        let at = (pos - self.base) as usize;
        Ok(Some(&self.data[at..at + len]))
    }
}

/// Slide over one file, marking every block and tail whose checksums match.
/// Returns the number of bytes recognized in this file.
fn scan_for_blocks(
    map: &mut BlockMap,
    probes: &ProbeIndex,
    scan_index: FileIndex,
    path: &Path,
    deadline: Option<Instant>,
) -> Result<u64> {
    let block_size = map.block_size;
    let tail_window = MIN_PACKED_TAIL;
    let mut buffer = ScanBuffer::new(path, 2 * block_size as usize + 1024)?;
    if buffer.file_len < tail_window {
        return Ok(0);
    }

    let mut found_bytes = 0u64;
    let mut pos = 0u64;
    let mut crc_block = buffer
        .bytes(0, block_size as usize)?
        .map(|window| crc64(window));
    let mut crc_tail = buffer
        .bytes(0, tail_window as usize)?
        .map(|window| crc64(window));
    let mut steps = 0u32;

    loop {
        if let Some(deadline) = deadline {
            steps = steps.wrapping_add(1);
            if steps % 4096 == 0 && Instant::now() >= deadline {
                debug!("search limit reached while scanning {}", path.display());
                break;
            }
        }

        // Full-block probe with fingerprint confirmation
        let mut jumped = false;
        if let Some(crc) = crc_block {
            if let Some(candidates) = probes.blocks.get(&crc.as_u64()) {
                let candidates = candidates.clone();
                let window = buffer.bytes(pos, block_size as usize)?.unwrap().to_vec();
                let hash = blake3_128(&window);
                for candidate in candidates {
                    let block = &mut map.blocks[candidate as usize];
                    if hash == block.hash {
                        if block.state & BLOCK_FOUND == 0 {
                            block.state |= BLOCK_FOUND;
                            block.found_in = Some((scan_index, pos));
                            found_bytes += block_size;
                        }
                        jumped = true;
                    }
                }
            }
        }

        if let Some(crc) = crc_tail {
            if let Some(candidates) = probes.tails.get(&crc.as_u64()) {
                for probe in candidates.clone() {
                    if map.slices[probe.slice.0].found_in.is_some() {
                        continue;
                    }
                    if let Some(tail) = buffer.bytes(pos, probe.size as usize)? {
                        if blake3_128(tail) == probe.hash {
                            map.slices[probe.slice.0].found_in = Some((scan_index, pos));
                            found_bytes += probe.size;
                        }
                    }
                }
            }
        }

        // Advance: a whole block on a hit, one byte otherwise
        let step = if jumped { block_size } else { 1 };
        pos += step;
        if pos + tail_window > buffer.file_len {
            break;
        }
        if step == 1 {
            crc_block = match crc_block {
                Some(crc) => {
                    match buffer.bytes(pos - 1, block_size as usize + 1)? {
                        Some(span) => Some(probes.block_window.slide(
                            crc,
                            span[block_size as usize],
                            span[0],
                        )),
                        None => None,
                    }
                }
                None => None,
            };
            crc_tail = match crc_tail {
                Some(crc) => match buffer.bytes(pos - 1, tail_window as usize + 1)? {
                    Some(span) => Some(probes.tail_window.slide(
                        crc,
                        span[tail_window as usize],
                        span[0],
                    )),
                    None => None,
                },
                None => None,
            };
        } else {
            crc_block = buffer
                .bytes(pos, block_size as usize)?
                .map(|window| crc64(window));
            crc_tail = buffer
                .bytes(pos, tail_window as usize)?
                .map(|window| crc64(window));
        }
    }

    Ok(found_bytes)
}
