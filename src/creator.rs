//! Create pipeline: map inputs, build packets, compute recovery, emit files
//!
//! Control flow: scan inputs → choose block size → map slices → generate
//! Set-ID → build the common packet block (Start, Matrix, File, Directory,
//! Root, External Data) → lay out recovery volumes → write volume
//! structure → fill recovery payloads → patch packet checksums.
//!
//! Recovery payloads are filled after the volume skeletons exist so the
//! same code path serves both the in-memory case and the memory-limited
//! split case, where every block is processed in byte sub-ranges and a
//! packet's checksum can only be computed once its payload is complete.

use crate::block::{Block, BlockMap, Chunk, Tail, BLOCK_HAS_FULL};
use crate::checksum::blake3_64;
use crate::codec::cauchy::CauchyCodec;
use crate::codec::fft::{encode_work_count, FftCodec};
use crate::codec::{select_field, EccMethod, FieldChoice};
use crate::domain::{PacketChecksum, SetId};
use crate::error::{Error, Result};
use crate::file_ops::HandleCache;
use crate::galois::{cauchy_region_size, fft_region_size, region_create_parity};
use crate::map::{map_inputs, InputEntry};
use crate::packets::{
    self, data_packet, make_packet, make_recovery_packet, text_packet, CauchyMatrixPacket,
    DirectoryPacket, ExternalDataPacket, FatPermissionsPacket, FftMatrixPacket, FilePacket,
    MatrixPacket, PermissionsPacket, RootPacket, StartPacket, UnixPermissionsPacket,
};
use log::debug;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// How recovery blocks are distributed over volume files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryFileScheme {
    /// Volume `k` carries `min(2^k, remaining)` blocks.
    PowerOfTwo,
    /// `N` volumes of near-equal size.
    Uniform(u32),
    /// `N` volumes, sizes doubling from a computed base.
    Variable(u32),
    /// Power-of-two growth capped so no volume exceeds this many bytes.
    LimitSize(u64),
}

#[derive(Debug, Clone)]
pub struct CreatorOptions {
    pub block_size: Option<u64>,
    pub block_count: Option<u64>,
    pub redundancy_percent: u64,
    pub recovery_count: Option<u64>,
    pub first_recovery: u64,
    pub max_recovery: u64,
    pub scheme: RecoveryFileScheme,
    pub store_data_packets: bool,
    /// Store UNIX Permissions Packets for the input files.
    pub unix_permissions: bool,
    /// Store FAT Permissions Packets for the input files.
    pub fat_permissions: bool,
    pub dedup: u8,
    pub ecc: EccMethod,
    /// Extra cohorts for the FFT code; cohort count is `interleave + 1`.
    pub interleave: u32,
    pub repetition_limit: u32,
    pub memory_limit: u64,
    pub absolute_path: Option<String>,
    pub comment: Option<String>,
    pub trial: bool,
}

impl Default for CreatorOptions {
    fn default() -> Self {
        CreatorOptions {
            block_size: None,
            block_count: None,
            redundancy_percent: 0,
            recovery_count: None,
            first_recovery: 0,
            max_recovery: 0,
            scheme: RecoveryFileScheme::PowerOfTwo,
            store_data_packets: false,
            unix_permissions: false,
            fat_permissions: false,
            dedup: 0,
            ecc: EccMethod::Cauchy,
            interleave: 0,
            repetition_limit: 0,
            memory_limit: 0,
            absolute_path: None,
            comment: None,
            trial: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedFile {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug)]
pub struct CreateReport {
    pub set_id: SetId,
    pub block_size: u64,
    pub block_count: u64,
    pub recovery_count: u64,
    pub field: FieldChoice,
    pub files: Vec<CreatedFile>,
}

/// Default block size when neither a size nor a count is requested.
const DEFAULT_BLOCK_SIZE: u64 = 65536;

pub fn choose_block_size(total_size: u64, options: &CreatorOptions) -> Result<u64> {
    let size = match (options.block_size, options.block_count) {
        (Some(size), _) => size,
        (None, Some(count)) if count > 0 => total_size.div_ceil(count),
        (None, _) => DEFAULT_BLOCK_SIZE,
    };
    // Field elements must not straddle the block boundary
    let size = size.max(40).next_multiple_of(4);
    Ok(size)
}

/// Create a PAR3 set. `index_path` names the `<base>.par3` index file;
/// volumes are placed next to it.
pub fn create(
    base: &Path,
    inputs: Vec<InputEntry>,
    dirs: Vec<String>,
    index_path: &Path,
    options: &CreatorOptions,
) -> Result<CreateReport> {
    let total_size: u64 = inputs.iter().map(|e| e.size).sum();
    let block_size = choose_block_size(total_size, options)?;

    let map = map_inputs(inputs, dirs, block_size, options.dedup)?;
    map.check_invariants().map_err(Error::Logic)?;
    let block_count = map.block_count();

    let recovery_count = match options.recovery_count {
        Some(count) => count,
        None if options.redundancy_percent > 0 => {
            (block_count * options.redundancy_percent).div_ceil(100)
        }
        None => 0,
    };

    let cohorts = match options.ecc {
        EccMethod::Fft => options.interleave + 1,
        EccMethod::Cauchy => 1,
    };
    // Cohort geometry requires the recovery range to split evenly
    let first_recovery = options.first_recovery.next_multiple_of(cohorts as u64);
    let recovery_count = recovery_count.next_multiple_of(cohorts as u64);
    let max_recovery = options
        .max_recovery
        .max(first_recovery + recovery_count)
        .next_multiple_of(cohorts as u64);

    let field = select_field(
        options.ecc,
        block_count,
        first_recovery,
        recovery_count,
        max_recovery,
        cohorts,
    )
    .map_err(|e| Error::Logic(e.to_string()))?;

    let start = StartPacket::new(block_size, field);
    let set_id = generate_set_id(&map, options.absolute_path.as_deref(), &start);

    let matrix = match options.ecc {
        EccMethod::Cauchy => MatrixPacket::Cauchy(CauchyMatrixPacket {
            first_recovery,
            last_recovery: 0,
            max_recovery_hint: options.max_recovery,
        }),
        EccMethod::Fft => MatrixPacket::Fft(FftMatrixPacket {
            first_recovery,
            last_recovery: 0,
            log2_max_recovery: log2_ceil(max_recovery.div_ceil(cohorts as u64).max(1)),
            interleave: options.interleave,
        }),
    };

    let file_permissions = gather_permissions(base, &map, options)?;
    let common = build_common_packets(&map, set_id, &start, &matrix, &file_permissions, options)?;

    let mut report = CreateReport {
        set_id,
        block_size,
        block_count,
        recovery_count,
        field,
        files: Vec::new(),
    };

    // Index file: metadata only
    let index_size = common.creator.len() as u64
        + common.block.len() as u64
        + common.comment.len() as u64;
    report.files.push(CreatedFile {
        path: index_path.to_path_buf(),
        size: index_size,
    });
    if !options.trial {
        let mut writer = BufWriter::new(File::create(index_path)?);
        writer.write_all(&common.creator)?;
        writer.write_all(&common.block)?;
        writer.write_all(&common.comment)?;
        writer.flush()?;
    }

    // Recovery volumes
    let mut slots: Vec<RecoverySlot> = Vec::new();
    if recovery_count > 0 {
        let per_cohort_first = first_recovery / cohorts as u64;
        let per_cohort_count = recovery_count / cohorts as u64;
        let layout = volume_layout(
            options.scheme,
            per_cohort_count,
            per_cohort_first,
            |count| estimate_volume_size(count, cohorts, &common, block_size, options),
        );
        let (width_start, width_count) = layout_widths(&layout);

        for &(start_index, count) in &layout {
            let path = volume_path(index_path, "vol", start_index, count, width_start, width_count);
            let size = estimate_volume_size(count, cohorts, &common, block_size, options);
            report.files.push(CreatedFile {
                path: path.clone(),
                size,
            });
            if !options.trial {
                write_recovery_volume(
                    &path,
                    &common,
                    set_id,
                    start_index,
                    count,
                    cohorts,
                    block_size,
                    options,
                    &mut slots,
                )?;
            }
        }
    }

    // Data volumes
    if options.store_data_packets && block_count > 0 {
        let layout = volume_layout(options.scheme, block_count, 0, |count| {
            estimate_volume_size(count, 1, &common, block_size, options)
        });
        let (width_start, width_count) = layout_widths(&layout);
        for &(start_index, count) in &layout {
            let path = volume_path(index_path, "part", start_index, count, width_start, width_count);
            let size = data_volume_size(&map, start_index, count, &common, options);
            report.files.push(CreatedFile {
                path: path.clone(),
                size,
            });
            if !options.trial {
                write_data_volume(base, &path, &common, set_id, &map, start_index, count, options)?;
            }
        }
    }

    if options.trial {
        return Ok(report);
    }

    // Fill recovery payloads and patch their checksums
    if !slots.is_empty() {
        let per_cohort_max = match &matrix {
            MatrixPacket::Fft(p) => p.max_recovery_per_cohort(),
            MatrixPacket::Cauchy(_) => 0,
        };
        compute_recovery(base, &map, field, options, cohorts, per_cohort_max, &slots)?;
        patch_checksums(&slots)?;
    }

    debug!(
        "created set {} with {} blocks and {} recovery blocks",
        set_id, block_count, recovery_count
    );
    Ok(report)
}

fn log2_ceil(value: u64) -> u8 {
    let mut bits = 0u8;
    while (1u64 << bits) < value {
        bits += 1;
    }
    bits
}

// ----------------------------------------------------------------------
// Set-ID
// ----------------------------------------------------------------------

/// The Set-ID folds a content-derived random into the Start Packet body,
/// so identical inputs produce the same ID on every run while distinct
/// sets virtually never collide.
fn generate_set_id(map: &BlockMap, absolute_base: Option<&str>, start: &StartPacket) -> SetId {
    let mut hasher = blake3::Hasher::new();
    for file in &map.files {
        hasher.update(file.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(&file.size.to_le_bytes());
        hasher.update(file.hash.as_bytes());
        for chunk in &map.chunks[file.chunks.clone()] {
            match chunk {
                Chunk::Unprotected { length } => {
                    hasher.update(&0u64.to_le_bytes());
                    hasher.update(&length.to_le_bytes());
                }
                Chunk::Protected {
                    size,
                    first_block,
                    tail,
                } => {
                    hasher.update(&size.to_le_bytes());
                    hasher.update(&first_block.to_le_bytes());
                    if let Tail::Packed { block, offset, .. } = tail {
                        hasher.update(&block.to_le_bytes());
                        hasher.update(&offset.to_le_bytes());
                    }
                }
            }
        }
    }
    for dir in &map.dirs {
        hasher.update(dir.name.as_bytes());
        hasher.update(&[0]);
    }
    if let Some(base) = absolute_base {
        hasher.update(base.replace('\\', "/").as_bytes());
        hasher.update(&[0]);
    }
    let mut random = [0u8; 8];
    random.copy_from_slice(&hasher.finalize().as_bytes()[..8]);

    let mut body = Vec::with_capacity(8 + start.to_body().len());
    body.extend_from_slice(&random);
    body.extend_from_slice(&start.to_body());
    SetId::new(blake3_64(&body))
}

// ----------------------------------------------------------------------
// File-system option packets
// ----------------------------------------------------------------------

/// Capture the requested permission packets for every input file, in file
/// order.
fn gather_permissions(
    base: &Path,
    map: &BlockMap,
    options: &CreatorOptions,
) -> Result<Vec<Vec<PermissionsPacket>>> {
    let mut all = Vec::with_capacity(map.files.len());
    for file in &map.files {
        let mut list = Vec::new();
        if options.unix_permissions || options.fat_permissions {
            let metadata = std::fs::metadata(base.join(&file.name))?;
            if options.unix_permissions {
                list.push(PermissionsPacket::Unix(UnixPermissionsPacket::from_metadata(
                    &metadata,
                )));
            }
            if options.fat_permissions {
                list.push(PermissionsPacket::Fat(FatPermissionsPacket::from_metadata(
                    &metadata,
                )));
            }
        }
        all.push(list);
    }
    Ok(all)
}

// ----------------------------------------------------------------------
// Common packet block
// ----------------------------------------------------------------------

struct CommonPackets {
    creator: Vec<u8>,
    /// Start ‖ Matrix ‖ File* ‖ Directory* ‖ Root ‖ External Data*.
    block: Vec<u8>,
    comment: Vec<u8>,
    root_checksum: PacketChecksum,
    matrix_checksum: PacketChecksum,
}

fn build_common_packets(
    map: &BlockMap,
    set_id: SetId,
    start: &StartPacket,
    matrix: &MatrixPacket,
    file_permissions: &[Vec<PermissionsPacket>],
    options: &CreatorOptions,
) -> Result<CommonPackets> {
    let mut block = Vec::new();

    block.extend_from_slice(&make_packet(
        set_id,
        packets::start_packet::TYPE_TAG,
        &start.to_body(),
    ));

    let matrix_packet = make_packet(set_id, matrix.type_tag(), &matrix.to_body());
    let matrix_checksum = packets::checksum_of(&matrix_packet);
    block.extend_from_slice(&matrix_packet);

    // File packets, dedup-aware: identical packets collapse to one copy.
    // Permission packets precede the file packet that references them.
    let mut file_checksums: Vec<PacketChecksum> = Vec::with_capacity(map.files.len());
    let mut emitted: Vec<PacketChecksum> = Vec::new();
    for (index, file) in map.files.iter().enumerate() {
        let mut option_checksums = Vec::new();
        for permission in &file_permissions[index] {
            let bytes = make_packet(set_id, permission.type_tag(), &permission.to_body());
            let checksum = packets::checksum_of(&bytes);
            option_checksums.push(*checksum.as_bytes());
            if !emitted.contains(&checksum) {
                emitted.push(checksum);
                block.extend_from_slice(&bytes);
            }
        }

        let name = file
            .name
            .rsplit('/')
            .next()
            .unwrap_or(&file.name)
            .to_string();
        let packet = FilePacket {
            name,
            crc_16k: file.crc_16k,
            hash: file.hash,
            options: option_checksums,
            chunks: map.chunks[file.chunks.clone()].to_vec(),
        };
        let bytes = make_packet(
            set_id,
            packets::file_packet::TYPE_TAG,
            &packet.to_body(map.block_size),
        );
        let checksum = packets::checksum_of(&bytes);
        file_checksums.push(checksum);
        if !emitted.contains(&checksum) {
            emitted.push(checksum);
            block.extend_from_slice(&bytes);
        }
    }

    // Directory packets, deepest first so children exist before parents
    let mut dir_names: Vec<String> = map.dirs.iter().map(|d| d.name.clone()).collect();
    for file in &map.files {
        let mut parent = file.name.as_str();
        while let Some(at) = parent.rfind('/') {
            parent = &parent[..at];
            if !dir_names.iter().any(|d| d == parent) {
                dir_names.push(parent.to_string());
            }
        }
    }
    dir_names.sort_by_key(|name| std::cmp::Reverse(name.matches('/').count()));

    let mut dir_checksums: Vec<(String, PacketChecksum)> = Vec::new();
    for dir in &dir_names {
        let children = children_of(map, &file_checksums, &dir_checksums, Some(dir));
        let packet = DirectoryPacket::new(
            dir.rsplit('/').next().unwrap_or(dir).to_string(),
            children,
        );
        let bytes = make_packet(set_id, packets::directory_packet::TYPE_TAG, &packet.to_body());
        dir_checksums.push((dir.clone(), packets::checksum_of(&bytes)));
        block.extend_from_slice(&bytes);
    }

    let attributes = if options.absolute_path.is_some() {
        packets::root_packet::ATTR_ABSOLUTE_PATH
    } else {
        0
    };
    let root = RootPacket::new(
        map.block_count(),
        attributes,
        children_of(map, &file_checksums, &dir_checksums, None),
    );
    let root_packet = make_packet(set_id, packets::root_packet::TYPE_TAG, &root.to_body());
    let root_checksum = packets::checksum_of(&root_packet);
    block.extend_from_slice(&root_packet);

    // External Data packets over runs of consecutive full blocks
    for packet in external_data_runs(&map.blocks) {
        let bytes = make_packet(
            set_id,
            packets::external_data_packet::TYPE_TAG,
            &packet.to_body(),
        );
        block.extend_from_slice(&bytes);
    }

    Ok(CommonPackets {
        creator: text_packet::make_creator_packet(set_id),
        block,
        comment: options
            .comment
            .as_deref()
            .map(|text| text_packet::make_comment_packet(set_id, text))
            .unwrap_or_default(),
        root_checksum,
        matrix_checksum,
    })
}

fn children_of(
    map: &BlockMap,
    file_checksums: &[PacketChecksum],
    dir_checksums: &[(String, PacketChecksum)],
    dir: Option<&str>,
) -> Vec<[u8; 16]> {
    let mut children = Vec::new();
    for (index, file) in map.files.iter().enumerate() {
        let parent = file.name.rfind('/').map(|at| &file.name[..at]);
        if parent == dir {
            let checksum = *file_checksums[index].as_bytes();
            if !children.contains(&checksum) {
                children.push(checksum);
            }
        }
    }
    for (name, checksum) in dir_checksums {
        let parent = name.rfind('/').map(|at| &name[..at]);
        if parent == dir {
            children.push(*checksum.as_bytes());
        }
    }
    children
}

fn external_data_runs(blocks: &[Block]) -> Vec<ExternalDataPacket> {
    let mut packets = Vec::new();
    let mut run: Option<ExternalDataPacket> = None;
    for (index, block) in blocks.iter().enumerate() {
        if block.state & BLOCK_HAS_FULL != 0 {
            let entry = (block.crc, block.hash);
            match &mut run {
                Some(packet) => packet.checksums.push(entry),
                None => {
                    run = Some(ExternalDataPacket {
                        first_block: index as u64,
                        checksums: vec![entry],
                    })
                }
            }
        } else if let Some(packet) = run.take() {
            packets.push(packet);
        }
    }
    if let Some(packet) = run.take() {
        packets.push(packet);
    }
    packets
}

// ----------------------------------------------------------------------
// Volume layout and naming
// ----------------------------------------------------------------------

/// Distribute `count` recovery blocks (per cohort) over volume files.
/// Returns `(first, count)` pairs in block units.
fn volume_layout(
    scheme: RecoveryFileScheme,
    count: u64,
    first: u64,
    estimate: impl Fn(u64) -> u64,
) -> Vec<(u64, u64)> {
    let mut layout = Vec::new();
    let mut start = first;
    let mut remaining = count;
    match scheme {
        RecoveryFileScheme::PowerOfTwo => {
            let mut next = 1u64;
            while remaining > 0 {
                let take = next.min(remaining);
                layout.push((start, take));
                start += take;
                remaining -= take;
                next *= 2;
            }
        }
        RecoveryFileScheme::Uniform(files) => {
            let files = (files as u64).max(1).min(count.max(1));
            let base = count / files;
            let extra = count % files;
            for k in 0..files {
                let take = if k < extra { base + 1 } else { base };
                if take == 0 {
                    continue;
                }
                layout.push((start, take));
                start += take;
            }
        }
        RecoveryFileScheme::Variable(files) => {
            let files = (files as u64).max(1).min(63);
            let base = count.div_ceil((1u64 << files) - 1).max(1);
            let mut take = base;
            while remaining > 0 {
                let this = take.min(remaining);
                layout.push((start, this));
                start += this;
                remaining -= this;
                take *= 2;
            }
        }
        RecoveryFileScheme::LimitSize(limit) => {
            // Grow as powers of two until a volume would exceed the limit
            let mut cap = 1u64;
            while cap < remaining && estimate(cap * 2) <= limit {
                cap *= 2;
            }
            let mut next = 1u64;
            while remaining > 0 {
                let take = next.min(cap).min(remaining);
                layout.push((start, take));
                start += take;
                remaining -= take;
                next *= 2;
            }
        }
    }
    layout
}

fn layout_widths(layout: &[(u64, u64)]) -> (usize, usize) {
    let max_start = layout
        .iter()
        .map(|&(start, count)| start + count)
        .max()
        .unwrap_or(0);
    let max_count = layout.iter().map(|&(_, count)| count).max().unwrap_or(0);
    (decimal_width(max_start), decimal_width(max_count))
}

fn decimal_width(value: u64) -> usize {
    value.max(1).to_string().len()
}

fn volume_path(
    index_path: &Path,
    kind: &str,
    start: u64,
    count: u64,
    width_start: usize,
    width_count: usize,
) -> PathBuf {
    let name = index_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = name.strip_suffix(".par3").unwrap_or(&name);
    let volume = format!("{base}.{kind}{start:0width_start$}+{count:0width_count$}.par3");
    index_path.with_file_name(volume)
}

/// Size of a recovery volume: creator, the common block, one recovery
/// packet per cohort for every slot, the repeated common packets, and the
/// comment.
fn estimate_volume_size(
    count: u64,
    cohorts: u32,
    common: &CommonPackets,
    block_size: u64,
    options: &CreatorOptions,
) -> u64 {
    let payload_packets = count * cohorts as u64;
    let packet_size = 48 + packets::RECOVERY_PREAMBLE_LEN + block_size;
    common.creator.len() as u64
        + common.block.len() as u64 * (1 + repetitions(payload_packets, options.repetition_limit))
        + payload_packets * packet_size
        + common.comment.len() as u64
}

/// Number of whole common-block repetitions inside one volume:
/// one per power-of-two payload index, capped by the repetition limit.
fn repetitions(payload_packets: u64, limit: u32) -> u64 {
    if payload_packets < 2 {
        return 0;
    }
    let mut reps = payload_packets.ilog2() as u64;
    if limit > 0 {
        reps = reps.min(limit.saturating_sub(1) as u64);
    }
    reps
}

// ----------------------------------------------------------------------
// Volume writing
// ----------------------------------------------------------------------

/// Where one recovery packet's payload lives, for the fill pass.
struct RecoverySlot {
    path: PathBuf,
    packet_offset: u64,
    packet_len: u64,
    global_index: u64,
}

#[allow(clippy::too_many_arguments)]
fn write_recovery_volume(
    path: &Path,
    common: &CommonPackets,
    set_id: SetId,
    start_index: u64,
    count: u64,
    cohorts: u32,
    block_size: u64,
    options: &CreatorOptions,
    slots: &mut Vec<RecoverySlot>,
) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let mut offset = 0u64;

    let mut emit = |writer: &mut BufWriter<File>, offset: &mut u64, bytes: &[u8]| -> Result<()> {
        writer.write_all(bytes)?;
        *offset += bytes.len() as u64;
        Ok(())
    };

    emit(&mut writer, &mut offset, &common.creator)?;
    emit(&mut writer, &mut offset, &common.block)?;

    let payload_total = count * cohorts as u64;
    let reps_cap = repetitions(payload_total, options.repetition_limit);
    let mut reps_done = 0u64;
    let zero_payload = vec![0u8; block_size as usize];

    let mut payload_written = 0u64;
    for slot in start_index..start_index + count {
        for cohort in 0..cohorts as u64 {
            let global_index = slot * cohorts as u64 + cohort;
            let packet = make_recovery_packet(
                set_id,
                global_index,
                &common.root_checksum,
                &common.matrix_checksum,
                &zero_payload,
            );
            slots.push(RecoverySlot {
                path: path.to_path_buf(),
                packet_offset: offset,
                packet_len: packet.len() as u64,
                global_index,
            });
            emit(&mut writer, &mut offset, &packet)?;
            payload_written += 1;

            if payload_written.is_power_of_two() && payload_written > 1 && reps_done < reps_cap {
                emit(&mut writer, &mut offset, &common.block)?;
                reps_done += 1;
            }
        }
    }

    emit(&mut writer, &mut offset, &common.comment)?;
    writer.flush()?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_data_volume(
    base: &Path,
    path: &Path,
    common: &CommonPackets,
    set_id: SetId,
    map: &BlockMap,
    start_index: u64,
    count: u64,
    options: &CreatorOptions,
) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let mut cache = HandleCache::reader();
    let mut buffer = vec![0u8; map.block_size as usize];

    writer.write_all(&common.creator)?;
    writer.write_all(&common.block)?;

    let reps_cap = repetitions(count, options.repetition_limit);
    let mut reps_done = 0u64;

    for (written, block_index) in (start_index..start_index + count).enumerate() {
        let block = &map.blocks[block_index as usize];
        let data = &mut buffer[..block.size as usize];
        data.fill(0);
        read_block_range(base, map, block_index, 0, data, &mut cache)?;
        writer.write_all(&data_packet::make_data_packet(set_id, block_index, data))?;

        let payload_written = written as u64 + 1;
        if payload_written.is_power_of_two() && payload_written > 1 && reps_done < reps_cap {
            writer.write_all(&common.block)?;
            reps_done += 1;
        }
    }

    writer.write_all(&common.comment)?;
    writer.flush()?;
    Ok(())
}

fn data_volume_size(
    map: &BlockMap,
    start_index: u64,
    count: u64,
    common: &CommonPackets,
    options: &CreatorOptions,
) -> u64 {
    let payload: u64 = (start_index..start_index + count)
        .map(|i| 48 + data_packet::PREAMBLE_LEN + map.blocks[i as usize].size)
        .sum();
    common.creator.len() as u64
        + common.block.len() as u64 * (1 + repetitions(count, options.repetition_limit))
        + payload
        + common.comment.len() as u64
}

// ----------------------------------------------------------------------
// Block content and recovery computation
// ----------------------------------------------------------------------

/// Read the byte range `[range_off, range_off + buf.len())` of a block's
/// content by composing its slices; bytes no slice covers stay zero.
pub(crate) fn read_block_range(
    base: &Path,
    map: &BlockMap,
    block_index: u64,
    range_off: u64,
    buf: &mut [u8],
    cache: &mut HandleCache,
) -> Result<()> {
    let range_len = buf.len() as u64;
    let block = &map.blocks[block_index as usize];
    for &slice_index in &block.slices {
        let slice = &map.slices[slice_index.0];
        let begin = slice.tail_offset.max(range_off);
        let end = (slice.tail_offset + slice.size).min(range_off + range_len);
        if begin >= end {
            continue;
        }
        let file = &map.files[slice.file.as_usize()];
        let path = base.join(&file.name);
        let file_offset = slice.file_offset + (begin - slice.tail_offset);
        let out = &mut buf[(begin - range_off) as usize..(end - range_off) as usize];
        cache.read_at(&path, file_offset, out)?;
    }
    Ok(())
}

/// Byte-range split plan under a memory limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SplitPlan {
    pub split_size: u64,
    pub split_count: u64,
}

pub(crate) fn plan_splits(
    block_size: u64,
    regions_needed: u64,
    memory_limit: u64,
    granularity: u64,
) -> SplitPlan {
    if memory_limit == 0 {
        return SplitPlan {
            split_size: block_size,
            split_count: 1,
        };
    }
    let per_byte = regions_needed.max(1);
    let budget = (memory_limit / per_byte).max(granularity + 8);
    let split_count = block_size.div_ceil(budget).max(1);
    let split_size = block_size
        .div_ceil(split_count)
        .next_multiple_of(granularity);
    SplitPlan {
        split_size,
        split_count: block_size.div_ceil(split_size),
    }
}

fn compute_recovery(
    base: &Path,
    map: &BlockMap,
    field: FieldChoice,
    options: &CreatorOptions,
    cohorts: u32,
    per_cohort_max: u64,
    slots: &[RecoverySlot],
) -> Result<()> {
    match options.ecc {
        EccMethod::Cauchy => compute_cauchy_recovery(base, map, field, options, slots),
        EccMethod::Fft => {
            compute_fft_recovery(base, map, field, options, cohorts, per_cohort_max, slots)
        }
    }
}

fn compute_cauchy_recovery(
    base: &Path,
    map: &BlockMap,
    field: FieldChoice,
    options: &CreatorOptions,
    slots: &[RecoverySlot],
) -> Result<()> {
    let block_size = map.block_size;
    let codec = CauchyCodec::new(field, map.block_count())
        .map_err(|e| Error::Logic(e.to_string()))?;
    let recovery_ids: Vec<u64> = slots.iter().map(|s| s.global_index).collect();

    let granularity = field.gf_size as u64 * 2;
    let plan = plan_splits(
        block_size,
        recovery_ids.len() as u64 + 1,
        options.memory_limit,
        granularity.max(4),
    );
    debug!("cauchy encode: {plan:?}");

    let mut cache = HandleCache::reader();
    let mut write_cache = HandleCache::writer();

    for split in 0..plan.split_count {
        let range_off = split * plan.split_size;
        let range_len = plan.split_size.min(block_size - range_off);
        let region_size = cauchy_region_size(range_len) as usize;

        let mut recovery = vec![0u8; recovery_ids.len() * region_size];
        let mut input = vec![0u8; region_size];

        for block_index in 0..map.block_count() {
            input.fill(0);
            read_block_range(
                base,
                map,
                block_index,
                range_off,
                &mut input[..range_len as usize],
                &mut cache,
            )?;
            region_create_parity(&mut input);
            codec.encode_block(block_index, &input, &recovery_ids, &mut recovery, region_size);
        }

        for (slot, region) in slots.iter().zip(recovery.chunks(region_size)) {
            write_cache.write_at(
                &slot.path,
                slot.packet_offset + 48 + packets::RECOVERY_PREAMBLE_LEN + range_off,
                &region[..range_len as usize],
            )?;
        }
    }
    Ok(())
}

fn compute_fft_recovery(
    base: &Path,
    map: &BlockMap,
    field: FieldChoice,
    options: &CreatorOptions,
    cohorts: u32,
    per_cohort_max: u64,
    slots: &[RecoverySlot],
) -> Result<()> {
    let block_size = map.block_size;
    let block_count = map.block_count();
    let codec = FftCodec::new(field).map_err(|e| Error::Logic(e.to_string()))?;

    let cohort_blocks = block_count.div_ceil(cohorts as u64);
    // Evaluate at the full declared ceiling so the transform positions the
    // decoder derives from the matrix packet line up with ours
    let encode_count = per_cohort_max;
    let work_regions = encode_work_count(encode_count);

    let plan = plan_splits(
        block_size,
        cohort_blocks + work_regions,
        options.memory_limit,
        64,
    );
    debug!("fft encode: {plan:?} over {cohorts} cohorts");

    let mut cache = HandleCache::reader();
    let mut write_cache = HandleCache::writer();

    for split in 0..plan.split_count {
        let range_off = split * plan.split_size;
        let range_len = plan.split_size.min(block_size - range_off);
        let region_size = fft_region_size(range_len) as usize;

        for cohort in 0..cohorts as u64 {
            // Gather this cohort's inputs; the pad block past the end is
            // all zero and is never written back
            let mut originals = vec![0u8; cohort_blocks as usize * region_size];
            for position in 0..cohort_blocks {
                let block_index = position * cohorts as u64 + cohort;
                let region =
                    &mut originals[position as usize * region_size..][..region_size];
                if block_index < block_count {
                    read_block_range(
                        base,
                        map,
                        block_index,
                        range_off,
                        &mut region[..range_len as usize],
                        &mut cache,
                    )?;
                }
                region_create_parity(region);
            }

            let refs: Vec<&[u8]> = originals.chunks(region_size).collect();
            let mut work = vec![0u8; work_regions as usize * region_size];
            codec
                .encode(region_size, &refs, encode_count as usize, &mut work)
                .map_err(|e| Error::Logic(e.to_string()))?;

            for slot in slots.iter().filter(|s| s.global_index % cohorts as u64 == cohort) {
                let position = slot.global_index / cohorts as u64;
                let region = &work[position as usize * region_size..][..range_len as usize];
                write_cache.write_at(
                    &slot.path,
                    slot.packet_offset + 48 + packets::RECOVERY_PREAMBLE_LEN + range_off,
                    region,
                )?;
            }
        }
    }
    Ok(())
}

/// Recompute each written packet's checksum over its final payload.
fn patch_checksums(slots: &[RecoverySlot]) -> Result<()> {
    let mut by_file: Vec<(&PathBuf, Vec<&RecoverySlot>)> = Vec::new();
    for slot in slots {
        match by_file.iter_mut().find(|(path, _)| **path == slot.path) {
            Some((_, list)) => list.push(slot),
            None => by_file.push((&slot.path, vec![slot])),
        }
    }

    for (path, list) in by_file {
        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        let mut buf = vec![0u8; 1 << 20];
        for slot in list {
            file.seek(SeekFrom::Start(slot.packet_offset + 24))?;
            let mut remaining = slot.packet_len - 24;
            let mut hasher = blake3::Hasher::new();
            while remaining > 0 {
                let take = buf.len().min(remaining as usize);
                file.read_exact(&mut buf[..take])?;
                hasher.update(&buf[..take]);
                remaining -= take as u64;
            }
            file.seek(SeekFrom::Start(slot.packet_offset + 8))?;
            file.write_all(&hasher.finalize().as_bytes()[..16])?;
        }
        file.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_selection() {
        let mut options = CreatorOptions::default();
        assert_eq!(choose_block_size(1 << 20, &options).unwrap(), 65536);

        options.block_count = Some(4);
        assert_eq!(choose_block_size(4096, &options).unwrap(), 1024);
        // Rounded up to a multiple of 4
        assert_eq!(choose_block_size(4098, &options).unwrap(), 1028);

        options.block_size = Some(30);
        // Floor of 40 bytes
        assert_eq!(choose_block_size(4096, &options).unwrap(), 40);
    }

    #[test]
    fn power_of_two_layout() {
        let layout = volume_layout(RecoveryFileScheme::PowerOfTwo, 11, 0, |_| 0);
        assert_eq!(layout, vec![(0, 1), (1, 2), (3, 4), (7, 4)]);
    }

    #[test]
    fn uniform_layout_spreads_remainder_first() {
        let layout = volume_layout(RecoveryFileScheme::Uniform(4), 10, 0, |_| 0);
        assert_eq!(layout, vec![(0, 3), (3, 3), (6, 2), (8, 2)]);
    }

    #[test]
    fn variable_layout_doubles_from_base() {
        // base = ceil(14 / (2^3 - 1)) = 2
        let layout = volume_layout(RecoveryFileScheme::Variable(3), 14, 0, |_| 0);
        assert_eq!(layout, vec![(0, 2), (2, 4), (6, 8)]);
    }

    #[test]
    fn limit_size_layout_caps_growth() {
        // Pretend each block costs 10 bytes; limit 40 caps volumes at 4
        let layout =
            volume_layout(RecoveryFileScheme::LimitSize(40), 20, 0, |count| count * 10);
        assert_eq!(layout, vec![(0, 1), (1, 2), (3, 4), (7, 4), (11, 4), (15, 4), (19, 1)]);
    }

    #[test]
    fn volume_names_are_zero_padded() {
        let path = volume_path(Path::new("archive.par3"), "vol", 3, 4, 2, 2);
        assert_eq!(path, PathBuf::from("archive.vol03+04.par3"));
        let path = volume_path(Path::new("archive.par3"), "part", 0, 10, 2, 2);
        assert_eq!(path, PathBuf::from("archive.part00+10.par3"));
    }

    #[test]
    fn repetition_count_follows_payload_log2() {
        assert_eq!(repetitions(1, 0), 0);
        assert_eq!(repetitions(2, 0), 1);
        assert_eq!(repetitions(8, 0), 3);
        assert_eq!(repetitions(8, 2), 1);
    }

    #[test]
    fn split_plan_respects_limit_and_granularity() {
        let plan = plan_splits(1024, 10, 4096, 4);
        assert!(plan.split_size * plan.split_count >= 1024);
        assert_eq!(plan.split_size % 4, 0);
        assert!(plan.split_count > 1);

        let unlimited = plan_splits(1024, 10, 0, 4);
        assert_eq!(unlimited.split_count, 1);
    }
}
