//! Block recovery and file restoration
//!
//! The recoverer runs in three phases per split: read every known input
//! block (writing its slices straight into the temporary outputs), fold
//! known inputs and recovery blocks into the solver, then parity-check the
//! reconstructed blocks and write their slices. Finally each restored
//! file's inline tails are replayed, the temporary is truncated to size,
//! the damaged original (if any) is renamed aside, and the temporary takes
//! its name.
//!
//! When the required buffer exceeds the memory limit, every block is
//! processed in equal byte sub-ranges with an identical block and matrix
//! selection per iteration. Under cohort interleaving the whole
//! read/solve/write loop runs once per cohort with only that cohort's
//! blocks participating.

use crate::block::{BlockMap, Chunk, Tail, FILE_MISNAMED, FILE_REPAIRED, FILE_RESTORED};
use crate::codec::cauchy::{CauchyCodec, CauchyDecoder};
use crate::codec::fft::{decode_work_count, FftCodec};
use crate::codec::FieldChoice;
use crate::creator::plan_splits;
use crate::domain::FileIndex;
use crate::error::{Error, Result};
use crate::file_ops::HandleCache;
use crate::galois::{
    cauchy_region_size, fft_region_size, region_check_parity, region_create_parity,
};
use crate::packets::{MatrixPacket, PacketSet, RecoveryDataMeta};
use crate::verify::{block_known, VerifyReport, VerifyVerdict};
use log::debug;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct RepairOptions {
    /// Byte budget for solver buffers; zero means unlimited.
    pub memory_limit: u64,
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    NotRequired,
    NotPossible,
    Success,
    Failed,
}

#[derive(Debug)]
pub struct RepairReport {
    pub outcome: RepairOutcome,
    pub repaired_files: usize,
    pub failed_files: usize,
}

pub fn repair(
    set: &PacketSet,
    base: &Path,
    verify_report: &mut VerifyReport,
    options: &RepairOptions,
) -> Result<RepairReport> {
    match verify_report.verdict {
        VerifyVerdict::AllCorrect => {
            return Ok(RepairReport {
                outcome: RepairOutcome::NotRequired,
                repaired_files: 0,
                failed_files: 0,
            })
        }
        VerifyVerdict::RepairNotPossible => {
            return Ok(RepairReport {
                outcome: RepairOutcome::NotPossible,
                repaired_files: 0,
                failed_files: 0,
            })
        }
        VerifyVerdict::RepairPossible => {}
    }

    let mut repaired_files = 0usize;

    // Misnamed files are restored by renaming the stray copy into place
    for index in 0..verify_report.map.files.len() {
        if verify_report.map.files[index].state & FILE_MISNAMED == 0 {
            continue;
        }
        let extra_index = crate::block::misnamed_extra_index(verify_report.map.files[index].state);
        let from = verify_report.search_paths[extra_index].clone();
        let to = base.join(&verify_report.map.files[index].name);
        if to.exists() {
            backup_aside(&to)?;
        }
        std::fs::rename(&from, &to)?;
        // Blocks found in the stray file are now at its new name. The
        // state keeps only the misnamed marker: bits 3 and up hold the
        // extra-file index, and the repaired bit would land inside them.
        verify_report.search_paths[extra_index] = to;
        repaired_files += 1;
        if !options.quiet {
            println!(
                "Target: \"{}\" - repaired.",
                verify_report.map.files[index].name
            );
        }
    }

    let restore: Vec<FileIndex> = verify_report
        .map
        .files
        .iter()
        .enumerate()
        .filter(|(_, f)| f.needs_restore())
        .map(|(i, _)| FileIndex(i as u32))
        .collect();
    if restore.is_empty() {
        return Ok(RepairReport {
            outcome: RepairOutcome::Success,
            repaired_files,
            failed_files: 0,
        });
    }

    let temp_paths: Vec<(FileIndex, PathBuf)> = restore
        .iter()
        .map(|&f| {
            let name = format!("par3_{}_{}.tmp", set.set_id.to_hex(), f.0);
            (f, base.join(name))
        })
        .collect();

    let result = restore_files(set, base, verify_report, options, &restore, &temp_paths);
    if result.is_err() {
        // Partial temporaries are useless; remove them before returning
        for (_, path) in &temp_paths {
            let _ = std::fs::remove_file(path);
        }
    }
    let mut report = result?;
    report.repaired_files += repaired_files;
    Ok(report)
}

fn restore_files(
    set: &PacketSet,
    base: &Path,
    verify_report: &mut VerifyReport,
    options: &RepairOptions,
    restore: &[FileIndex],
    temp_paths: &[(FileIndex, PathBuf)],
) -> Result<RepairReport> {
    let map = &verify_report.map;
    for (file_index, path) in temp_paths {
        let file = File::create(path)?;
        file.set_len(map.files[file_index.as_usize()].size)?;
    }

    let lost: Vec<u64> = (0..map.block_count())
        .filter(|&i| !block_known(map, &map.blocks[i as usize]))
        .collect();

    let mut read_cache = HandleCache::reader();
    let mut write_cache = HandleCache::writer();

    // Slices of known blocks can be written back immediately
    let mut buffer = vec![0u8; map.block_size as usize];
    for block_index in 0..map.block_count() {
        let block = &map.blocks[block_index as usize];
        if !block_known(map, block) {
            continue;
        }
        if !block
            .slices
            .iter()
            .any(|&s| restore.contains(&map.slices[s.0].file))
        {
            continue;
        }
        let data = &mut buffer[..block.size as usize];
        data.fill(0);
        read_known_range(map, &verify_report.search_paths, block_index, 0, data, &mut read_cache)?;
        write_restored_slices(
            map,
            block_index,
            0,
            data,
            restore,
            temp_paths,
            &mut write_cache,
        )?;
    }

    // Reconstruct the lost blocks
    if !lost.is_empty() {
        let field = set.start.field_choice()?;
        match &set.matrix {
            MatrixPacket::Cauchy(_) => solve_cauchy(
                set,
                verify_report,
                options,
                field,
                &lost,
                restore,
                temp_paths,
                &mut read_cache,
                &mut write_cache,
            )?,
            MatrixPacket::Fft(fft) => {
                let cohorts = fft.cohorts();
                let per_cohort_max = fft.max_recovery_per_cohort();
                solve_fft(
                    set,
                    verify_report,
                    options,
                    field,
                    cohorts,
                    per_cohort_max,
                    &lost,
                    restore,
                    temp_paths,
                    &mut read_cache,
                    &mut write_cache,
                )?
            }
        }
    }

    drop(write_cache);

    // Replay inline tails, verify, and move the temporaries into place
    let mut repaired_files = 0usize;
    let mut failed_files = 0usize;
    let map = &mut verify_report.map;
    for (file_index, temp_path) in temp_paths {
        let index = file_index.as_usize();
        finalize_file(map, *file_index, temp_path)?;
        map.files[index].state |= FILE_RESTORED;

        let ok = map.files[index].state & crate::block::FILE_UNPROTECTED_CHUNKS != 0
            || hash_file(temp_path)? == map.files[index].hash;
        let name = map.files[index].name.clone();
        if ok {
            let (safe_name, sanitized) = crate::paths::sanitize_relative(&name);
            if sanitized {
                debug!("sanitized output name {name:?} to {safe_name:?}");
            }
            let target = base.join(&safe_name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if target.exists() {
                backup_aside(&target)?;
            }
            std::fs::rename(temp_path, &target)?;
            apply_permissions(set, &map.files[index].options, &target)?;
            map.files[index].state |= FILE_REPAIRED;
            repaired_files += 1;
            if !options.quiet {
                println!("Target: \"{name}\" - repaired.");
            }
        } else {
            std::fs::remove_file(temp_path)?;
            failed_files += 1;
            if !options.quiet {
                println!("Target: \"{name}\" - failed.");
            }
        }
    }

    Ok(RepairReport {
        outcome: if failed_files == 0 {
            RepairOutcome::Success
        } else {
            RepairOutcome::Failed
        },
        repaired_files,
        failed_files,
    })
}

// ----------------------------------------------------------------------
// Solvers
// ----------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn solve_cauchy(
    set: &PacketSet,
    verify_report: &VerifyReport,
    options: &RepairOptions,
    field: FieldChoice,
    lost: &[u64],
    restore: &[FileIndex],
    temp_paths: &[(FileIndex, PathBuf)],
    read_cache: &mut HandleCache,
    write_cache: &mut HandleCache,
) -> Result<()> {
    let map = &verify_report.map;
    let block_size = map.block_size;
    let codec =
        CauchyCodec::new(field, map.block_count()).map_err(|e| Error::Logic(e.to_string()))?;

    let available: Vec<&RecoveryDataMeta> = {
        let mut list: Vec<&RecoveryDataMeta> = set.usable_recovery().collect();
        list.sort_by_key(|meta| meta.recovery_index);
        list.dedup_by_key(|meta| meta.recovery_index);
        list
    };
    let recovery_ids: Vec<u64> = available.iter().map(|m| m.recovery_index).collect();
    let decoder = CauchyDecoder::new(&codec, lost.to_vec(), recovery_ids)
        .map_err(|e| Error::Logic(e.to_string()))?;

    let granularity = (field.gf_size as u64 * 2).max(4);
    let plan = plan_splits(
        block_size,
        lost.len() as u64 + 1,
        options.memory_limit,
        granularity,
    );
    debug!("cauchy solve: {plan:?}, {} lost", lost.len());

    for split in 0..plan.split_count {
        let range_off = split * plan.split_size;
        let range_len = plan.split_size.min(block_size - range_off);
        let region_size = cauchy_region_size(range_len) as usize;

        let mut lost_regions = vec![0u8; lost.len() * region_size];
        let mut input = vec![0u8; region_size];

        for block_index in 0..map.block_count() {
            if lost.contains(&block_index) {
                continue;
            }
            input.fill(0);
            read_known_range(
                map,
                &verify_report.search_paths,
                block_index,
                range_off,
                &mut input[..range_len as usize],
                read_cache,
            )?;
            region_create_parity(&mut input);
            decoder.accumulate_input(block_index, &input, &mut lost_regions, region_size);
        }

        for (position, &recovery_index) in decoder.recovery_used().iter().enumerate() {
            let meta = available
                .iter()
                .find(|m| m.recovery_index == recovery_index)
                .expect("selected recovery block vanished");
            input.fill(0);
            read_cache.read_at(
                &meta.source,
                meta.payload_offset + range_off,
                &mut input[..range_len as usize],
            )?;
            region_create_parity(&mut input);
            decoder.accumulate_recovery(position, &input, &mut lost_regions, region_size);
        }

        for (slot, &block_index) in lost.iter().enumerate() {
            let region = &lost_regions[slot * region_size..(slot + 1) * region_size];
            if !region_check_parity(region) {
                return Err(Error::Logic(format!(
                    "parity mismatch on recovered block {block_index}"
                )));
            }
            write_restored_slices(
                map,
                block_index,
                range_off,
                &region[..range_len as usize],
                restore,
                temp_paths,
                write_cache,
            )?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn solve_fft(
    set: &PacketSet,
    verify_report: &VerifyReport,
    options: &RepairOptions,
    field: FieldChoice,
    cohorts: u32,
    per_cohort_max: u64,
    lost: &[u64],
    restore: &[FileIndex],
    temp_paths: &[(FileIndex, PathBuf)],
    read_cache: &mut HandleCache,
    write_cache: &mut HandleCache,
) -> Result<()> {
    let map = &verify_report.map;
    let block_size = map.block_size;
    let block_count = map.block_count();
    let codec = FftCodec::new(field).map_err(|e| Error::Logic(e.to_string()))?;

    let cohort_blocks = block_count.div_ceil(cohorts as u64);
    let work_regions = decode_work_count(cohort_blocks, per_cohort_max);

    let plan = plan_splits(
        block_size,
        cohort_blocks + work_regions,
        options.memory_limit,
        64,
    );
    debug!("fft solve: {plan:?}, {} lost over {cohorts} cohorts", lost.len());

    for split in 0..plan.split_count {
        let range_off = split * plan.split_size;
        let range_len = plan.split_size.min(block_size - range_off);
        let region_size = fft_region_size(range_len) as usize;

        for cohort in 0..cohorts as u64 {
            let cohort_lost: Vec<u64> = lost
                .iter()
                .copied()
                .filter(|&b| b % cohorts as u64 == cohort)
                .collect();
            if cohort_lost.is_empty() {
                continue;
            }

            // Known inputs of this cohort; the pad position past the end
            // is a zero block and counts as present
            let mut originals_data = vec![0u8; cohort_blocks as usize * region_size];
            let mut present = vec![false; cohort_blocks as usize];
            for position in 0..cohort_blocks {
                let block_index = position * cohorts as u64 + cohort;
                let region =
                    &mut originals_data[position as usize * region_size..][..region_size];
                if block_index >= block_count {
                    present[position as usize] = true;
                } else if !cohort_lost.contains(&block_index) {
                    read_known_range(
                        map,
                        &verify_report.search_paths,
                        block_index,
                        range_off,
                        &mut region[..range_len as usize],
                        read_cache,
                    )?;
                    present[position as usize] = true;
                }
                region_create_parity(region);
            }

            // Available recovery payloads of this cohort
            let mut recovery_data = vec![0u8; per_cohort_max as usize * region_size];
            let mut recovery_present = vec![false; per_cohort_max as usize];
            for meta in set.usable_recovery() {
                if meta.recovery_index % cohorts as u64 != cohort {
                    continue;
                }
                let position = (meta.recovery_index / cohorts as u64) as usize;
                if position >= per_cohort_max as usize || recovery_present[position] {
                    continue;
                }
                let region = &mut recovery_data[position * region_size..][..region_size];
                read_cache.read_at(
                    &meta.source,
                    meta.payload_offset + range_off,
                    &mut region[..range_len as usize],
                )?;
                region_create_parity(region);
                recovery_present[position] = true;
            }

            let originals: Vec<Option<&[u8]>> = present
                .iter()
                .enumerate()
                .map(|(position, &ok)| {
                    ok.then(|| &originals_data[position * region_size..][..region_size])
                })
                .collect();
            let recoveries: Vec<Option<&[u8]>> = recovery_present
                .iter()
                .enumerate()
                .map(|(position, &ok)| {
                    ok.then(|| &recovery_data[position * region_size..][..region_size])
                })
                .collect();

            let mut work = vec![0u8; work_regions as usize * region_size];
            codec
                .decode(region_size, &originals, &recoveries, &mut work)
                .map_err(|e| Error::Logic(e.to_string()))?;

            for &block_index in &cohort_lost {
                let position = (block_index / cohorts as u64) as usize;
                let region = &work[position * region_size..][..region_size];
                if !region_check_parity(region) {
                    return Err(Error::Logic(format!(
                        "parity mismatch on recovered block {block_index}"
                    )));
                }
                write_restored_slices(
                    map,
                    block_index,
                    range_off,
                    &region[..range_len as usize],
                    restore,
                    temp_paths,
                    write_cache,
                )?;
            }
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Block content plumbing
// ----------------------------------------------------------------------

/// Read byte range `[range_off, range_off + buf.len())` of a known block's
/// content from wherever verification found it.
fn read_known_range(
    map: &BlockMap,
    search_paths: &[PathBuf],
    block_index: u64,
    range_off: u64,
    buf: &mut [u8],
    cache: &mut HandleCache,
) -> Result<()> {
    let block = &map.blocks[block_index as usize];
    if let Some((file, offset)) = block.found_in {
        let len = (block.size.saturating_sub(range_off)).min(buf.len() as u64) as usize;
        cache.read_at(&search_paths[file.as_usize()], offset + range_off, &mut buf[..len])?;
        return Ok(());
    }

    // Tail block: compose the found slices
    let range_len = buf.len() as u64;
    for &slice_index in &block.slices {
        let slice = &map.slices[slice_index.0];
        let Some((file, position)) = slice.found_in else {
            continue;
        };
        let begin = slice.tail_offset.max(range_off);
        let end = (slice.tail_offset + slice.size).min(range_off + range_len);
        if begin >= end {
            continue;
        }
        cache.read_at(
            &search_paths[file.as_usize()],
            position + (begin - slice.tail_offset),
            &mut buf[(begin - range_off) as usize..(end - range_off) as usize],
        )?;
    }
    Ok(())
}

/// Write every slice of a reconstructed block that belongs to a file being
/// restored. `data` covers block bytes `[range_off, range_off + len)`.
fn write_restored_slices(
    map: &BlockMap,
    block_index: u64,
    range_off: u64,
    data: &[u8],
    restore: &[FileIndex],
    temp_paths: &[(FileIndex, PathBuf)],
    write_cache: &mut HandleCache,
) -> Result<()> {
    let range_len = data.len() as u64;
    let block = &map.blocks[block_index as usize];
    for &slice_index in &block.slices {
        let slice = &map.slices[slice_index.0];
        if !restore.contains(&slice.file) {
            continue;
        }
        let Some((_, temp_path)) = temp_paths.iter().find(|(f, _)| *f == slice.file) else {
            continue;
        };
        let begin = slice.tail_offset.max(range_off);
        let end = (slice.tail_offset + slice.size).min(range_off + range_len);
        if begin >= end {
            continue;
        }
        write_cache.write_at(
            temp_path,
            slice.file_offset + (begin - slice.tail_offset),
            &data[(begin - range_off) as usize..(end - range_off) as usize],
        )?;
    }
    Ok(())
}

/// Replay inline tails and fix the length of a restored file.
fn finalize_file(map: &BlockMap, file_index: FileIndex, temp_path: &Path) -> Result<()> {
    let file = &map.files[file_index.as_usize()];
    let mut write_cache = HandleCache::writer();

    let mut offset = 0u64;
    for chunk in &map.chunks[file.chunks.clone()] {
        match chunk {
            Chunk::Unprotected { length } => offset += length,
            Chunk::Protected { size, tail, .. } => {
                if let Tail::Inline(bytes) = tail {
                    write_cache.write_at(temp_path, offset + size - bytes.len() as u64, bytes)?;
                }
                offset += size;
            }
        }
    }
    write_cache.drop_handle(temp_path);

    let handle = std::fs::OpenOptions::new().write(true).open(temp_path)?;
    handle.set_len(file.size)?;
    Ok(())
}

fn hash_file(path: &Path) -> Result<crate::domain::Hash128> {
    let mut reader = std::io::BufReader::with_capacity(1 << 20, File::open(path)?);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 1 << 20];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    Ok(crate::domain::Hash128::new(out))
}

/// Re-apply the stored mode to a restored file when a UNIX Permissions
/// Packet is attached. Timestamps are reported by verify but not rewound.
fn apply_permissions(set: &PacketSet, options: &[[u8; 16]], target: &Path) -> Result<()> {
    for checksum in options {
        if let Some(crate::packets::PermissionsPacket::Unix(stored)) = set.permission(checksum) {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(
                    target,
                    std::fs::Permissions::from_mode(stored.mode as u32),
                )?;
            }
            #[cfg(not(unix))]
            {
                let _ = (stored, target);
            }
        }
    }
    Ok(())
}

/// Rename an existing file to `<name>.<n>` with the smallest free `n`.
fn backup_aside(path: &Path) -> Result<()> {
    for n in 1u32.. {
        let backup = PathBuf::from(format!("{}.{n}", path.display()));
        if !backup.exists() {
            std::fs::rename(path, &backup)?;
            return Ok(());
        }
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::blake3_128;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn backup_picks_first_free_suffix() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file.bin");
        std::fs::write(&target, b"current").unwrap();
        std::fs::write(dir.path().join("file.bin.1"), b"old").unwrap();

        backup_aside(&target).unwrap();
        assert!(!target.exists());
        assert_eq!(std::fs::read(dir.path().join("file.bin.2")).unwrap(), b"current");
    }

    #[test]
    fn hash_file_matches_blake3_128() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"some file content").unwrap();
        drop(f);
        assert_eq!(hash_file(&path).unwrap(), blake3_128(b"some file content"));
    }
}
