//! PAR3 file discovery and I/O plumbing
//!
//! Finds the sibling volume files of an index file, loads and deduplicates
//! packets across all of them, and provides the small open-handle cache the
//! engine uses so block-by-block access does not reopen files constantly.

use crate::error::Result;
use crate::packets::{read_packets_from_file, LocatedPacket, PacketSet};
use log::debug;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Collect the index file and every sibling `.par3` file sharing its base
/// name (recovery volumes `.vol<first>+<count>.par3` and data volumes
/// `.part<first>+<count>.par3`).
pub fn collect_par_files(index_path: &Path) -> Vec<PathBuf> {
    let mut files = vec![index_path.to_path_buf()];

    let stem = index_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = stem.strip_suffix(".par3").unwrap_or(&stem);

    let dir = match index_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path == *index_path {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_sibling = name
                .strip_prefix(base)
                .map(|rest| {
                    (rest.starts_with(".vol") || rest.starts_with(".part"))
                        && rest.ends_with(".par3")
                })
                .unwrap_or(false);
            if is_sibling {
                files.push(path);
            }
        }
    }

    files.sort();
    files
}

/// Load every packet from the given files and assemble the set.
/// Duplicate packets across files collapse by checksum.
pub fn load_packet_set(par_files: &[PathBuf]) -> Result<PacketSet> {
    let mut all: Vec<LocatedPacket> = Vec::new();
    for path in par_files {
        match read_packets_from_file(path) {
            Ok(mut packets) => {
                debug!("loaded {} packets from {}", packets.len(), path.display());
                all.append(&mut packets);
            }
            Err(err) => {
                debug!("skipping unreadable {}: {err}", path.display());
            }
        }
    }
    PacketSet::assemble(&all)
}

/// Open-handle cache with a fixed number of slots, least-recently-used
/// eviction, keyed by path.
pub struct HandleCache {
    capacity: usize,
    writable: bool,
    slots: VecDeque<(PathBuf, File)>,
}

impl HandleCache {
    /// Read-only cache; the engine keeps one of these per operation.
    pub fn reader() -> Self {
        HandleCache {
            capacity: 2,
            writable: false,
            slots: VecDeque::new(),
        }
    }

    /// Read-write cache used for temporary output files.
    pub fn writer() -> Self {
        HandleCache {
            capacity: 2,
            writable: true,
            slots: VecDeque::new(),
        }
    }

    pub fn get(&mut self, path: &Path) -> io::Result<&mut File> {
        if let Some(at) = self.slots.iter().position(|(p, _)| p == path) {
            // Move to the front slot
            let slot = self.slots.remove(at).unwrap();
            self.slots.push_front(slot);
        } else {
            let file = if self.writable {
                OpenOptions::new().read(true).write(true).open(path)?
            } else {
                File::open(path)?
            };
            if self.slots.len() >= self.capacity {
                self.slots.pop_back();
            }
            self.slots.push_front((path.to_path_buf(), file));
        }
        Ok(&mut self.slots.front_mut().unwrap().1)
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&mut self, path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let file = self.get(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    /// Write all of `data` at `offset`.
    pub fn write_at(&mut self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        let file = self.get(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    pub fn drop_handle(&mut self, path: &Path) {
        self.slots.retain(|(p, _)| p != path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn collects_index_and_matching_volumes() {
        let dir = TempDir::new().unwrap();
        for name in [
            "set.par3",
            "set.vol00+02.par3",
            "set.vol02+04.par3",
            "set.part00+10.par3",
            "other.par3",
            "set.notes.txt",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let files = collect_par_files(&dir.path().join("set.par3"));
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "set.par3",
                "set.part00+10.par3",
                "set.vol00+02.par3",
                "set.vol02+04.par3",
            ]
        );
    }

    #[test]
    fn handle_cache_reuses_and_evicts() {
        let dir = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = (0..3)
            .map(|i| {
                let p = dir.path().join(format!("f{i}"));
                fs::write(&p, vec![i as u8; 16]).unwrap();
                p
            })
            .collect();

        let mut cache = HandleCache::reader();
        let mut buf = [0u8; 4];
        cache.read_at(&paths[0], 0, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
        cache.read_at(&paths[1], 4, &mut buf).unwrap();
        assert_eq!(buf, [1; 4]);
        // Third file evicts the least-recently-used slot
        cache.read_at(&paths[2], 8, &mut buf).unwrap();
        assert_eq!(buf, [2; 4]);
        assert_eq!(cache.slots.len(), 2);
        // Still correct after eviction forces a reopen
        cache.read_at(&paths[0], 12, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
    }
}
