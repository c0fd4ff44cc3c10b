//! PAR3 packet container
//!
//! Every packet is `"PAR3\0PKT"` ‖ 16-byte checksum ‖ 8-byte length ‖
//! 8-byte Set-ID ‖ 8-byte type tag, followed by the body. The checksum is a
//! BLAKE3 truncation over everything from the length field to the end, so a
//! packet is self-validating, and its checksum doubles as its identity for
//! deduplication and for the parent references in Directory/Root packets.
//!
//! Files may contain arbitrary bytes between packets; the scanner searches
//! for the magic at every offset and tolerates interleaving and
//! misalignment. Packets whose declared length is implausible or whose
//! recomputed checksum disagrees are skipped, never truncated.

pub mod data_packet;
pub mod directory_packet;
pub mod external_data_packet;
pub mod file_packet;
pub mod matrix_packet;
pub mod permission_packet;
pub mod root_packet;
pub mod start_packet;
pub mod text_packet;

pub use data_packet::DataPacketMeta;
pub use directory_packet::DirectoryPacket;
pub use external_data_packet::ExternalDataPacket;
pub use file_packet::FilePacket;
pub use matrix_packet::{CauchyMatrixPacket, FftMatrixPacket, MatrixPacket};
pub use permission_packet::{FatPermissionsPacket, PermissionsPacket, UnixPermissionsPacket};
pub use root_packet::RootPacket;
pub use start_packet::StartPacket;

use crate::checksum::blake3_128;
use crate::domain::{PacketChecksum, SetId};
use crate::error::{Error, Result};
use log::debug;
use rustc_hash::FxHashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub const MAGIC: &[u8; 8] = b"PAR3\0PKT";
pub const HEADER_SIZE: u64 = 48;

/// Largest body the scanner will hold in memory whole; recovery and data
/// payloads are skipped over instead.
const MAX_INLINE_BODY: u64 = 1 << 30;

/// Assemble a complete packet: header, checksum, body.
pub fn make_packet(set_id: SetId, type_tag: &[u8; 8], body: &[u8]) -> Vec<u8> {
    let length = HEADER_SIZE + body.len() as u64;
    let mut packet = Vec::with_capacity(length as usize);
    packet.extend_from_slice(MAGIC);
    packet.extend_from_slice(&[0u8; 16]);
    packet.extend_from_slice(&length.to_le_bytes());
    packet.extend_from_slice(set_id.as_bytes());
    packet.extend_from_slice(type_tag);
    packet.extend_from_slice(body);
    let checksum = blake3_128(&packet[24..]);
    packet[8..24].copy_from_slice(checksum.as_bytes());
    packet
}

/// Checksum of an assembled packet (bytes 8..24 of its header).
pub fn checksum_of(packet: &[u8]) -> PacketChecksum {
    let mut out = [0u8; 16];
    out.copy_from_slice(&packet[8..24]);
    PacketChecksum::new(out)
}

/// Parsed 48-byte packet header.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub checksum: PacketChecksum,
    pub length: u64,
    pub set_id: SetId,
    pub type_tag: [u8; 8],
}

impl PacketHeader {
    pub fn parse(raw: &[u8; 48]) -> Option<Self> {
        if &raw[..8] != MAGIC {
            return None;
        }
        let mut checksum = [0u8; 16];
        checksum.copy_from_slice(&raw[8..24]);
        let length = u64::from_le_bytes(raw[24..32].try_into().unwrap());
        let mut set_id = [0u8; 8];
        set_id.copy_from_slice(&raw[32..40]);
        let mut type_tag = [0u8; 8];
        type_tag.copy_from_slice(&raw[40..48]);
        Some(PacketHeader {
            checksum: PacketChecksum::new(checksum),
            length,
            set_id: SetId::new(set_id),
            type_tag,
        })
    }
}

/// Body of a scanned packet: small bodies inline, bulk payloads by
/// reference into their source file.
#[derive(Debug, Clone)]
pub enum PacketBody {
    Inline(Vec<u8>),
    /// Fixed preamble plus the location of the remaining payload.
    Payload {
        preamble: Vec<u8>,
        payload_offset: u64,
        payload_len: u64,
    },
}

/// One packet found in a file, checksum-verified.
#[derive(Debug, Clone)]
pub struct LocatedPacket {
    pub header: PacketHeader,
    pub body: PacketBody,
    pub source: PathBuf,
    pub offset: u64,
}

/// Scan a file for packets at any offset.
///
/// Returns every packet whose checksum verifies; malformed candidates are
/// skipped and the scan resumes one byte after their magic.
pub fn read_packets_from_file(path: &Path) -> Result<Vec<LocatedPacket>> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut packets = Vec::new();

    const SCAN_CHUNK: usize = 1 << 20;
    let mut offset = 0u64;
    let mut chunk = vec![0u8; SCAN_CHUNK];

    while offset + HEADER_SIZE <= file_len {
        let want = SCAN_CHUNK.min((file_len - offset) as usize);
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut chunk[..want])?;

        let Some(pos) = find_magic(&chunk[..want]) else {
            if (offset + want as u64) >= file_len {
                break;
            }
            // Overlap by the magic length so a split match is still seen
            offset += (want - (MAGIC.len() - 1)) as u64;
            continue;
        };

        let packet_offset = offset + pos as u64;
        match read_packet_at(&mut file, path, packet_offset, file_len)? {
            Some(packet) => {
                let length = packet.header.length;
                packets.push(packet);
                offset = packet_offset + length;
            }
            None => {
                offset = packet_offset + 1;
            }
        }
    }

    Ok(packets)
}

fn find_magic(chunk: &[u8]) -> Option<usize> {
    chunk.windows(MAGIC.len()).position(|w| w == MAGIC)
}

pub const RECOVERY_TYPE_TAG: &[u8; 8] = b"PAR REC\0";
pub const RECOVERY_PREAMBLE_LEN: u64 = 40;

/// Payload-carrying packet types whose bulk stays on disk during a scan.
fn preamble_len(type_tag: &[u8; 8]) -> Option<u64> {
    if type_tag == data_packet::TYPE_TAG {
        Some(data_packet::PREAMBLE_LEN)
    } else if type_tag == RECOVERY_TYPE_TAG {
        Some(RECOVERY_PREAMBLE_LEN)
    } else {
        None
    }
}

fn read_packet_at(
    file: &mut File,
    path: &Path,
    packet_offset: u64,
    file_len: u64,
) -> Result<Option<LocatedPacket>> {
    let mut raw_header = [0u8; 48];
    file.seek(SeekFrom::Start(packet_offset))?;
    if file.read_exact(&mut raw_header).is_err() {
        return Ok(None);
    }
    let Some(header) = PacketHeader::parse(&raw_header) else {
        return Ok(None);
    };
    if header.length < HEADER_SIZE || packet_offset + header.length > file_len {
        debug!(
            "packet at {}:{packet_offset} has implausible length {}",
            path.display(),
            header.length
        );
        return Ok(None);
    }

    let body_len = header.length - HEADER_SIZE;
    let body = match preamble_len(&header.type_tag) {
        Some(fixed) if body_len >= fixed => {
            let mut preamble = vec![0u8; fixed as usize];
            file.read_exact(&mut preamble)?;
            // Verify the checksum by streaming the payload through the hasher
            let mut hasher = blake3::Hasher::new();
            hasher.update(&raw_header[24..]);
            hasher.update(&preamble);
            let mut remaining = body_len - fixed;
            let mut buf = vec![0u8; (1 << 20).min(remaining.max(1) as usize)];
            while remaining > 0 {
                let take = buf.len().min(remaining as usize);
                if file.read_exact(&mut buf[..take]).is_err() {
                    return Ok(None);
                }
                hasher.update(&buf[..take]);
                remaining -= take as u64;
            }
            if hasher.finalize().as_bytes()[..16] != *header.checksum.as_bytes() {
                debug!("packet at {}:{packet_offset} failed checksum", path.display());
                return Ok(None);
            }
            PacketBody::Payload {
                preamble,
                payload_offset: packet_offset + HEADER_SIZE + fixed,
                payload_len: body_len - fixed,
            }
        }
        _ => {
            if body_len > MAX_INLINE_BODY {
                return Ok(None);
            }
            let mut body = vec![0u8; body_len as usize];
            if file.read_exact(&mut body).is_err() {
                return Ok(None);
            }
            let mut hasher = blake3::Hasher::new();
            hasher.update(&raw_header[24..]);
            hasher.update(&body);
            if hasher.finalize().as_bytes()[..16] != *header.checksum.as_bytes() {
                debug!("packet at {}:{packet_offset} failed checksum", path.display());
                return Ok(None);
            }
            PacketBody::Inline(body)
        }
    };

    Ok(Some(LocatedPacket {
        header,
        body,
        source: path.to_path_buf(),
        offset: packet_offset,
    }))
}

/// Per-recovery-block metadata retained from scanned Recovery Data packets.
#[derive(Debug, Clone)]
pub struct RecoveryDataMeta {
    pub recovery_index: u64,
    pub root_checksum: [u8; 16],
    pub matrix_checksum: PacketChecksum,
    pub source: PathBuf,
    pub payload_offset: u64,
    pub payload_len: u64,
}

/// All packets of one set, parsed and indexed by type.
#[derive(Debug)]
pub struct PacketSet {
    pub set_id: SetId,
    pub start: StartPacket,
    pub matrix: MatrixPacket,
    pub matrix_checksum: PacketChecksum,
    pub root: RootPacket,
    pub root_checksum: PacketChecksum,
    pub files: Vec<(PacketChecksum, FilePacket)>,
    pub dirs: Vec<(PacketChecksum, DirectoryPacket)>,
    pub permissions: Vec<(PacketChecksum, PermissionsPacket)>,
    pub external: Vec<ExternalDataPacket>,
    pub recovery: Vec<RecoveryDataMeta>,
    pub data: Vec<DataPacketMeta>,
    pub creator: Option<String>,
    pub comment: Option<String>,
}

impl PacketSet {
    /// Index packets by type and checksum, dropping duplicates. The set
    /// identity is taken from the first Start packet seen; packets of other
    /// sets are ignored.
    pub fn assemble(packets: &[LocatedPacket]) -> Result<Self> {
        let start_packet = packets
            .iter()
            .find(|p| p.header.type_tag == *start_packet::TYPE_TAG)
            .ok_or_else(|| Error::Logic("no Start packet found".into()))?;
        let set_id = start_packet.header.set_id;
        let start = match &start_packet.body {
            PacketBody::Inline(body) => StartPacket::parse(body)?,
            _ => return Err(Error::Logic("Start packet with deferred body".into())),
        };
        let block_size = start.block_size;

        let mut seen: FxHashSet<PacketChecksum> = FxHashSet::default();
        let mut matrix = None;
        let mut root = None;
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        let mut permissions = Vec::new();
        let mut external = Vec::new();
        let mut recovery: Vec<RecoveryDataMeta> = Vec::new();
        let mut data = Vec::new();
        let mut creator = None;
        let mut comment = None;

        for packet in packets {
            if packet.header.set_id != set_id
                && packet.header.type_tag != *start_packet::TYPE_TAG
            {
                continue;
            }
            if !seen.insert(packet.header.checksum) {
                continue;
            }
            let tag = &packet.header.type_tag;
            match (&packet.body, tag) {
                (PacketBody::Inline(body), tag) if tag == matrix_packet::CAUCHY_TYPE_TAG => {
                    let parsed = CauchyMatrixPacket::parse(body)?;
                    matrix.get_or_insert((
                        MatrixPacket::Cauchy(parsed),
                        packet.header.checksum,
                    ));
                }
                (PacketBody::Inline(body), tag) if tag == matrix_packet::FFT_TYPE_TAG => {
                    let parsed = FftMatrixPacket::parse(body)?;
                    matrix.get_or_insert((MatrixPacket::Fft(parsed), packet.header.checksum));
                }
                (PacketBody::Inline(body), tag) if tag == file_packet::TYPE_TAG => {
                    files.push((packet.header.checksum, FilePacket::parse(body, block_size)?));
                }
                (PacketBody::Inline(body), tag) if tag == directory_packet::TYPE_TAG => {
                    dirs.push((packet.header.checksum, DirectoryPacket::parse(body)?));
                }
                (PacketBody::Inline(body), tag) if tag == root_packet::TYPE_TAG => {
                    root.get_or_insert((RootPacket::parse(body)?, packet.header.checksum));
                }
                (PacketBody::Inline(body), tag) if tag == permission_packet::UNIX_TYPE_TAG => {
                    permissions.push((
                        packet.header.checksum,
                        PermissionsPacket::Unix(UnixPermissionsPacket::parse(body)?),
                    ));
                }
                (PacketBody::Inline(body), tag) if tag == permission_packet::FAT_TYPE_TAG => {
                    permissions.push((
                        packet.header.checksum,
                        PermissionsPacket::Fat(FatPermissionsPacket::parse(body)?),
                    ));
                }
                (PacketBody::Inline(body), tag) if tag == external_data_packet::TYPE_TAG => {
                    external.push(ExternalDataPacket::parse(body)?);
                }
                (PacketBody::Inline(body), tag) if tag == text_packet::CREATOR_TYPE_TAG => {
                    creator.get_or_insert_with(|| String::from_utf8_lossy(body).into_owned());
                }
                (PacketBody::Inline(body), tag) if tag == text_packet::COMMENT_TYPE_TAG => {
                    comment.get_or_insert_with(|| String::from_utf8_lossy(body).into_owned());
                }
                (
                    PacketBody::Payload {
                        preamble,
                        payload_offset,
                        payload_len,
                    },
                    tag,
                ) if tag == RECOVERY_TYPE_TAG => {
                    let meta = recovery_meta(
                        preamble,
                        &packet.source,
                        *payload_offset,
                        *payload_len,
                    )?;
                    recovery.push(meta);
                }
                (
                    PacketBody::Payload {
                        preamble,
                        payload_offset,
                        payload_len,
                    },
                    tag,
                ) if tag == data_packet::TYPE_TAG => {
                    data.push(data_packet::DataPacketMeta::from_preamble(
                        preamble,
                        &packet.source,
                        *payload_offset,
                        *payload_len,
                    )?);
                }
                (_, tag) if tag == start_packet::TYPE_TAG => {}
                _ => {
                    debug!("ignoring packet with unknown type {:?}", tag);
                }
            }
        }

        let (matrix, matrix_checksum) = matrix
            .ok_or_else(|| Error::Logic("no Matrix packet found".into()))?;
        let (root, root_checksum) =
            root.ok_or_else(|| Error::Logic("no Root packet found".into()))?;

        recovery.sort_by_key(|r| r.recovery_index);

        Ok(PacketSet {
            set_id,
            start,
            matrix,
            matrix_checksum,
            root,
            root_checksum,
            files,
            dirs,
            permissions,
            external,
            recovery,
            data,
            creator,
            comment,
        })
    }

    /// Recovery blocks that belong to this set's matrix.
    pub fn usable_recovery(&self) -> impl Iterator<Item = &RecoveryDataMeta> {
        self.recovery
            .iter()
            .filter(move |r| r.matrix_checksum == self.matrix_checksum)
    }

    /// Look up an option packet by the checksum a File or Directory packet
    /// references it with.
    pub fn permission(&self, checksum: &[u8; 16]) -> Option<&PermissionsPacket> {
        self.permissions
            .iter()
            .find(|(c, _)| c.as_bytes() == checksum)
            .map(|(_, p)| p)
    }
}

fn recovery_meta(
    preamble: &[u8],
    source: &Path,
    payload_offset: u64,
    payload_len: u64,
) -> Result<RecoveryDataMeta> {
    if preamble.len() != RECOVERY_PREAMBLE_LEN as usize {
        return Err(Error::Logic("short Recovery Data preamble".into()));
    }
    let recovery_index = u64::from_le_bytes(preamble[..8].try_into().unwrap());
    let mut root_checksum = [0u8; 16];
    root_checksum.copy_from_slice(&preamble[8..24]);
    let mut matrix_checksum = [0u8; 16];
    matrix_checksum.copy_from_slice(&preamble[24..40]);
    Ok(RecoveryDataMeta {
        recovery_index,
        root_checksum,
        matrix_checksum: PacketChecksum::new(matrix_checksum),
        source: source.to_path_buf(),
        payload_offset,
        payload_len,
    })
}

/// Build a complete Recovery Data packet around a payload region.
pub fn make_recovery_packet(
    set_id: SetId,
    recovery_index: u64,
    root_checksum: &PacketChecksum,
    matrix_checksum: &PacketChecksum,
    payload: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(RECOVERY_PREAMBLE_LEN as usize + payload.len());
    body.extend_from_slice(&recovery_index.to_le_bytes());
    body.extend_from_slice(root_checksum.as_bytes());
    body.extend_from_slice(matrix_checksum.as_bytes());
    body.extend_from_slice(payload);
    make_packet(set_id, RECOVERY_TYPE_TAG, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn packet_checksum_covers_length_to_end() {
        let set_id = SetId::new([1; 8]);
        let packet = make_packet(set_id, b"PAR CRE\0", b"par3rs test");
        assert_eq!(&packet[..8], MAGIC);
        assert_eq!(checksum_of(&packet), {
            let h = blake3_128(&packet[24..]);
            PacketChecksum::new(*h.as_bytes())
        });
        let header = PacketHeader::parse(packet[..48].try_into().unwrap()).unwrap();
        assert_eq!(header.length, packet.len() as u64);
        assert_eq!(header.set_id, set_id);
        assert_eq!(&header.type_tag, b"PAR CRE\0");
    }

    #[test]
    fn scanner_finds_packets_between_junk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.par3");
        let set_id = SetId::new([2; 8]);
        let first = make_packet(set_id, b"PAR CRE\0", b"creator");
        let second = make_packet(set_id, b"PAR COM\0", b"comment");

        let mut f = File::create(&path).unwrap();
        f.write_all(b"garbage prefix").unwrap();
        f.write_all(&first).unwrap();
        f.write_all(&[0xEE; 17]).unwrap();
        f.write_all(&second).unwrap();
        f.write_all(b"trailing").unwrap();
        drop(f);

        let packets = read_packets_from_file(&path).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0].header.type_tag, b"PAR CRE\0");
        assert_eq!(&packets[1].header.type_tag, b"PAR COM\0");
    }

    #[test]
    fn scanner_skips_corrupted_packet_but_keeps_later_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.par3");
        let set_id = SetId::new([3; 8]);
        let mut first = make_packet(set_id, b"PAR CRE\0", b"creator");
        let second = make_packet(set_id, b"PAR COM\0", b"comment");
        // Flip a body byte so the checksum no longer matches
        let body_at = first.len() - 1;
        first[body_at] ^= 0xFF;

        let mut f = File::create(&path).unwrap();
        f.write_all(&first).unwrap();
        f.write_all(&second).unwrap();
        drop(f);

        let packets = read_packets_from_file(&path).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].header.type_tag, b"PAR COM\0");
    }

    #[test]
    fn recovery_packet_round_trips_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.par3");
        let set_id = SetId::new([4; 8]);
        let root = PacketChecksum::new([5; 16]);
        let matrix = PacketChecksum::new([6; 16]);
        let payload = vec![0xABu8; 512];
        let packet = make_recovery_packet(set_id, 9, &root, &matrix, &payload);

        std::fs::write(&path, &packet).unwrap();
        let packets = read_packets_from_file(&path).unwrap();
        assert_eq!(packets.len(), 1);
        match &packets[0].body {
            PacketBody::Payload {
                preamble,
                payload_offset,
                payload_len,
            } => {
                let meta = recovery_meta(preamble, &path, *payload_offset, *payload_len).unwrap();
                assert_eq!(meta.recovery_index, 9);
                assert_eq!(meta.matrix_checksum, matrix);
                assert_eq!(meta.payload_len, 512);
                assert_eq!(meta.payload_offset, 48 + 40);
            }
            other => panic!("expected payload body, got {other:?}"),
        }
    }
}
