//! UNIX and FAT Permissions Packets
//!
//! Optional per-file metadata, referenced from the option fields of File
//! and Directory packets by checksum. The UNIX packet carries the three
//! timestamps, owner ids, and the mode; the FAT packet carries the three
//! FAT timestamps and the attribute word. Owner and group names are
//! supported by the format but not stored here, so their length fields
//! stay zero.

use super::file_packet::Reader;
use crate::error::{Error, Result};

pub const UNIX_TYPE_TAG: &[u8; 8] = b"PAR UNX\0";
pub const FAT_TYPE_TAG: &[u8; 8] = b"PAR FAT\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixPermissionsPacket {
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
}

impl UnixPermissionsPacket {
    /// Capture the current metadata of a file. Timestamps are seconds
    /// since the epoch; owner and mode fields are zero on platforms that
    /// do not expose them.
    #[cfg(unix)]
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        UnixPermissionsPacket {
            atime: metadata.atime().max(0) as u64,
            ctime: metadata.ctime().max(0) as u64,
            mtime: metadata.mtime().max(0) as u64,
            uid: metadata.uid(),
            gid: metadata.gid(),
            mode: metadata.mode() as u16,
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        UnixPermissionsPacket {
            atime: epoch_seconds(metadata.accessed().ok()),
            ctime: 0,
            mtime: epoch_seconds(metadata.modified().ok()),
            uid: 0,
            gid: 0,
            mode: 0,
        }
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let atime = r.u64()?;
        let ctime = r.u64()?;
        let mtime = r.u64()?;
        let uid = r.u32()?;
        let gid = r.u32()?;
        let mode = r.u16()?;
        let owner_len = r.u8()? as usize;
        let group_len = r.u8()? as usize;
        // Names are identification only; skip them when present
        r.bytes(owner_len)?;
        r.bytes(group_len)
            .map_err(|_| Error::Logic("truncated UNIX permissions packet".into()))?;
        Ok(UnixPermissionsPacket {
            atime,
            ctime,
            mtime,
            uid,
            gid,
            mode,
        })
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(36);
        body.extend_from_slice(&self.atime.to_le_bytes());
        body.extend_from_slice(&self.ctime.to_le_bytes());
        body.extend_from_slice(&self.mtime.to_le_bytes());
        body.extend_from_slice(&self.uid.to_le_bytes());
        body.extend_from_slice(&self.gid.to_le_bytes());
        body.extend_from_slice(&self.mode.to_le_bytes());
        body.push(0); // owner name length
        body.push(0); // group name length
        body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatPermissionsPacket {
    pub creation_time: u64,
    pub access_time: u64,
    pub write_time: u64,
    pub attributes: u16,
}

impl FatPermissionsPacket {
    /// Capture the current metadata of a file.
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        FatPermissionsPacket {
            creation_time: epoch_seconds(metadata.created().ok()),
            access_time: epoch_seconds(metadata.accessed().ok()),
            write_time: epoch_seconds(metadata.modified().ok()),
            attributes: 0,
        }
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let creation_time = r.u64()?;
        let access_time = r.u64()?;
        let write_time = r.u64()?;
        let attributes = r
            .u16()
            .map_err(|_| Error::Logic("truncated FAT permissions packet".into()))?;
        Ok(FatPermissionsPacket {
            creation_time,
            access_time,
            write_time,
            attributes,
        })
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(26);
        body.extend_from_slice(&self.creation_time.to_le_bytes());
        body.extend_from_slice(&self.access_time.to_le_bytes());
        body.extend_from_slice(&self.write_time.to_le_bytes());
        body.extend_from_slice(&self.attributes.to_le_bytes());
        body
    }
}

fn epoch_seconds(time: Option<std::time::SystemTime>) -> u64 {
    time.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Either flavor, as stored in a packet set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionsPacket {
    Unix(UnixPermissionsPacket),
    Fat(FatPermissionsPacket),
}

impl PermissionsPacket {
    pub fn type_tag(&self) -> &'static [u8; 8] {
        match self {
            PermissionsPacket::Unix(_) => UNIX_TYPE_TAG,
            PermissionsPacket::Fat(_) => FAT_TYPE_TAG,
        }
    }

    pub fn to_body(&self) -> Vec<u8> {
        match self {
            PermissionsPacket::Unix(p) => p.to_body(),
            PermissionsPacket::Fat(p) => p.to_body(),
        }
    }
}
