//! Core domain types for PAR3 operations
//!
//! Type-safe wrappers for the identifiers and hash values that flow through
//! the engine. PAR3 carries two easily-confused 16-byte values (packet
//! checksums and content fingerprints) plus an 8-byte set identifier and
//! 64-bit rolling checksums; the newtypes below make it impossible to mix
//! them up at compile time.

/// 8-byte identifier of a whole protected set.
///
/// Derived from the Start Packet body, which itself folds in a globally
/// unique random hashed from the input contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SetId([u8; 8]);

impl SetId {
    pub fn new(bytes: [u8; 8]) -> Self {
        SetId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Lower-case hex form used in temporary file names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 8]> for SetId {
    fn from(bytes: [u8; 8]) -> Self {
        SetId::new(bytes)
    }
}

impl AsRef<[u8; 8]> for SetId {
    fn as_ref(&self) -> &[u8; 8] {
        &self.0
    }
}

impl std::fmt::Display for SetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// 16-byte BLAKE3 truncation identifying a packet (bytes 8..24 of the header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketChecksum([u8; 16]);

impl PacketChecksum {
    pub fn new(bytes: [u8; 16]) -> Self {
        PacketChecksum(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for PacketChecksum {
    fn from(bytes: [u8; 16]) -> Self {
        PacketChecksum::new(bytes)
    }
}

impl AsRef<[u8; 16]> for PacketChecksum {
    fn as_ref(&self) -> &[u8; 16] {
        &self.0
    }
}

/// 16-byte BLAKE3 truncation fingerprinting block or file content.
/// Distinct from [`PacketChecksum`] to keep container identity and content
/// identity apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash128([u8; 16]);

impl Hash128 {
    pub fn new(bytes: [u8; 16]) -> Self {
        Hash128(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for Hash128 {
    fn from(bytes: [u8; 16]) -> Self {
        Hash128::new(bytes)
    }
}

impl AsRef<[u8; 16]> for Hash128 {
    fn as_ref(&self) -> &[u8; 16] {
        &self.0
    }
}

impl PartialEq<[u8; 16]> for Hash128 {
    fn eq(&self, other: &[u8; 16]) -> bool {
        &self.0 == other
    }
}

/// 64-bit rolling checksum value (CRC-64/XZ).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Crc64Value(u64);

impl Crc64Value {
    pub fn new(value: u64) -> Self {
        Crc64Value(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Crc64Value(u64::from_le_bytes(bytes))
    }
}

impl From<u64> for Crc64Value {
    fn from(value: u64) -> Self {
        Crc64Value::new(value)
    }
}

impl PartialEq<u64> for Crc64Value {
    fn eq(&self, other: &u64) -> bool {
        self.0 == *other
    }
}

impl std::fmt::Display for Crc64Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Index of an input (or recovery) block within the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIndex(pub u64);

impl BlockIndex {
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index into the slice arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SliceIndex(pub usize);

/// Index into the input-file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileIndex(pub u32);

impl FileIndex {
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for FileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_id_hex_is_lowercase_and_16_chars() {
        let id = SetId::new([0xAB, 0xCD, 0, 1, 2, 3, 4, 0xEF]);
        assert_eq!(id.to_hex(), "abcd0001020304ef");
        assert_eq!(id.to_hex().len(), 16);
    }

    #[test]
    fn crc64_round_trips_le_bytes() {
        let crc = Crc64Value::new(0x0123_4567_89ab_cdef);
        assert_eq!(Crc64Value::from_le_bytes(crc.to_le_bytes()), crc);
    }

    #[test]
    fn hash128_compares_with_raw_array() {
        let raw = [7u8; 16];
        assert_eq!(Hash128::new(raw), raw);
    }
}
