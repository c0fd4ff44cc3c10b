//! Start Packet: block size and Galois-field parameters
//!
//! The Start Packet is the anchor of a set: its body feeds the Set-ID hash,
//! and every other packet references the set through that ID. The parent
//! fields support incremental backup sets and stay zeroed here.

use binrw::{BinRead, BinReaderExt, BinWrite};
use std::io::Cursor;

use crate::codec::FieldChoice;
use crate::error::{Error, Result};

pub const TYPE_TAG: &[u8; 8] = b"PAR STA\0";

#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(little)]
pub struct StartPacket {
    pub parent_set_id: [u8; 8],
    pub parent_root: [u8; 16],
    pub block_size: u64,
    pub gf_size: u8,
    /// Generator polynomial, low byte first, top bit stripped.
    #[br(count = gf_size)]
    pub polynomial: Vec<u8>,
}

impl StartPacket {
    pub fn new(block_size: u64, field: FieldChoice) -> Self {
        let mut polynomial = Vec::with_capacity(field.gf_size as usize);
        let stripped = field.polynomial & !(1u32 << (8 * field.gf_size));
        for i in 0..field.gf_size {
            polynomial.push((stripped >> (8 * i)) as u8);
        }
        StartPacket {
            parent_set_id: [0; 8],
            parent_root: [0; 16],
            block_size,
            gf_size: field.gf_size,
            polynomial,
        }
    }

    /// Reconstruct the full polynomial, top bit included.
    pub fn field_choice(&self) -> Result<FieldChoice> {
        if self.gf_size == 0 || self.gf_size > 2 {
            return Err(Error::Logic(format!(
                "unsupported Galois field size {}",
                self.gf_size
            )));
        }
        let mut polynomial = 1u32 << (8 * self.gf_size);
        for (i, &byte) in self.polynomial.iter().enumerate() {
            polynomial |= (byte as u32) << (8 * i);
        }
        Ok(FieldChoice {
            gf_size: self.gf_size,
            polynomial,
        })
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(body);
        cursor
            .read_le()
            .map_err(|e| Error::Logic(format!("malformed Start packet: {e}")))
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        self.write_le(&mut cursor).expect("in-memory write");
        cursor.into_inner()
    }
}
