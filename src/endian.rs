//! Byte order for every fixed-width field in the container
//!
//! The byte order is not recorded in the header; both the writer and any
//! later reader must agree on it through their options.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endianness::Little => LittleEndian::read_u16(buf),
            Endianness::Big => BigEndian::read_u16(buf),
        }
    }

    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endianness::Little => LittleEndian::read_u32(buf),
            Endianness::Big => BigEndian::read_u32(buf),
        }
    }

    pub fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            Endianness::Little => LittleEndian::read_u64(buf),
            Endianness::Big => BigEndian::read_u64(buf),
        }
    }

    pub fn write_u16(self, buf: &mut [u8], value: u16) {
        match self {
            Endianness::Little => LittleEndian::write_u16(buf, value),
            Endianness::Big => BigEndian::write_u16(buf, value),
        }
    }

    pub fn write_u32(self, buf: &mut [u8], value: u32) {
        match self {
            Endianness::Little => LittleEndian::write_u32(buf, value),
            Endianness::Big => BigEndian::write_u32(buf, value),
        }
    }

    pub fn write_u64(self, buf: &mut [u8], value: u64) {
        match self {
            Endianness::Little => LittleEndian::write_u64(buf, value),
            Endianness::Big => BigEndian::write_u64(buf, value),
        }
    }

    /// Encode a u64 into a fresh 8-byte array
    pub fn u64_bytes(self, value: u64) -> [u8; 8] {
        let mut buf = [0u8; 8];
        self.write_u64(&mut buf, value);
        buf
    }
}
