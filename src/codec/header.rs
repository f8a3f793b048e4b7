//! Fixed 8-byte node header.
//!
//! Bit layout (LSB first):
//! ```text
//! bit 0      is_inner_node
//! bit 1      has_refs
//! bit 2      context_flag
//! bits 3-5   encoding (3 bits)
//! bits 6-13  width (8 bits; literal bit-width for WidthBits, otherwise the
//!            per-element width of the value table for Packed/Flex — see
//!            ExtendedHeader for the rest of their parameters)
//! bits 14-37 size (24 bits)
//! bits 38-61 capacity_or_checksum (24 bits)
//! bits 62-63 reserved
//! ```

use crate::error::{EngineError, Result};

pub const HEADER_BYTES: usize = 8;
pub const EXTENDED_HEADER_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    WidthBits = 0,
    Packed = 1,
    Flex = 2,
    Extended = 3,
}

impl Encoding {
    fn from_bits(bits: u64) -> Result<Self> {
        match bits {
            0 => Ok(Encoding::WidthBits),
            1 => Ok(Encoding::Packed),
            2 => Ok(Encoding::Flex),
            3 => Ok(Encoding::Extended),
            other => Err(EngineError::InvalidFileFormat(format!(
                "unknown node encoding tag {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub is_inner_node: bool,
    pub has_refs: bool,
    pub context_flag: bool,
    pub encoding: Encoding,
    pub width: u8,
    pub size: u32,
    pub capacity_or_checksum: u32,
}

const SIZE_MASK: u64 = (1 << 24) - 1;
const CAP_MASK: u64 = (1 << 24) - 1;

impl NodeHeader {
    pub fn leaf(encoding: Encoding, width: u8, size: u32, capacity: u32) -> Self {
        NodeHeader {
            is_inner_node: false,
            has_refs: false,
            context_flag: false,
            encoding,
            width,
            size,
            capacity_or_checksum: capacity,
        }
    }

    pub fn inner(size: u32, capacity: u32) -> Self {
        NodeHeader {
            is_inner_node: true,
            has_refs: true,
            context_flag: false,
            encoding: Encoding::WidthBits,
            width: 64,
            size,
            capacity_or_checksum: capacity,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_BYTES] {
        debug_assert!(self.size <= SIZE_MASK as u32);
        debug_assert!(self.capacity_or_checksum <= CAP_MASK as u32);
        let mut bits: u64 = 0;
        bits |= self.is_inner_node as u64;
        bits |= (self.has_refs as u64) << 1;
        bits |= (self.context_flag as u64) << 2;
        bits |= (self.encoding as u64) << 3;
        bits |= (self.width as u64) << 6;
        bits |= (self.size as u64 & SIZE_MASK) << 14;
        bits |= (self.capacity_or_checksum as u64 & CAP_MASK) << 38;
        bits.to_le_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_BYTES {
            return Err(EngineError::InvalidFileFormat(
                "node header truncated".into(),
            ));
        }
        let bits = u64::from_le_bytes(bytes[..HEADER_BYTES].try_into().unwrap());
        let is_inner_node = bits & 1 != 0;
        let has_refs = (bits >> 1) & 1 != 0;
        let context_flag = (bits >> 2) & 1 != 0;
        let encoding = Encoding::from_bits((bits >> 3) & 0b111)?;
        let width = ((bits >> 6) & 0xFF) as u8;
        let size = ((bits >> 14) & SIZE_MASK) as u32;
        let capacity_or_checksum = ((bits >> 38) & CAP_MASK) as u32;
        Ok(NodeHeader {
            is_inner_node,
            has_refs,
            context_flag,
            encoding,
            width,
            size,
            capacity_or_checksum,
        })
    }
}

/// Second 8-byte word following the main header for `Packed` and `Flex`
/// encodings, per §3: "w and n live in an extended header".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtendedHeader {
    pub value_width: u8,
    pub value_count: u32,
    pub index_width: u8,
    pub index_count: u32,
}

impl ExtendedHeader {
    pub fn packed(width: u8, count: u32) -> Self {
        ExtendedHeader {
            value_width: width,
            value_count: count,
            index_width: 0,
            index_count: 0,
        }
    }

    pub fn flex(value_width: u8, value_count: u32, index_width: u8, index_count: u32) -> Self {
        ExtendedHeader {
            value_width,
            value_count,
            index_width,
            index_count,
        }
    }

    pub fn encode(&self) -> [u8; EXTENDED_HEADER_BYTES] {
        let mut bits: u64 = 0;
        bits |= self.value_width as u64;
        bits |= (self.value_count as u64 & 0xFFFFFF) << 8;
        bits |= (self.index_width as u64) << 32;
        bits |= (self.index_count as u64 & 0xFFFFFF) << 40;
        bits.to_le_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < EXTENDED_HEADER_BYTES {
            return Err(EngineError::InvalidFileFormat(
                "extended header truncated".into(),
            ));
        }
        let bits = u64::from_le_bytes(bytes[..EXTENDED_HEADER_BYTES].try_into().unwrap());
        Ok(ExtendedHeader {
            value_width: (bits & 0xFF) as u8,
            value_count: ((bits >> 8) & 0xFFFFFF) as u32,
            index_width: ((bits >> 32) & 0xFF) as u8,
            index_count: ((bits >> 40) & 0xFFFFFF) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = NodeHeader::leaf(Encoding::WidthBits, 16, 12345, 98765);
        let bytes = h.encode();
        let decoded = NodeHeader::decode(&bytes).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn header_roundtrip_inner() {
        let h = NodeHeader::inner(200, 4096);
        let bytes = h.encode();
        let decoded = NodeHeader::decode(&bytes).unwrap();
        assert_eq!(h, decoded);
        assert!(decoded.is_inner_node);
        assert!(decoded.has_refs);
    }

    #[test]
    fn extended_header_roundtrip() {
        let e = ExtendedHeader::flex(8, 200, 4, 1_000_000);
        let bytes = e.encode();
        let decoded = ExtendedHeader::decode(&bytes).unwrap();
        assert_eq!(e, decoded);
    }

    #[test]
    fn header_rejects_truncated() {
        assert!(NodeHeader::decode(&[0u8; 4]).is_err());
    }
}
