//! Node header + bit-packed value codec (C3).
//!
//! A leaf is `{NodeHeader, [ExtendedHeader], payload words}`. This module
//! only concerns itself with the byte-level codec; C4 owns arena allocation
//! and the B+-tree shape built from these blocks.

pub mod header;
pub mod pack;

use header::{Encoding, NodeHeader, EXTENDED_HEADER_BYTES, HEADER_BYTES};
use crate::error::{EngineError, Result};

/// Signal returned by [`LeafView::set`] when the write didn't fit the
/// leaf's current width; the caller (C4) must reallocate at the returned
/// width and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WidthPromotion {
    pub required_width: u8,
}

/// A decoded WidthBits leaf materialised over an owned word buffer. Leaves
/// are always rewritten to WidthBits on mutation (§4.3): Packed/Flex only
/// exist transiently between `commit` calls.
pub struct LeafView {
    pub width: u8,
    pub size: u32,
    pub words: Vec<u64>,
}

impl LeafView {
    pub fn new_empty(width: u8) -> Self {
        LeafView {
            width,
            size: 0,
            words: Vec::new(),
        }
    }

    pub fn from_values(values: &[i64]) -> Self {
        let width = values
            .iter()
            .copied()
            .map(pack::width_for_value)
            .max()
            .unwrap_or(0);
        let mut words = vec![0u64; pack::words_for(width, values.len() as u32)];
        for (i, &v) in values.iter().enumerate() {
            pack::set_bits(&mut words, width, i, v);
        }
        LeafView {
            width,
            size: values.len() as u32,
            words,
        }
    }

    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn get(&self, i: usize) -> i64 {
        debug_assert!(i < self.size as usize);
        pack::get_bits(&self.words, self.width, i)
    }

    pub fn get_chunk(&self, index: usize, out: &mut [i64; 8]) {
        pack::get_chunk(&self.words, self.width, self.size, index, out)
    }

    /// Attempts to write `v` at `i`. Returns `Ok(None)` on success, or
    /// `Ok(Some(promotion))` if the caller must widen the leaf first.
    pub fn set(&mut self, i: usize, v: i64) -> Option<WidthPromotion> {
        debug_assert!(i < self.size as usize);
        let needed = pack::width_for_value(v);
        if needed > self.width {
            return Some(WidthPromotion {
                required_width: needed,
            });
        }
        pack::set_bits(&mut self.words, self.width, i, v);
        None
    }

    /// Rewrites the leaf at a new (wider) width, preserving all values.
    /// Per §3, widening never reduces within a single leaf operation.
    pub fn widen(&mut self, new_width: u8) {
        debug_assert!(new_width >= self.width);
        let values: Vec<i64> = (0..self.size as usize).map(|i| self.get(i)).collect();
        self.width = new_width;
        self.words = vec![0u64; pack::words_for(new_width, self.size)];
        for (i, v) in values.into_iter().enumerate() {
            pack::set_bits(&mut self.words, new_width, i, v);
        }
    }

    pub fn insert(&mut self, i: usize, v: i64) {
        debug_assert!(i <= self.size as usize);
        let needed = pack::width_for_value(v).max(self.width);
        let mut values: Vec<i64> = (0..self.size as usize).map(|k| self.get(k)).collect();
        values.insert(i, v);
        self.width = needed;
        self.size += 1;
        self.words = vec![0u64; pack::words_for(self.width, self.size)];
        for (k, val) in values.into_iter().enumerate() {
            pack::set_bits(&mut self.words, self.width, k, val);
        }
    }

    pub fn erase(&mut self, i: usize) {
        debug_assert!(i < self.size as usize);
        let mut values: Vec<i64> = (0..self.size as usize).map(|k| self.get(k)).collect();
        values.remove(i);
        self.size -= 1;
        self.words = vec![0u64; pack::words_for(self.width, self.size)];
        for (k, val) in values.into_iter().enumerate() {
            pack::set_bits(&mut self.words, self.width, k, val);
        }
    }

    pub fn find_all(
        &self,
        cond: pack::Cond,
        value: i64,
        begin: usize,
        end: usize,
        base: usize,
        on_match: impl FnMut(usize) -> bool,
    ) -> bool {
        if cond == pack::Cond::Eq {
            return pack::find_all(&self.words, self.width, value, begin, end, base, on_match);
        }
        // Non-equality conditions use the straight loop; the MSB-mask
        // kernel only short-circuits the common equality case.
        let mut on_match = on_match;
        for k in begin..end {
            let v = self.get(k);
            let hit = match cond {
                pack::Cond::Eq => v == value,
                pack::Cond::Ne => v != value,
                pack::Cond::Lt => v < value,
                pack::Cond::Le => v <= value,
                pack::Cond::Gt => v > value,
                pack::Cond::Ge => v >= value,
            };
            if hit && !on_match(base + k) {
                return false;
            }
        }
        true
    }

    /// Serializes as a WidthBits block: header + payload words, 8-byte
    /// aligned (payload is already word-sized). `capacity_or_checksum`
    /// always holds the payload length in bytes so a reader can size its
    /// block read from the header alone, regardless of encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let capacity = (self.words.len() * 8) as u32;
        let header = NodeHeader::leaf(Encoding::WidthBits, self.width, self.size, capacity);
        let mut out = Vec::with_capacity(HEADER_BYTES + self.words.len() * 8);
        out.extend_from_slice(&header.encode());
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    /// Serializes using whichever of WidthBits/Packed/Flex the encoding
    /// choice of §4.3 picks for this leaf's current values. Used only at
    /// commit time (`bptree_freeze`); mutation always goes back through
    /// [`LeafView::to_bytes`] so in-memory leaves stay plain WidthBits.
    pub fn to_bytes_committed(&self) -> Vec<u8> {
        let values: Vec<i64> = (0..self.size as usize).map(|i| self.get(i)).collect();
        let (encoding, _) = pack::choose_commit_encoding(&values, self.width);
        match encoding {
            Encoding::WidthBits => self.to_bytes(),
            Encoding::Packed => {
                let width = values.iter().copied().map(pack::width_for_value).max().unwrap_or(0);
                let mut words = vec![0u64; pack::words_for(width, self.size)];
                for (i, &v) in values.iter().enumerate() {
                    pack::set_bits(&mut words, width, i, v);
                }
                encode_extended(Encoding::Packed, header::ExtendedHeader::packed(width, self.size), &words, self.size)
            }
            Encoding::Flex => {
                let (ext, words) = pack::encode_flex(&values);
                encode_extended(Encoding::Flex, ext, &words, self.size)
            }
            Encoding::Extended => unreachable!("choose_commit_encoding never picks Extended"),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = NodeHeader::decode(bytes)?;
        let mut offset = HEADER_BYTES;
        let words: Vec<u64> = match header.encoding {
            Encoding::WidthBits => {
                let n_words = pack::words_for(header.width, header.size);
                read_words(bytes, offset, n_words)?
            }
            Encoding::Packed | Encoding::Flex => {
                let ext = header::ExtendedHeader::decode(&bytes[offset..])?;
                offset += EXTENDED_HEADER_BYTES;
                let n_words = if header.encoding == Encoding::Packed {
                    pack::words_for(ext.value_width, ext.value_count)
                } else {
                    pack::words_for(ext.value_width, ext.value_count)
                        + pack::words_for(ext.index_width, ext.index_count)
                };
                let words = read_words(bytes, offset, n_words)?;
                let values = pack::decode_any(&header, &ext, &words)?;
                return Ok(LeafView::from_values(&values));
            }
            Encoding::Extended => {
                return Err(EngineError::InvalidFileFormat(
                    "extended encoding leaves are not yet representable".into(),
                ))
            }
        };
        Ok(LeafView {
            width: header.width,
            size: header.size,
            words,
        })
    }
}

fn encode_extended(encoding: Encoding, ext: header::ExtendedHeader, words: &[u64], size: u32) -> Vec<u8> {
    let payload_bytes = (EXTENDED_HEADER_BYTES + words.len() * 8) as u32;
    let header = NodeHeader::leaf(encoding, 0, size, payload_bytes);
    let mut out = Vec::with_capacity(HEADER_BYTES + payload_bytes as usize);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&ext.encode());
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

fn read_words(bytes: &[u8], offset: usize, count: usize) -> Result<Vec<u64>> {
    let end = offset + count * 8;
    if bytes.len() < end {
        return Err(EngineError::InvalidFileFormat("leaf payload truncated".into()));
    }
    Ok((0..count)
        .map(|i| {
            let s = offset + i * 8;
            u64::from_le_bytes(bytes[s..s + 8].try_into().unwrap())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_signals_promotion_then_succeeds_after_widen() {
        let mut leaf = LeafView::from_values(&[1, 2, 3]);
        assert_eq!(leaf.width, 2);
        let promo = leaf.set(0, 1000);
        assert!(promo.is_some());
        leaf.widen(promo.unwrap().required_width);
        assert!(leaf.set(0, 1000).is_none());
        assert_eq!(leaf.get(0), 1000);
        assert_eq!(leaf.get(1), 2);
    }

    #[test]
    fn insert_and_erase_preserve_order() {
        let mut leaf = LeafView::from_values(&[10, 20, 30]);
        leaf.insert(1, 15);
        assert_eq!((0..leaf.len()).map(|i| leaf.get(i)).collect::<Vec<_>>(), vec![10, 15, 20, 30]);
        leaf.erase(0);
        assert_eq!((0..leaf.len()).map(|i| leaf.get(i)).collect::<Vec<_>>(), vec![15, 20, 30]);
    }

    #[test]
    fn widthbits_roundtrip_through_bytes() {
        let leaf = LeafView::from_values(&[-5, 0, 5, 127, -128]);
        let bytes = leaf.to_bytes();
        let back = LeafView::from_bytes(&bytes).unwrap();
        assert_eq!(back.len(), leaf.len());
        for i in 0..leaf.len() {
            assert_eq!(back.get(i), leaf.get(i));
        }
    }
}
