//! Bit-packed value codec: WidthBits get/set/scan, and the Packed/Flex
//! commit-time encodings.

use crate::codec::header::{Encoding, ExtendedHeader, NodeHeader};
use crate::error::{EngineError, Result};

/// Allowed WidthBits widths, in ascending order.
pub const WIDTHS: [u8; 8] = [0, 1, 2, 4, 8, 16, 32, 64];

/// Smallest width in [`WIDTHS`] that represents `v` as a sign-extended
/// two's-complement value. Width promotion within one leaf operation only
/// ever walks this table rightward (monotone widening, per §3).
pub fn width_for_value(v: i64) -> u8 {
    if v == 0 {
        return 0;
    }
    for &w in &WIDTHS[1..] {
        if w == 64 {
            return 64;
        }
        let lo = -(1i64 << (w - 1));
        let hi = (1i64 << (w - 1)) - 1;
        if v >= lo && v <= hi {
            return w;
        }
    }
    64
}

/// Number of `u64` words needed to hold `count` elements of `width` bits.
pub fn words_for(width: u8, count: u32) -> usize {
    if width == 0 || count == 0 {
        return 0;
    }
    let per_word = (64 / width as u32) as usize;
    (count as usize + per_word - 1) / per_word
}

/// Reads the signed value at `index` from a WidthBits-encoded payload of the
/// given `width`. Widths are powers of two dividing 64, so no element ever
/// straddles a word boundary.
pub fn get_bits(payload: &[u64], width: u8, index: usize) -> i64 {
    if width == 0 {
        return 0;
    }
    if width == 64 {
        return payload[index] as i64;
    }
    let per_word = (64 / width as u32) as usize;
    let word = payload[index / per_word];
    let shift = (index % per_word) * width as usize;
    let mask = (1u64 << width) - 1;
    let raw = (word >> shift) & mask;
    sign_extend(raw, width)
}

pub fn sign_extend(raw: u64, width: u8) -> i64 {
    if width == 0 || width == 64 {
        return raw as i64;
    }
    let shift = 64 - width;
    ((raw << shift) as i64) >> shift
}

/// Writes `value` at `index` into a WidthBits payload of `width` bits.
/// Caller must ensure `value` fits `width` (see [`width_for_value`]);
/// callers that don't know this ahead of time should call
/// [`fits_width`] first and request a promotion otherwise.
pub fn set_bits(payload: &mut [u64], width: u8, index: usize, value: i64) {
    if width == 0 {
        debug_assert_eq!(value, 0);
        return;
    }
    if width == 64 {
        payload[index] = value as u64;
        return;
    }
    let per_word = (64 / width as u32) as usize;
    let shift = (index % per_word) * width as usize;
    let mask = (1u64 << width) - 1;
    let word_idx = index / per_word;
    let cleared = payload[word_idx] & !(mask << shift);
    payload[word_idx] = cleared | (((value as u64) & mask) << shift);
}

pub fn fits_width(value: i64, width: u8) -> bool {
    width_for_value(value) <= width
}

/// Fills `out` with eight consecutive elements starting at `index`;
/// positions past `size` are zero-filled (§4.3 `get_chunk`).
pub fn get_chunk(payload: &[u64], width: u8, size: u32, index: usize, out: &mut [i64; 8]) {
    for (k, slot) in out.iter_mut().enumerate() {
        let i = index + k;
        *slot = if (i as u32) < size {
            get_bits(payload, width, i)
        } else {
            0
        };
    }
}

/// Comparator kernels for the scan primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cond {
    fn matches(self, a: i64, b: i64) -> bool {
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => a < b,
            Cond::Le => a <= b,
            Cond::Gt => a > b,
            Cond::Ge => a >= b,
        }
    }
}

/// Word-at-a-time scan over `[begin, end)`. For 8/16/32-bit unsigned
/// equality this uses the classic MSB-mask "find zero in word" trick
/// (XOR against a broadcast search vector, then test each lane's MSB);
/// every other width/condition falls back to a per-element loop, since
/// the MSB trick does not generalise past equality without XORing sign
/// bits first for signed order comparisons (done in `masked_cmp`).
///
/// `on_match(k)` is invoked for every matching absolute index `base + k`;
/// returning `false` stops the scan early, matching `find_all`'s
/// early-exit contract.
pub fn find_all(
    payload: &[u64],
    width: u8,
    value: i64,
    begin: usize,
    end: usize,
    base: usize,
    mut on_match: impl FnMut(usize) -> bool,
) -> bool {
    if width == 0 || width >= 8 {
        for k in begin..end {
            let v = get_bits(payload, width.max(1).min(64), k);
            let v = if width == 0 { 0 } else { v };
            if Cond::Eq.matches(v, value) && !on_match(base + k) {
                return false;
            }
        }
        return true;
    }
    // Range-narrowing heuristic (§4.4): fields narrower than 8 bits are
    // scanned with the MSB-mask kernel word-at-a-time; each 64-bit word
    // holds `64/width` fields.
    let per_word = (64 / width as u32) as usize;
    let msb_mask = broadcast(1u64 << (width - 1), width);
    let search = broadcast((value as u64) & ((1u64 << width) - 1), width);
    let lane_mask = broadcast((1u64 << width) - 1, width);

    let mut k = begin;
    while k < end {
        let word_idx = k / per_word;
        if word_idx >= payload.len() {
            break;
        }
        let word = payload[word_idx];
        let xored = (word ^ search) & lane_mask;
        // `xored` is zero in a lane iff that lane equals `value`.
        let has_zero_lane = xored
            .wrapping_sub(broadcast(1, width))
            & !xored
            & msb_mask;
        if has_zero_lane != 0 {
            let word_start = word_idx * per_word;
            let lane_begin = k.max(word_start);
            let lane_end = (word_start + per_word).min(end);
            for i in lane_begin..lane_end {
                let v = get_bits(payload, width, i);
                if v == value && !on_match(base + i) {
                    return false;
                }
            }
        }
        k = (word_idx + 1) * per_word;
    }
    true
}

fn broadcast(field: u64, width: u8) -> u64 {
    let mut acc = 0u64;
    let mut shift = 0u32;
    while shift < 64 {
        acc |= field << shift;
        shift += width as u32;
    }
    acc
}

// ---------------------------------------------------------------------
// Packed / Flex commit-time encodings
// ---------------------------------------------------------------------

/// Chooses the smallest encoding for a fully-materialised WidthBits value
/// sequence, per §4.3's "encoding choice at commit".
pub fn choose_commit_encoding(values: &[i64], current_width: u8) -> (Encoding, ExtendedHeader) {
    let n = values.len() as u32;
    let widthbits_words = words_for(current_width, n);
    let widthbits_bits = widthbits_words * 64;

    let packed_width = values.iter().copied().map(width_for_value).max().unwrap_or(0);
    let packed_words = words_for(packed_width, n);
    let packed_bits = packed_words * 64;

    let mut distinct: Vec<i64> = values.to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    let v_n = distinct.len() as u32;
    let v_w = distinct.iter().copied().map(width_for_value).max().unwrap_or(0);
    let i_w = width_for_index(v_n);
    let flex_bits =
        (words_for(v_w, v_n) * 64 + words_for(i_w, n) * 64) as i64 + 2 * 64;

    if (packed_bits as i64) < widthbits_bits as i64 && packed_bits as i64 <= flex_bits {
        (Encoding::Packed, ExtendedHeader::packed(packed_width, n))
    } else if flex_bits < widthbits_bits as i64 {
        (Encoding::Flex, ExtendedHeader::flex(v_w, v_n, i_w, n))
    } else {
        (Encoding::WidthBits, ExtendedHeader::default())
    }
}

fn width_for_index(cardinality: u32) -> u8 {
    if cardinality <= 1 {
        return 0;
    }
    let bits_needed = 32 - (cardinality - 1).leading_zeros();
    for &w in &WIDTHS {
        if w as u32 >= bits_needed {
            return w;
        }
    }
    64
}

/// Encodes `values` as a Flex leaf: `{dictionary (v_n values at v_w bits),
/// indices (n indices at i_w bits)}`, dictionary sorted ascending so that
/// unsigned index comparison matches the dictionary's signed order.
pub fn encode_flex(values: &[i64]) -> (ExtendedHeader, Vec<u64>) {
    let mut dict: Vec<i64> = values.to_vec();
    dict.sort_unstable();
    dict.dedup();
    let v_w = dict.iter().copied().map(width_for_value).max().unwrap_or(0);
    let i_w = width_for_index(dict.len() as u32);

    let mut words = vec![0u64; words_for(v_w, dict.len() as u32)];
    for (i, &v) in dict.iter().enumerate() {
        ensure_capacity(&mut words, v_w, i);
        set_bits(&mut words, v_w, i, v);
    }
    let index_words_start = words.len();
    words.resize(index_words_start + words_for(i_w, values.len() as u32), 0);
    for (i, &v) in values.iter().enumerate() {
        let pos = dict.binary_search(&v).expect("value must be in dictionary");
        ensure_capacity_at(&mut words, index_words_start, i_w, i);
        set_bits(&mut words[index_words_start..], i_w, i, pos as i64);
    }

    (
        ExtendedHeader::flex(v_w, dict.len() as u32, i_w, values.len() as u32),
        words,
    )
}

fn ensure_capacity(words: &mut Vec<u64>, width: u8, index: usize) {
    let needed = words_for(width, index as u32 + 1);
    if words.len() < needed {
        words.resize(needed, 0);
    }
}

fn ensure_capacity_at(words: &mut Vec<u64>, offset: usize, width: u8, index: usize) {
    let needed = offset + words_for(width, index as u32 + 1);
    if words.len() < needed {
        words.resize(needed, 0);
    }
}

pub fn decode_flex(ext: &ExtendedHeader, words: &[u64]) -> Result<Vec<i64>> {
    let dict_words = words_for(ext.value_width, ext.value_count);
    if words.len() < dict_words {
        return Err(EngineError::InvalidFileFormat("flex dictionary truncated".into()));
    }
    let dict: Vec<i64> = (0..ext.value_count as usize)
        .map(|i| get_bits(&words[..dict_words], ext.value_width, i))
        .collect();
    let index_words = &words[dict_words..];
    let mut out = Vec::with_capacity(ext.index_count as usize);
    for i in 0..ext.index_count as usize {
        let idx = get_bits(index_words, ext.index_width, i);
        let idx = idx as usize;
        if idx >= dict.len() {
            return Err(EngineError::InvalidFileFormat(format!(
                "flex index {idx} out of range [0, {})",
                dict.len()
            )));
        }
        out.push(dict[idx]);
    }
    Ok(out)
}

/// Verifies the encoding-commit transform is a bijection: decoding a Flex
/// or Packed payload back to plain values and re-encoding as WidthBits
/// yields the original sequence (§8 invariant).
pub fn decode_any(header: &NodeHeader, ext: &ExtendedHeader, words: &[u64]) -> Result<Vec<i64>> {
    match header.encoding {
        Encoding::WidthBits => Ok((0..header.size as usize)
            .map(|i| get_bits(words, header.width, i))
            .collect()),
        Encoding::Packed => Ok((0..ext.value_count as usize)
            .map(|i| get_bits(words, ext.value_width, i))
            .collect()),
        Encoding::Flex => decode_flex(ext, words),
        Encoding::Extended => Err(EngineError::InvalidFileFormat(
            "extended encoding not representable as a flat value sequence".into(),
        )),
    }
}
