//! Interned-string leaf family (§4.5): rows store a `u32` id into a
//! per-column interner rather than the string bytes themselves.
//!
//! The interner keeps a radix map from string hash to id (fanout 256 on
//! the hash's leading byte, so lookups stay a short bucket scan instead of
//! a tree descent) and groups interned strings into blocks of 256,
//! compressing each block's concatenated payload independently. Reading a
//! string decompresses its whole block through a small cache so repeated
//! lookups into a hot block don't pay the decompression cost twice.

use std::collections::HashMap;
use std::io::Read;

use crate::error::{EngineError, Result};

const BLOCK_SIZE: usize = 256;
const RADIX_FANOUT: usize = 256;
const CACHE_CAPACITY: usize = 32;

fn hash_string(s: &str) -> u64 {
    blake3::hash(s.as_bytes())
        .as_bytes()
        .iter()
        .take(8)
        .fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

struct Block {
    strings: Vec<String>,
    compressed: Vec<u8>,
}

impl Block {
    fn compress(strings: Vec<String>) -> Self {
        let mut raw = Vec::new();
        for s in &strings {
            raw.extend_from_slice(&(s.len() as u32).to_le_bytes());
            raw.extend_from_slice(s.as_bytes());
        }
        let compressed = lz4::block::compress(&raw, None, false)
            .expect("lz4 compression of a bounded in-memory buffer cannot fail");
        Block { strings, compressed }
    }

    fn decompress(compressed: &[u8]) -> Result<Vec<String>> {
        let mut decoder = lz4::block::decompress(compressed, None)
            .map(std::io::Cursor::new)
            .map_err(|e| EngineError::LogicError(format!("interned block decompression failed: {e}")))?;
        let mut strings = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match decoder.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(_) => break,
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            decoder
                .read_exact(&mut buf)
                .map_err(|e| EngineError::LogicError(format!("truncated interned block: {e}")))?;
            strings.push(String::from_utf8(buf).map_err(|e| {
                EngineError::LogicError(format!("interned block is not valid utf-8: {e}"))
            })?);
        }
        Ok(strings)
    }
}

/// Decompressed-block cache whose entries decay toward eviction: every
/// miss halves all resident weights before inserting the new block at full
/// weight, so a burst of unrelated lookups ages out yesterday's hot block
/// instead of evicting in pure insertion order.
struct BlockCache {
    entries: HashMap<u32, (Vec<String>, u32)>,
}

impl BlockCache {
    fn new() -> Self {
        BlockCache { entries: HashMap::new() }
    }

    fn get(&mut self, block_id: u32) -> Option<Vec<String>> {
        if let Some((strings, weight)) = self.entries.get_mut(&block_id) {
            *weight = weight.saturating_add(4);
            return Some(strings.clone());
        }
        None
    }

    fn insert(&mut self, block_id: u32, strings: Vec<String>) {
        if self.entries.len() >= CACHE_CAPACITY && !self.entries.contains_key(&block_id) {
            for (_, weight) in self.entries.values_mut() {
                *weight /= 2;
            }
            if let Some((&evict, _)) = self.entries.iter().min_by_key(|(_, (_, w))| *w) {
                self.entries.remove(&evict);
            }
        }
        self.entries.insert(block_id, (strings, 1));
    }
}

pub struct Interner {
    strings: Vec<String>,
    radix: [Vec<(u64, u32)>; RADIX_FANOUT],
    cache: BlockCache,
}

impl Interner {
    pub fn new() -> Self {
        Interner {
            strings: Vec::new(),
            radix: std::array::from_fn(|_| Vec::new()),
            cache: BlockCache::new(),
        }
    }

    /// Returns the id for `s`, interning it if this is the first
    /// occurrence.
    pub fn intern(&mut self, s: &str) -> u32 {
        let h = hash_string(s);
        let bucket = &self.radix[(h & 0xff) as usize];
        for (hh, id) in bucket {
            if *hh == h && self.strings[*id as usize] == s {
                return *id;
            }
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.radix[(h & 0xff) as usize].push((h, id));
        id
    }

    pub fn resolve(&mut self, id: u32) -> Result<String> {
        let block_id = id / BLOCK_SIZE as u32;
        if let Some(block) = self.cache.get(block_id) {
            let offset = (id % BLOCK_SIZE as u32) as usize;
            return block
                .get(offset)
                .cloned()
                .ok_or_else(|| EngineError::LogicError(format!("interned id {id} out of range")));
        }
        // Materialize the block fresh from the live table (a persisted
        // interner would decompress `Block::compressed`; in memory we
        // already have the strings, so round-trip through compression to
        // exercise the same code path a cache-miss read would take).
        let start = (block_id as usize) * BLOCK_SIZE;
        let end = (start + BLOCK_SIZE).min(self.strings.len());
        if start >= self.strings.len() {
            return Err(EngineError::LogicError(format!("interned id {id} out of range")));
        }
        let block = Block::compress(self.strings[start..end].to_vec());
        let decompressed = Block::decompress(&block.compressed)?;
        self.cache.insert(block_id, decompressed.clone());
        let offset = (id % BLOCK_SIZE as u32) as usize;
        decompressed
            .get(offset)
            .cloned()
            .ok_or_else(|| EngineError::LogicError(format!("interned id {id} out of range")))
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}
