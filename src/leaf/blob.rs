//! Blob leaf family (§4.5): each row holds a byte string that is stored
//! inline when it fits in one arena allocation, or split into a chain of
//! fixed-size chunks addressed by a small ref descriptor when it doesn't.
//!
//! Growth is append-only: writing past the end of an existing blob carves
//! new chunks rather than rewriting the whole chain, matching the
//! B+-tree's copy-on-write discipline at the leaf level instead of the
//! row level.

use crate::arena::{Arena, Ref, NULL_REF};
use crate::error::{EngineError, Result};
use crate::leaf::integer::IntegerColumn;

/// Largest span of blob bytes held in a single chunk allocation before the
/// blob is split across a chain of chunks (mirrors the generic leaf's
/// `MAX_LEAF_SIZE` so neither column ever forces an outsized single read).
pub const MAX_INLINE_BLOB: usize = crate::btree::MAX_LEAF_SIZE;

struct Descriptor {
    total_len: u64,
    chunk_refs: Vec<Ref>,
}

impl Descriptor {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 8 + self.chunk_refs.len() * 8);
        out.extend_from_slice(&self.total_len.to_le_bytes());
        out.extend_from_slice(&(self.chunk_refs.len() as u64).to_le_bytes());
        for r in &self.chunk_refs {
            out.extend_from_slice(&r.to_le_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            return Err(EngineError::LogicError("truncated blob descriptor".into()));
        }
        let total_len = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let count = u64::from_le_bytes(bytes[8..16].try_into().unwrap()) as usize;
        let mut chunk_refs = Vec::with_capacity(count);
        let mut off = 16;
        for _ in 0..count {
            if off + 8 > bytes.len() {
                return Err(EngineError::LogicError("truncated blob descriptor".into()));
            }
            chunk_refs.push(u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()));
            off += 8;
        }
        Ok(Descriptor { total_len, chunk_refs })
    }

    fn chunk_len(&self, chunk_index: usize) -> usize {
        let start = chunk_index * MAX_INLINE_BLOB;
        let remaining = self.total_len as usize - start;
        remaining.min(MAX_INLINE_BLOB)
    }
}

pub struct BlobColumn {
    descriptors: IntegerColumn,
}

impl BlobColumn {
    pub fn new() -> Self {
        BlobColumn { descriptors: IntegerColumn::new() }
    }

    pub fn len(&self, arena: &mut Arena) -> Result<u64> {
        self.descriptors.len(arena)
    }

    pub fn append(&mut self, arena: &mut Arena, data: &[u8]) -> Result<()> {
        let n = self.descriptors.len(arena)?;
        self.insert_new(arena, n, data)
    }

    pub fn insert_new(&mut self, arena: &mut Arena, i: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            self.descriptors.insert(arena, i, NULL_REF as i64)?;
            return Ok(());
        }
        let desc = self.write_chunks(arena, data)?;
        let dref = arena.alloc(desc.encode().len())?;
        arena.write(dref, &desc.encode())?;
        self.descriptors.insert(arena, i, dref as i64)
    }

    fn write_chunks(&self, arena: &mut Arena, data: &[u8]) -> Result<Descriptor> {
        let mut chunk_refs = Vec::new();
        for chunk in data.chunks(MAX_INLINE_BLOB) {
            let r = arena.alloc(chunk.len())?;
            arena.write(r, chunk)?;
            chunk_refs.push(r);
        }
        Ok(Descriptor { total_len: data.len() as u64, chunk_refs })
    }

    fn load_descriptor(&self, arena: &mut Arena, i: u64) -> Result<Option<Descriptor>> {
        let dref = self.descriptors.get(arena, i)? as u64;
        if dref == NULL_REF {
            return Ok(None);
        }
        // Descriptor size is self-describing once the length prefix is
        // read; read a generous upper bound and trust the embedded count.
        let probe = arena.read(dref, 16)?;
        let count = u64::from_le_bytes(probe[8..16].try_into().unwrap()) as usize;
        let full = arena.read(dref, 16 + count * 8)?;
        Ok(Some(Descriptor::decode(&full)?))
    }

    pub fn get(&self, arena: &mut Arena, i: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.blob_len(arena, i)? as usize];
        let n = buf.len();
        self.read(arena, i, 0, &mut buf, n)?;
        Ok(buf)
    }

    pub fn blob_len(&self, arena: &mut Arena, i: u64) -> Result<u64> {
        Ok(self.load_descriptor(arena, i)?.map(|d| d.total_len).unwrap_or(0))
    }

    /// Stitches `n` bytes starting at `pos` out of a blob's chunk chain
    /// into `buf`.
    pub fn read(&self, arena: &mut Arena, i: u64, pos: u64, buf: &mut [u8], n: usize) -> Result<usize> {
        let desc = match self.load_descriptor(arena, i)? {
            Some(d) => d,
            None => return Ok(0),
        };
        if pos >= desc.total_len {
            return Ok(0);
        }
        let to_read = n.min((desc.total_len - pos) as usize);
        let mut written = 0usize;
        let mut cursor = pos as usize;
        while written < to_read {
            let chunk_index = cursor / MAX_INLINE_BLOB;
            let chunk_offset = cursor % MAX_INLINE_BLOB;
            let chunk_len = desc.chunk_len(chunk_index);
            let chunk_bytes = arena.read(desc.chunk_refs[chunk_index], chunk_len)?;
            let avail = chunk_len - chunk_offset;
            let take = avail.min(to_read - written);
            buf[written..written + take].copy_from_slice(&chunk_bytes[chunk_offset..chunk_offset + take]);
            written += take;
            cursor += take;
        }
        Ok(written)
    }
}

impl Default for BlobColumn {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrowthPolicy;
    use tempfile::tempdir;

    fn test_arena() -> (tempfile::TempDir, Arena) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        (dir, Arena::create(&path, GrowthPolicy::conservative()).unwrap())
    }

    #[test]
    fn small_blob_roundtrips() {
        let (_d, mut arena) = test_arena();
        let mut col = BlobColumn::new();
        col.append(&mut arena, b"hello world").unwrap();
        assert_eq!(col.get(&mut arena, 0).unwrap(), b"hello world");
    }

    #[test]
    fn empty_blob_roundtrips() {
        let (_d, mut arena) = test_arena();
        let mut col = BlobColumn::new();
        col.append(&mut arena, b"").unwrap();
        assert_eq!(col.get(&mut arena, 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn oversized_blob_splits_into_chunks_and_stitches_back() {
        let (_d, mut arena) = test_arena();
        let mut col = BlobColumn::new();
        let data: Vec<u8> = (0..(MAX_INLINE_BLOB * 3 + 17)).map(|i| (i % 251) as u8).collect();
        col.append(&mut arena, &data).unwrap();
        assert_eq!(col.get(&mut arena, 0).unwrap(), data);
    }

    #[test]
    fn partial_read_stitches_across_chunk_boundary() {
        let (_d, mut arena) = test_arena();
        let mut col = BlobColumn::new();
        let data: Vec<u8> = (0..(MAX_INLINE_BLOB * 2)).map(|i| (i % 256) as u8).collect();
        col.append(&mut arena, &data).unwrap();
        let start = MAX_INLINE_BLOB - 5;
        let mut buf = vec![0u8; 10];
        let n = col.read(&mut arena, 0, start as u64, &mut buf, 10).unwrap();
        assert_eq!(n, 10);
        assert_eq!(buf, data[start..start + 10]);
    }
}
