//! Integer / bool / enum leaf family: a direct adapter over the B+-tree.
//! Enumerated columns store ids into a separate keys column at a higher
//! layer; this type only concerns itself with the id/int storage itself.

use crate::arena::Arena;
use crate::btree::{self, Root};
use crate::error::Result;

/// A column of signed 64-bit integers backed by one B+-tree.
pub struct IntegerColumn {
    pub root: Root,
}

impl IntegerColumn {
    pub fn new() -> Self {
        IntegerColumn { root: None }
    }

    pub fn len(&self, arena: &mut Arena) -> Result<u64> {
        btree::bptree_size(arena, self.root)
    }

    pub fn is_empty(&self, arena: &mut Arena) -> Result<bool> {
        Ok(self.len(arena)? == 0)
    }

    pub fn get(&self, arena: &mut Arena, i: u64) -> Result<i64> {
        btree::bptree_get(arena, self.root, i)
    }

    pub fn set(&mut self, arena: &mut Arena, i: u64, v: i64) -> Result<()> {
        self.root = Some(btree::bptree_set(arena, self.root, i, v)?);
        Ok(())
    }

    pub fn insert(&mut self, arena: &mut Arena, i: u64, v: i64) -> Result<()> {
        self.root = Some(btree::bptree_insert(arena, self.root, i, v)?);
        Ok(())
    }

    pub fn append(&mut self, arena: &mut Arena, v: i64) -> Result<()> {
        let n = self.len(arena)?;
        self.insert(arena, n, v)
    }

    pub fn erase(&mut self, arena: &mut Arena, i: u64) -> Result<()> {
        self.root = btree::bptree_erase(arena, self.root, i)?;
        Ok(())
    }

    pub fn set_bool(&mut self, arena: &mut Arena, i: u64, v: bool) -> Result<()> {
        self.set(arena, i, v as i64)
    }

    pub fn get_bool(&self, arena: &mut Arena, i: u64) -> Result<bool> {
        Ok(self.get(arena, i)? != 0)
    }
}

impl Default for IntegerColumn {
    fn default() -> Self {
        Self::new()
    }
}
