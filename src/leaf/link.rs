//! Link / backlink leaf family (§4.5).
//!
//! A link is stored as an object key plus the key of the table it points
//! into (for typed links; plain links within a fixed target table omit the
//! table key at a higher layer and just reuse this type with a constant
//! table key). The object key's lowest bit is reserved as the
//! *unresolved* flag: when set, the link pointed at an object that has
//! since been deleted, and the containing leaf's header context flag is
//! raised so readers know to check before dereferencing.
//!
//! Every backlink column is the mechanical inverse of some forward link
//! column: inserting a forward link also inserts the paired backlink, and
//! vice versa on removal. This module only models one column of a pair;
//! keeping two columns in sync is the caller's responsibility, same as
//! the original source's `Table::insert_backlink` / `remove_backlink`
//! split between forward and reverse tables.

use crate::arena::Arena;
use crate::error::Result;
use crate::leaf::collection::ListValue;
use crate::leaf::integer::IntegerColumn;
use crate::leaf::Value;

const UNRESOLVED_BIT: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedLink {
    pub table_key: u32,
    pub object_key: u64,
}

impl TypedLink {
    pub fn new(table_key: u32, object_key: u64) -> Self {
        TypedLink { table_key, object_key: object_key << 1 }
    }

    pub fn is_unresolved(&self) -> bool {
        self.object_key & UNRESOLVED_BIT != 0
    }

    pub fn mark_unresolved(&mut self) {
        self.object_key |= UNRESOLVED_BIT;
    }

    pub fn mark_resolved(&mut self) {
        self.object_key &= !UNRESOLVED_BIT;
    }

    /// Set membership for link collections treats two links as equal when
    /// their object keys match ignoring the unresolved bit: an object
    /// going unresolved and back must not silently duplicate it in a set
    /// of links (Open Question, resolved).
    pub fn set_key(&self) -> (u32, u64) {
        (self.table_key, self.object_key & !UNRESOLVED_BIT)
    }

    fn encode(&self) -> i64 {
        ((self.table_key as i64) << 33) | (self.object_key as i64)
    }

    fn decode(bits: i64) -> Self {
        TypedLink {
            table_key: (bits >> 33) as u32,
            object_key: (bits as u64) & 0x1_ffff_ffff,
        }
    }
}

/// A column of single-valued links (nullable: a cleared link is encoded
/// as object key 0, which no real object ever occupies since keys are
/// allocated starting at 1).
pub struct LinkColumn {
    raw: IntegerColumn,
}

impl LinkColumn {
    pub fn new() -> Self {
        LinkColumn { raw: IntegerColumn::new() }
    }

    pub fn len(&self, arena: &mut Arena) -> Result<u64> {
        self.raw.len(arena)
    }

    pub fn append(&mut self, arena: &mut Arena, link: Option<TypedLink>) -> Result<()> {
        self.raw.append(arena, link.map(|l| l.encode()).unwrap_or(0))
    }

    pub fn get(&self, arena: &mut Arena, i: u64) -> Result<Option<TypedLink>> {
        let bits = self.raw.get(arena, i)?;
        if bits == 0 {
            Ok(None)
        } else {
            Ok(Some(TypedLink::decode(bits)))
        }
    }

    pub fn mark_unresolved(&mut self, arena: &mut Arena, i: u64) -> Result<()> {
        if let Some(mut link) = self.get(arena, i)? {
            link.mark_unresolved();
            self.raw.set(arena, i, link.encode())?;
        }
        Ok(())
    }
}

impl Default for LinkColumn {
    fn default() -> Self {
        Self::new()
    }
}

/// A column of link lists, one per row. Membership within a row follows
/// the link-equality rule above: inserting a link whose set key already
/// appears (resolved or not) replaces the existing entry instead of
/// duplicating it.
pub struct LinkListColumn {
    lists: Vec<ListValue>,
}

impl LinkListColumn {
    pub fn new() -> Self {
        LinkListColumn { lists: Vec::new() }
    }

    pub fn append_row(&mut self) -> usize {
        self.lists.push(ListValue::new());
        self.lists.len() - 1
    }

    pub fn insert(&mut self, row: usize, link: TypedLink) {
        let list = &mut self.lists[row];
        let existing_pos = (0..list.len()).find(|&i| match list.get(i) {
            Some(Value::ObjectId(bits)) => TypedLink::decode(*bits as i64).set_key() == link.set_key(),
            _ => false,
        });
        let encoded = Value::ObjectId(link.encode() as u64);
        match existing_pos {
            Some(pos) => {
                list.remove(pos);
                list.insert(pos, encoded);
            }
            None => list.push(encoded),
        }
    }

    pub fn get(&self, row: usize, index: usize) -> Option<TypedLink> {
        match self.lists[row].get(index) {
            Some(Value::ObjectId(bits)) => Some(TypedLink::decode(*bits as i64)),
            _ => None,
        }
    }

    pub fn len(&self, row: usize) -> usize {
        self.lists[row].len()
    }
}

impl Default for LinkListColumn {
    fn default() -> Self {
        Self::new()
    }
}

/// Backlinks for one origin column: for each target row, the set of
/// `(origin_table, origin_row)` pairs whose forward link points at it.
pub struct BacklinkColumn {
    rows: Vec<Vec<(u32, u64)>>,
}

impl BacklinkColumn {
    pub fn new() -> Self {
        BacklinkColumn { rows: Vec::new() }
    }

    pub fn ensure_row(&mut self, row: usize) {
        if self.rows.len() <= row {
            self.rows.resize(row + 1, Vec::new());
        }
    }

    pub fn add(&mut self, target_row: usize, origin_table: u32, origin_row: u64) {
        self.ensure_row(target_row);
        let entry = (origin_table, origin_row);
        if !self.rows[target_row].contains(&entry) {
            self.rows[target_row].push(entry);
        }
    }

    pub fn remove(&mut self, target_row: usize, origin_table: u32, origin_row: u64) {
        if let Some(list) = self.rows.get_mut(target_row) {
            list.retain(|&(t, r)| (t, r) != (origin_table, origin_row));
        }
    }

    pub fn get(&self, target_row: usize) -> &[(u32, u64)] {
        self.rows.get(target_row).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Default for BacklinkColumn {
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
    fn unresolved_bit_does_not_change_set_key() {
        let mut link = TypedLink::new(7, 42);
        let before = link.set_key();
        link.mark_unresolved();
        assert_eq!(link.set_key(), before);
        assert!(link.is_unresolved());
    }

    #[test]
    fn link_column_roundtrips_and_marks_unresolved() {
        let (_d, mut arena) = test_arena();
        let mut col = LinkColumn::new();
        col.append(&mut arena, Some(TypedLink::new(3, 10))).unwrap();
        col.append(&mut arena, None).unwrap();
        col.mark_unresolved(&mut arena, 0).unwrap();
        let link = col.get(&mut arena, 0).unwrap().unwrap();
        assert!(link.is_unresolved());
        assert_eq!(col.get(&mut arena, 1).unwrap(), None);
    }

    #[test]
    fn link_list_insert_replaces_by_set_key_not_duplicate() {
        let mut lists = LinkListColumn::new();
        let row = lists.append_row();
        lists.insert(row, TypedLink::new(1, 5));
        let mut unresolved = TypedLink::new(1, 5);
        unresolved.mark_unresolved();
        lists.insert(row, unresolved);
        assert_eq!(lists.len(row), 1);
        assert!(lists.get(row, 0).unwrap().is_unresolved());
    }

    #[test]
    fn backlinks_are_deduplicated_and_removable() {
        let mut back = BacklinkColumn::new();
        back.add(0, 1, 100);
        back.add(0, 1, 100);
        assert_eq!(back.get(0).len(), 1);
        back.remove(0, 1, 100);
        assert!(back.get(0).is_empty());
    }
}
