//! Set / dictionary / list leaf family (§4.5).
//!
//! Sets and dictionaries keep their keys sorted by [`Value`]'s canonical
//! ordering so every set operation below is a single merge-scan instead of
//! a lookup per element. Lists are insertion-ordered and carry no such
//! invariant.
//!
//! If a future format revision changes how strings or binary values
//! compare (collation-aware string ordering, for instance), every
//! persisted set/dictionary leaf has to be re-sorted under the new order
//! before it can be trusted again; this module does not attempt that
//! migration itself.

use std::cmp::Ordering;

use crate::leaf::Value;

#[derive(Debug, Clone, Default)]
pub struct SetValue {
    items: Vec<Value>,
}

impl SetValue {
    pub fn new() -> Self {
        SetValue { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn insert(&mut self, v: Value) -> bool {
        match self.items.binary_search(&v) {
            Ok(_) => false,
            Err(pos) => {
                self.items.insert(pos, v);
                true
            }
        }
    }

    pub fn remove(&mut self, v: &Value) -> bool {
        match self.items.binary_search(v) {
            Ok(pos) => {
                self.items.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, v: &Value) -> bool {
        self.items.binary_search(v).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter()
    }

    fn merge<'a>(
        a: &'a SetValue,
        b: &'a SetValue,
        keep_a_only: bool,
        keep_b_only: bool,
        keep_both: bool,
    ) -> SetValue {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < a.items.len() && j < b.items.len() {
            match a.items[i].cmp(&b.items[j]) {
                Ordering::Less => {
                    if keep_a_only {
                        out.push(a.items[i].clone());
                    }
                    i += 1;
                }
                Ordering::Greater => {
                    if keep_b_only {
                        out.push(b.items[j].clone());
                    }
                    j += 1;
                }
                Ordering::Equal => {
                    if keep_both {
                        out.push(a.items[i].clone());
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        if keep_a_only {
            out.extend(a.items[i..].iter().cloned());
        }
        if keep_b_only {
            out.extend(b.items[j..].iter().cloned());
        }
        SetValue { items: out }
    }

    pub fn union(&self, other: &SetValue) -> SetValue {
        Self::merge(self, other, true, true, true)
    }

    pub fn intersect(&self, other: &SetValue) -> SetValue {
        Self::merge(self, other, false, false, true)
    }

    pub fn difference(&self, other: &SetValue) -> SetValue {
        Self::merge(self, other, true, false, false)
    }

    pub fn symmetric_difference(&self, other: &SetValue) -> SetValue {
        Self::merge(self, other, true, true, false)
    }

    pub fn is_subset_of(&self, other: &SetValue) -> bool {
        self.items.iter().all(|v| other.contains(v))
    }

    pub fn is_superset_of(&self, other: &SetValue) -> bool {
        other.is_subset_of(self)
    }

    pub fn equals(&self, other: &SetValue) -> bool {
        self.items == other.items
    }
}

#[derive(Debug, Clone, Default)]
pub struct DictionaryValue {
    entries: Vec<(Value, Value)>,
}

impl DictionaryValue {
    pub fn new() -> Self {
        DictionaryValue { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: &Value) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.cmp(key))
    }

    pub fn insert(&mut self, key: Value, value: Value) -> Option<Value> {
        match self.position(&key) {
            Ok(pos) => Some(std::mem::replace(&mut self.entries[pos].1, value)),
            Err(pos) => {
                self.entries.insert(pos, (key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.position(key).ok().map(|pos| &self.entries[pos].1)
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        self.position(key).ok().map(|pos| self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListValue {
    items: Vec<Value>,
}

impl ListValue {
    pub fn new() -> Self {
        ListValue { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn push(&mut self, v: Value) {
        self.items.push(v);
    }

    pub fn insert(&mut self, i: usize, v: Value) {
        self.items.insert(i, v);
    }

    pub fn remove(&mut self, i: usize) -> Value {
        self.items.remove(i)
    }

    pub fn get(&self, i: usize) -> Option<&Value> {
        self.items.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(vals: &[i64]) -> SetValue {
        let mut s = SetValue::new();
        for v in vals {
            s.insert(Value::Int(*v));
        }
        s
    }

    #[test]
    fn set_operations_match_merge_scan_semantics() {
        let a = set_of(&[1, 2, 3, 4]);
        let b = set_of(&[3, 4, 5, 6]);
        assert_eq!(a.union(&b).len(), 6);
        assert_eq!(a.intersect(&b).len(), 2);
        assert_eq!(a.difference(&b).len(), 2);
        assert_eq!(a.symmetric_difference(&b).len(), 4);
        assert!(!a.is_subset_of(&b));
        assert!(set_of(&[3, 4]).is_subset_of(&a));
        assert!(a.is_superset_of(&set_of(&[1, 2])));
        assert!(!a.equals(&b));
        assert!(a.equals(&set_of(&[4, 3, 2, 1])));
    }

    #[test]
    fn dictionary_keeps_keys_sorted_for_lookup() {
        let mut d = DictionaryValue::new();
        d.insert(Value::Str("b".into()), Value::Int(2));
        d.insert(Value::Str("a".into()), Value::Int(1));
        assert_eq!(d.get(&Value::Str("a".into())), Some(&Value::Int(1)));
        let keys: Vec<&Value> = d.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&Value::Str("a".into()), &Value::Str("b".into())]);
    }

    #[test]
    fn list_preserves_insertion_order() {
        let mut l = ListValue::new();
        l.push(Value::Int(3));
        l.push(Value::Int(1));
        l.insert(0, Value::Int(9));
        assert_eq!(l.iter().cloned().collect::<Vec<_>>(), vec![Value::Int(9), Value::Int(3), Value::Int(1)]);
    }
}
