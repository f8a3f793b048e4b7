//! Change-observer pipeline (C8).
//!
//! Grounded in the graph engine's `reachability`/`bfs` free functions: the
//! same breadth-first, visited-set traversal discovers which *tables* an
//! observer's query touches (forward links and backlinks both count, same
//! as `reachability`'s `backward` flag) before any per-object work begins,
//! so an observer watching an unrelated table short-circuits immediately
//! instead of walking every changed object in the commit.
//!
//! Per-object applicability then descends either a declared key-path (the
//! cheap case) or a depth-capped DFS over links with its own visited set
//! (the general case), exactly mirroring the table-level BFS one level
//! down. A key-path is a sequence of `(table, column)` hops (spec.md
//! §4.8): the first hop's column changing on the root object itself is an
//! immediate match, otherwise each subsequent hop's arrival object is
//! checked against the change info before the descent continues — the
//! original's `KeyPathChangeChecker` walks the same two cases.

use std::collections::{HashSet, VecDeque};

use crate::error::Result;

/// Maximum link-chasing depth for the general (non key-path) applicability
/// check, matching the bound the link family's typed links are expected
/// to stay within for any single observed relationship.
pub const MAX_REACHABILITY_DEPTH: usize = 4;

pub type TableId = u32;
pub type ObjectKey = u64;
pub type ColumnId = u32;

/// One hop of a declared key-path: a column on a table, traversed via a
/// forward link, link-list element, or backlink to whatever table
/// `LinkGraph::object_links` reports for that column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPathHop {
    pub table: TableId,
    pub column: ColumnId,
}

pub type KeyPath = Vec<KeyPathHop>;

/// One row's before/after state as seen by the pipeline. `columns` carries
/// the modified column-keys for a modification (spec.md:195's
/// `{object-key, column-key}` pairs); it is empty for insertions and
/// deletions, where the whole object appeared or vanished rather than one
/// column changing.
#[derive(Debug, Clone, Default)]
pub struct ChangedObject {
    pub table: TableId,
    pub key: ObjectKey,
    pub columns: Vec<ColumnId>,
}

impl ChangedObject {
    pub fn new(table: TableId, key: ObjectKey) -> Self {
        ChangedObject { table, key, columns: Vec::new() }
    }

    pub fn with_columns(table: TableId, key: ObjectKey, columns: Vec<ColumnId>) -> Self {
        ChangedObject { table, key, columns }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Changeset {
    pub deletions: Vec<ChangedObject>,
    pub insertions: Vec<ChangedObject>,
    pub modifications: Vec<ChangedObject>,
}

impl Changeset {
    fn touches_table(&self, table: TableId) -> bool {
        self.deletions.iter().chain(self.insertions.iter()).chain(self.modifications.iter()).any(|o| o.table == table)
    }

    /// True if `table/key` was inserted, or modified with `column` among
    /// its changed columns — the "bottom out" test of spec.md's stage 3.
    fn column_touched(&self, table: TableId, key: ObjectKey, column: ColumnId) -> bool {
        self.insertions.iter().any(|o| o.table == table && o.key == key)
            || self
                .modifications
                .iter()
                .any(|o| o.table == table && o.key == key && o.columns.contains(&column))
    }
}

/// One emitted notification in the pipeline's fixed order: deletions,
/// then insertions, then modifications (Open Question, resolved).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Deleted(TableId, ObjectKey),
    Inserted(TableId, ObjectKey),
    Modified(TableId, ObjectKey),
}

/// Edges discovered for table-level BFS and per-object traversal: forward
/// links from `table`, backlinks pointing into it, and the outgoing links
/// of one object.
pub trait LinkGraph {
    fn forward_targets(&self, table: TableId) -> Vec<TableId>;
    fn backlink_sources(&self, table: TableId) -> Vec<TableId>;
    /// Every outgoing link of one object, tagged with the column it
    /// travels through (forward link, link-list element, or backlink),
    /// so both key-path descent and the general reachability DFS can tell
    /// which column produced which edge.
    fn object_links(&self, table: TableId, key: ObjectKey) -> Vec<(ColumnId, TableId, ObjectKey)>;
}

/// Breadth-first discovery of every table related to `roots`, following
/// both forward links and backlinks, capped the same way `reachability`
/// caps graph BFS depth. When `key_paths` is non-empty, the enumeration is
/// restricted to tables named by some hop (spec.md §4.8 step 1: "If
/// key-paths are present, restrict the enumeration to tables whose keys
/// appear in any path").
pub fn related_tables(
    graph: &dyn LinkGraph,
    roots: &[TableId],
    max_depth: usize,
    key_paths: &[KeyPath],
) -> HashSet<TableId> {
    let mut visited: HashSet<TableId> = roots.iter().copied().collect();
    let mut frontier: VecDeque<(TableId, usize)> = roots.iter().map(|&t| (t, 0)).collect();
    while let Some((table, depth)) = frontier.pop_front() {
        if depth >= max_depth {
            continue;
        }
        let mut neighbors = graph.forward_targets(table);
        neighbors.extend(graph.backlink_sources(table));
        for n in neighbors {
            if visited.insert(n) {
                frontier.push_back((n, depth + 1));
            }
        }
    }
    if key_paths.is_empty() {
        return visited;
    }
    let named: HashSet<TableId> = roots
        .iter()
        .copied()
        .chain(key_paths.iter().flat_map(|p| p.iter().map(|h| h.table)))
        .collect();
    visited.into_iter().filter(|t| named.contains(t)).collect()
}

/// A declared key-path short-circuits applicability to a direct descent
/// instead of a DFS (spec.md §4.8 step 3):
/// - if the path's first hop's column changed directly on `start`, match
///   immediately without resolving any link target;
/// - otherwise follow each hop's link to its current target(s) and check
///   whether that hop's column "bottomed out" (the target was inserted,
///   or modified with that column among its changed columns).
pub fn matches_key_path(graph: &dyn LinkGraph, changeset: &Changeset, start: (TableId, ObjectKey), path: &KeyPath) -> bool {
    let Some(first) = path.first() else { return false };
    if first.table == start.0 && changeset.column_touched(start.0, start.1, first.column) {
        return true;
    }

    let mut current = vec![start];
    for hop in path {
        let mut next = Vec::new();
        for &(table, key) in &current {
            for (column, target_table, target_key) in graph.object_links(table, key) {
                if column != hop.column || target_table != hop.table {
                    continue;
                }
                if changeset.column_touched(target_table, target_key, hop.column) {
                    return true;
                }
                next.push((target_table, target_key));
            }
        }
        if next.is_empty() {
            return false;
        }
        current = next;
    }
    false
}

/// Depth-capped DFS with a per-edge visited set, for observers with no
/// declared key-path: is any object in `targets` reachable from `start`
/// within [`MAX_REACHABILITY_DEPTH`] link hops? Visited `(object, column)`
/// edges are recorded (spec.md §4.8 step 3) rather than visited objects,
/// so revisiting the same object via a different column is still allowed.
pub fn is_reachable(graph: &dyn LinkGraph, start: (TableId, ObjectKey), target: (TableId, ObjectKey)) -> bool {
    let mut visited = HashSet::new();
    reachable_dfs(graph, start, target, 0, &mut visited)
}

fn reachable_dfs(
    graph: &dyn LinkGraph,
    current: (TableId, ObjectKey),
    target: (TableId, ObjectKey),
    depth: usize,
    visited: &mut HashSet<(TableId, ObjectKey, ColumnId)>,
) -> bool {
    if current == target {
        return true;
    }
    if depth >= MAX_REACHABILITY_DEPTH {
        return false;
    }
    for (column, t, k) in graph.object_links(current.0, current.1) {
        if !visited.insert((current.0, current.1, column)) {
            continue;
        }
        if reachable_dfs(graph, (t, k), target, depth + 1, visited) {
            return true;
        }
    }
    false
}

/// General (no key-path) applicability: is `start` within
/// [`MAX_REACHABILITY_DEPTH`] hops of any object the changeset touched?
fn reachable_to_any_touched(graph: &dyn LinkGraph, changeset: &Changeset, start: (TableId, ObjectKey)) -> bool {
    changeset
        .deletions
        .iter()
        .chain(changeset.insertions.iter())
        .chain(changeset.modifications.iter())
        .any(|o| is_reachable(graph, start, (o.table, o.key)))
}

/// Builds the notification list for one commit in the pipeline's fixed
/// emission order.
pub fn notifications_for(changeset: &Changeset) -> Vec<Notification> {
    let mut out = Vec::with_capacity(
        changeset.deletions.len() + changeset.insertions.len() + changeset.modifications.len(),
    );
    out.extend(changeset.deletions.iter().map(|o| Notification::Deleted(o.table, o.key)));
    out.extend(changeset.insertions.iter().map(|o| Notification::Inserted(o.table, o.key)));
    out.extend(changeset.modifications.iter().map(|o| Notification::Modified(o.table, o.key)));
    out
}

/// One registered observer: a root table, the specific root-table objects
/// it watches (the "result set" the spec's object observers are scoped
/// to), an optional list of key-paths, and the callback to run when a
/// commit touches something relevant. The callback runs with no lock
/// held, so a slow or reentrant observer can't stall delivery to others.
pub struct Observer<F: FnMut(&[Notification])> {
    root_table: TableId,
    roots: Vec<ObjectKey>,
    key_paths: Vec<KeyPath>,
    tables: HashSet<TableId>,
    callback: F,
    cancelled: bool,
}

impl<F: FnMut(&[Notification])> Observer<F> {
    /// `graph` is consulted once, at registration, to discover the related
    /// tables (spec.md §4.8 step 1); `deliver` only needs it again for
    /// per-object descent.
    pub fn new(
        graph: &dyn LinkGraph,
        root_table: TableId,
        roots: Vec<ObjectKey>,
        key_paths: Vec<KeyPath>,
        callback: F,
    ) -> Self {
        let tables = related_tables(graph, &[root_table], MAX_REACHABILITY_DEPTH, &key_paths);
        Observer { root_table, roots, key_paths, tables, callback, cancelled: false }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Delivers a commit's notifications, honoring cancellation. Stage 2
    /// (spec.md §4.8) short-circuits to an empty delivery when nothing in
    /// the observer's related-table set was touched; stage 3 then filters
    /// root-table objects by key-path (or general DFS) reachability from
    /// the touched objects, and root-table insertions/deletions pass
    /// through directly since the object itself appearing or vanishing
    /// needs no link descent.
    pub fn deliver(&mut self, graph: &dyn LinkGraph, changeset: &Changeset) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        if !self.tables.iter().any(|t| changeset.touches_table(*t)) {
            return Ok(());
        }

        let deletions: Vec<ChangedObject> =
            changeset.deletions.iter().filter(|o| o.table == self.root_table).cloned().collect();
        let insertions: Vec<ChangedObject> =
            changeset.insertions.iter().filter(|o| o.table == self.root_table).cloned().collect();
        let modifications: Vec<ChangedObject> = self
            .roots
            .iter()
            .filter(|&&key| self.object_is_relevant(graph, changeset, key))
            .map(|&key| ChangedObject::new(self.root_table, key))
            .collect();

        let relevant = Changeset { deletions, insertions, modifications };
        let notes = notifications_for(&relevant);
        if !notes.is_empty() {
            (self.callback)(&notes);
        }
        Ok(())
    }

    fn object_is_relevant(&self, graph: &dyn LinkGraph, changeset: &Changeset, key: ObjectKey) -> bool {
        let start = (self.root_table, key);
        if self.key_paths.is_empty() {
            // `is_reachable(start, start)` is trivially true (depth 0), so
            // this also covers the root object itself being touched.
            return reachable_to_any_touched(graph, changeset, start);
        }
        self.key_paths.iter().any(|path| matches_key_path(graph, changeset, start, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeGraph {
        forward: HashMap<TableId, Vec<TableId>>,
        links: HashMap<(TableId, ObjectKey), Vec<(ColumnId, TableId, ObjectKey)>>,
    }

    impl LinkGraph for FakeGraph {
        fn forward_targets(&self, table: TableId) -> Vec<TableId> {
            self.forward.get(&table).cloned().unwrap_or_default()
        }
        fn backlink_sources(&self, _table: TableId) -> Vec<TableId> {
            Vec::new()
        }
        fn object_links(&self, table: TableId, key: ObjectKey) -> Vec<(ColumnId, TableId, ObjectKey)> {
            self.links.get(&(table, key)).cloned().unwrap_or_default()
        }
    }

    #[test]
    fn related_tables_follows_forward_edges_to_the_depth_cap() {
        let mut forward = HashMap::new();
        forward.insert(0, vec![1]);
        forward.insert(1, vec![2]);
        forward.insert(2, vec![3]);
        let graph = FakeGraph { forward, links: HashMap::new() };
        let found = related_tables(&graph, &[0], 2, &[]);
        assert!(found.contains(&2));
        assert!(!found.contains(&3));
    }

    #[test]
    fn related_tables_restricts_to_key_path_tables_when_paths_are_declared() {
        let mut forward = HashMap::new();
        forward.insert(0, vec![1]);
        forward.insert(1, vec![2]);
        let graph = FakeGraph { forward, links: HashMap::new() };
        let paths = vec![vec![KeyPathHop { table: 1, column: 0 }]];
        let found = related_tables(&graph, &[0], 4, &paths);
        assert!(found.contains(&1));
        assert!(!found.contains(&2), "table 2 is reachable but named by no path hop");
    }

    #[test]
    fn notifications_emit_in_fixed_deletions_insertions_modifications_order() {
        let changeset = Changeset {
            deletions: vec![ChangedObject::new(0, 1)],
            insertions: vec![ChangedObject::new(0, 2)],
            modifications: vec![ChangedObject::new(0, 3)],
        };
        let notes = notifications_for(&changeset);
        assert_eq!(
            notes,
            vec![
                Notification::Deleted(0, 1),
                Notification::Inserted(0, 2),
                Notification::Modified(0, 3),
            ]
        );
    }

    #[test]
    fn observer_skips_unrelated_tables_and_delivers_relevant_ones() {
        let mut links = HashMap::new();
        links.insert((0u32, 1u64), vec![(0u32, 1u32, 10u64)]);
        let graph = FakeGraph { forward: HashMap::new(), links };
        assert!(is_reachable(&graph, (0, 1), (1, 10)));
        assert!(!is_reachable(&graph, (0, 1), (1, 99)));

        let received = RefCell::new(Vec::new());
        let mut observer = Observer::new(&graph, 0, vec![1], vec![], |notes: &[Notification]| {
            received.borrow_mut().extend_from_slice(notes);
        });
        let unrelated = Changeset {
            deletions: vec![],
            insertions: vec![ChangedObject::new(5, 1)],
            modifications: vec![],
        };
        observer.deliver(&graph, &unrelated).unwrap();
        assert!(received.borrow().is_empty());

        let relevant = Changeset {
            deletions: vec![],
            insertions: vec![],
            modifications: vec![ChangedObject::new(0, 1)],
        };
        observer.deliver(&graph, &relevant).unwrap();
        assert_eq!(received.borrow().len(), 1);
    }

    #[test]
    fn cancelled_observer_receives_nothing() {
        let graph = FakeGraph { forward: HashMap::new(), links: HashMap::new() };
        let received = RefCell::new(0);
        let mut observer = Observer::new(&graph, 0, vec![1], vec![], |notes: &[Notification]| {
            *received.borrow_mut() += notes.len();
        });
        observer.cancel();
        let changeset = Changeset {
            deletions: vec![],
            insertions: vec![],
            modifications: vec![ChangedObject::new(0, 1)],
        };
        observer.deliver(&graph, &changeset).unwrap();
        assert_eq!(*received.borrow(), 0);
    }
}
