//! §8 scenario 2: copy-on-write isolation between a reader pinned at an
//! old version and a writer publishing a new one.

use arcadb::arena::{Arena, HeaderBlock};
use arcadb::btree::{self, Root};
use arcadb::config::GrowthPolicy;
use arcadb::snapshot::SnapshotCoordinator;

#[test]
fn reader_pinned_before_commit_does_not_see_the_new_value() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = Arena::create(&dir.path().join("a.db"), GrowthPolicy::conservative()).unwrap();

    let mut root: Root = None;
    for k in 0..10u64 {
        root = Some(btree::bptree_insert(&mut arena, root, k, k as i64).unwrap());
    }
    let v0_size = btree::bptree_size(&mut arena, root).unwrap();

    let header = HeaderBlock { top_ref_slots: [0, 0], selector: false, next_version: 1 };
    let coordinator = SnapshotCoordinator::from_header(&header);

    let reader_b = coordinator.begin_read().unwrap();
    assert_eq!(reader_b.version, 0);

    // Writer A appends one value and commits, producing V1.
    let writer_a = coordinator.begin_write().unwrap();
    root = Some(btree::bptree_insert(&mut arena, root, v0_size, v0_size as i64).unwrap());
    let v1_size = btree::bptree_size(&mut arena, root).unwrap();
    coordinator.commit(&mut arena, writer_a, root.unwrap()).unwrap();

    assert_eq!(v1_size, v0_size + 1);
    // B's pinned version never changes underneath it.
    assert_eq!(reader_b.version, 0);
    assert_eq!(coordinator.oldest_pinned_version(), 0, "B still pins V0");
    drop(reader_b);

    let reader_c = coordinator.begin_read().unwrap();
    assert_eq!(reader_c.version, 1);
    assert_eq!(btree::bptree_get(&mut arena, root, v0_size).unwrap(), v0_size as i64);
}
