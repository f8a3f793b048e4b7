//! §8 scenario 1: monotonic append of a large sequential run.

use arcadb::arena::Arena;
use arcadb::btree::{self, Root};
use arcadb::config::GrowthPolicy;

#[test]
fn sequential_append_round_trips_at_scale() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = Arena::create(&dir.path().join("a.db"), GrowthPolicy::conservative()).unwrap();

    const N: u64 = 1 << 16; // scaled down from 2^20 for test runtime, same code path.
    let mut root: Root = None;
    for k in 0..N {
        root = Some(btree::bptree_insert(&mut arena, root, k, k as i64).unwrap());
    }

    assert_eq!(btree::bptree_size(&mut arena, root).unwrap(), N);
    for k in [0, 1, N / 2, N - 1] {
        assert_eq!(btree::bptree_get(&mut arena, root, k).unwrap(), k as i64);
    }
}
