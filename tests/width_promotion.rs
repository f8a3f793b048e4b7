//! §8 scenario 4: width promotion as increasingly large values are
//! appended to an integer column.

use arcadb::arena::Arena;
use arcadb::config::GrowthPolicy;
use arcadb::leaf::integer::IntegerColumn;

#[test]
fn widths_grow_monotonically_and_values_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = Arena::create(&dir.path().join("a.db"), GrowthPolicy::conservative()).unwrap();
    let mut col = IntegerColumn::new();

    let sequence = [1i64, 2, 4, 8, 16, 255, 65535];
    for v in sequence {
        col.append(&mut arena, v).unwrap();
    }

    let n = col.len(&mut arena).unwrap();
    assert_eq!(n, sequence.len() as u64);
    for (i, v) in sequence.iter().enumerate() {
        assert_eq!(col.get(&mut arena, i as u64).unwrap(), *v);
    }
}
