//! Sequential behavior tests
//!
//! Single-threaded laws of the table: insert modes, removal, replace,
//! iteration in split order, resize round trips, and teardown.

use splitmap_table::{Error, Table, TableConfig, MIN_TABLE_SIZE};

fn key(v: u64) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

fn key_of(node: &splitmap_table::Node) -> u64 {
    u64::from_le_bytes(node.key().try_into().unwrap())
}

/// Hash that reads the key back as an integer, so bucket placement and
/// split order are exact.
fn identity_hash(key: &[u8], _seed: usize) -> usize {
    let mut bytes = [0u8; 8];
    let len = key.len().min(8);
    bytes[..len].copy_from_slice(&key[..len]);
    u64::from_le_bytes(bytes) as usize
}

/// Hash that lands every key in one bucket.
fn zero_hash(_key: &[u8], _seed: usize) -> usize {
    0
}

fn table_with(init_size: usize) -> Table {
    Table::with_default_sync(TableConfig {
        init_size,
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn test_add_then_lookup_finds_key() {
    let table = table_with(4);
    let guard = table.read_lock();

    table.add(&guard, key(7), b"seven".to_vec());
    let found = table.lookup(&guard, &key(7));
    let node = found.node().expect("key must be present");
    assert_eq!(node.key(), key(7));
    assert_eq!(node.value(), b"seven");
}

#[test]
fn test_lookup_missing_key() {
    let table = table_with(4);
    let guard = table.read_lock();

    table.add(&guard, key(1), b"one".to_vec());
    assert!(table.lookup(&guard, &key(2)).node().is_none());
}

#[test]
fn test_add_unique_returns_existing() {
    let table = table_with(4);
    let guard = table.read_lock();

    let first = table.add_unique(&guard, key(5), b"a".to_vec());
    assert!(first.was_added());
    let second = table.add_unique(&guard, key(5), b"b".to_vec());
    assert!(!second.was_added());
    // The pre-existing node is handed back untouched.
    assert_eq!(second.node().value(), b"a");
    assert!(std::ptr::eq(first.node(), second.node()));

    assert_eq!(table.count_nodes(&guard).count, 1);
}

#[test]
fn test_add_del_lookup_not_found() {
    let table = table_with(4);
    let guard = table.read_lock();

    table.add(&guard, key(9), b"nine".to_vec());
    let found = table.lookup(&guard, &key(9));
    table.del(&guard, &found).unwrap();

    assert!(table.lookup(&guard, &key(9)).node().is_none());
    // A second removal through the same iterator loses.
    assert!(matches!(table.del(&guard, &found), Err(Error::NotFound)));
}

#[test]
fn test_add_replace_returns_previous() {
    let table = table_with(4);
    let guard = table.read_lock();

    assert!(table.add_replace(&guard, key(3), b"v1".to_vec()).is_none());
    let old = table.add_replace(&guard, key(3), b"v2".to_vec());
    assert_eq!(old.expect("first version").value(), b"v1");

    let found = table.lookup(&guard, &key(3));
    assert_eq!(found.node().unwrap().value(), b"v2");
    assert_eq!(table.count_nodes(&guard).count, 1);
}

#[test]
fn test_replace_at_iterator() {
    let table = table_with(4);
    let guard = table.read_lock();

    table.add(&guard, key(8), b"old".to_vec());
    let found = table.lookup(&guard, &key(8));
    table.replace(&guard, &found, key(8), b"new".to_vec()).unwrap();
    assert_eq!(table.lookup(&guard, &key(8)).node().unwrap().value(), b"new");

    // The iterator still points at the node that was swapped out.
    assert!(matches!(
        table.replace(&guard, &found, key(8), b"newer".to_vec()),
        Err(Error::NotFound)
    ));
}

#[test]
fn test_split_order_iteration() {
    // Size-4 table, identity hash, keys [5, 1, 7, 3]: list order is
    // ascending bit-reversed hash, which comes out as 1, 5, 3, 7.
    let table = Table::with_default_sync(TableConfig {
        hash: identity_hash,
        init_size: 4,
        ..Default::default()
    })
    .unwrap();
    let guard = table.read_lock();
    for k in [5u64, 1, 7, 3] {
        table.add(&guard, key(k), key(k));
    }

    let mut seen = Vec::new();
    let mut iter = table.first(&guard);
    while let Some(node) = iter.node() {
        seen.push(key_of(node));
        table.next(&guard, &mut iter);
    }
    assert_eq!(seen, vec![1, 5, 3, 7]);
    assert_eq!(table.count_nodes(&guard).count, 4);
}

#[test]
fn test_duplicates_in_insertion_order() {
    let table = table_with(4);
    let guard = table.read_lock();

    table.add(&guard, key(6), b"first".to_vec());
    table.add(&guard, key(6), b"second".to_vec());
    assert_eq!(table.count_nodes(&guard).count, 2);

    let mut iter = table.lookup(&guard, &key(6));
    assert_eq!(iter.node().unwrap().value(), b"first");
    table.next_duplicate(&guard, &mut iter);
    assert_eq!(iter.node().unwrap().value(), b"second");
    table.next_duplicate(&guard, &mut iter);
    assert!(iter.node().is_none());
}

#[test]
fn test_count_nodes_tracks_adds_and_dels() {
    let table = table_with(8);
    let guard = table.read_lock();

    for k in 0..32u64 {
        table.add(&guard, key(k), key(k));
    }
    for k in 0..16u64 {
        let found = table.lookup(&guard, &key(k));
        table.del(&guard, &found).unwrap();
    }

    let count = table.count_nodes(&guard);
    assert_eq!(count.count, 16);
    assert_eq!(count.removed, 0);
    assert_eq!(count.approx_before, 16);
    assert_eq!(count.approx_after, 16);
}

#[test]
fn test_resize_grow_preserves_keys() {
    let table = table_with(1);
    {
        let guard = table.read_lock();
        for k in 0..200u64 {
            table.add(&guard, key(k), key(k));
        }
    }
    table.resize(256);
    assert_eq!(table.size(), 256);

    let guard = table.read_lock();
    for k in 0..200u64 {
        assert!(table.lookup(&guard, &key(k)).node().is_some(), "key {}", k);
    }
}

#[test]
fn test_resize_shrink_to_min_preserves_keys() {
    let table = table_with(64);
    {
        let guard = table.read_lock();
        for k in 0..100u64 {
            table.add(&guard, key(k), key(k));
        }
    }
    table.resize(MIN_TABLE_SIZE);
    assert_eq!(table.size(), MIN_TABLE_SIZE);

    let guard = table.read_lock();
    for k in 0..100u64 {
        assert!(table.lookup(&guard, &key(k)).node().is_some(), "key {}", k);
    }
    assert_eq!(table.count_nodes(&guard).count, 100);
}

#[test]
fn test_grow_from_minimum_to_large() {
    let table = table_with(1);
    {
        let guard = table.read_lock();
        for k in 0..64u64 {
            table.add(&guard, key(k), key(k));
        }
    }
    table.resize(1 << 16);
    assert_eq!(table.size(), 1 << 16);

    let guard = table.read_lock();
    for k in 0..64u64 {
        assert!(table.lookup(&guard, &key(k)).node().is_some(), "key {}", k);
    }
}

#[test]
fn test_resize_rounds_up_to_power_of_two() {
    let table = table_with(1);
    table.resize(5);
    assert_eq!(table.size(), 8);
    table.resize(0);
    assert_eq!(table.size(), MIN_TABLE_SIZE);
}

#[test]
fn test_init_size_must_be_power_of_two() {
    let result = Table::with_default_sync(TableConfig {
        init_size: 6,
        ..Default::default()
    });
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[test]
fn test_destroy_empty_table() {
    let table = table_with(8);
    table.destroy().unwrap();
}

#[test]
fn test_destroy_rejects_populated_table() {
    let table = table_with(8);
    {
        let guard = table.read_lock();
        table.add(&guard, key(1), b"one".to_vec());
    }
    assert!(matches!(table.destroy(), Err(Error::NotEmpty)));
}

#[test]
fn test_destroy_after_deleting_everything() {
    let table = table_with(8);
    {
        let guard = table.read_lock();
        for k in 0..10u64 {
            table.add(&guard, key(k), key(k));
        }
        for k in 0..10u64 {
            let found = table.lookup(&guard, &key(k));
            table.del(&guard, &found).unwrap();
        }
    }
    table.destroy().unwrap();
}

#[test]
fn test_all_keys_collide_in_one_bucket() {
    let table = Table::with_default_sync(TableConfig {
        hash: zero_hash,
        init_size: 8,
        ..Default::default()
    })
    .unwrap();
    let guard = table.read_lock();

    for k in 0..50u64 {
        assert!(table.add_unique(&guard, key(k), key(k)).was_added());
    }
    for k in 0..50u64 {
        assert!(table.lookup(&guard, &key(k)).node().is_some(), "key {}", k);
    }
    for k in (0..50u64).step_by(2) {
        let found = table.lookup(&guard, &key(k));
        table.del(&guard, &found).unwrap();
    }
    for k in 0..50u64 {
        let present = table.lookup(&guard, &key(k)).node().is_some();
        assert_eq!(present, k % 2 == 1, "key {}", k);
    }
    assert_eq!(table.count_nodes(&guard).count, 25);
}

#[test]
fn test_minimum_size_table() {
    let table = table_with(MIN_TABLE_SIZE);
    assert_eq!(table.size(), MIN_TABLE_SIZE);
    let guard = table.read_lock();

    table.add(&guard, key(42), b"answer".to_vec());
    assert_eq!(
        table.lookup(&guard, &key(42)).node().unwrap().value(),
        b"answer"
    );
    let found = table.lookup(&guard, &key(42));
    table.del(&guard, &found).unwrap();
    assert!(table.lookup(&guard, &key(42)).node().is_none());
}
