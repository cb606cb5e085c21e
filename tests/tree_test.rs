//! Tree and name-table integration tests

use groundwork::{NameTable, TableOptions, Tree};
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn test_two_thousand_keys_with_one_hash() {
    // Every key hashes to 35; ordering falls entirely on the key bytes.
    let mut tree: Tree<u32> = Tree::new();
    for value in 0..2000u32 {
        tree.set_value(35, &value.to_be_bytes(), value).unwrap();
    }
    assert_eq!(tree.len(), 2000);
    tree.check_state().unwrap();

    for value in 0..2000u32 {
        assert_eq!(tree.get_value(35, &value.to_be_bytes()), Some(&value));
    }

    // Forward iteration: each key exactly once, ascending.
    let mut seen = HashSet::new();
    let mut expected = 0u32;
    let mut cursor = tree.first();
    while let Some(node) = cursor {
        assert_eq!(node.key_hash(), 35);
        assert_eq!(node.key(), expected.to_be_bytes());
        assert!(seen.insert(*node.value()));
        expected += 1;
        cursor = tree.next(Some(node));
    }
    assert_eq!(seen.len(), 2000);

    // Reverse iteration: same population, descending.
    let mut count = 0;
    let mut cursor = tree.prev(None);
    let mut last: Option<u32> = None;
    while let Some(node) = cursor {
        if let Some(previous) = last {
            assert!(*node.value() < previous);
        }
        last = Some(*node.value());
        count += 1;
        cursor = tree.prev(Some(node));
    }
    assert_eq!(count, 2000);

    // Remove the odd values and verify the rest survive.
    for value in (1..2000u32).step_by(2) {
        assert!(tree.remove_value(35, &value.to_be_bytes()));
    }
    assert_eq!(tree.len(), 1000);
    tree.check_state().unwrap();
    for value in (0..2000u32).step_by(2) {
        assert_eq!(tree.get_value(35, &value.to_be_bytes()), Some(&value));
    }
}

#[test]
fn test_name_table_round_trip_laws() {
    let mut table: NameTable<String> = NameTable::new(TableOptions::empty(), 5);

    table.set_value(b"k", "v1".to_string()).unwrap();
    assert_eq!(table.get_value(b"k").map(String::as_str), Some("v1"));

    table.set_value(b"k", "v2".to_string()).unwrap();
    assert_eq!(table.get_value(b"k").map(String::as_str), Some("v2"));

    assert!(table.remove_value(b"k"));
    assert_eq!(table.get_value(b"k"), None);
    assert!(!table.remove_value(b"k"));
}

#[test]
fn test_name_table_bulk_population() {
    let mut table: NameTable<usize> = NameTable::new(TableOptions::empty(), 4);
    for index in 0..3000usize {
        table.set_value(format!("entry/{index}").as_bytes(), index).unwrap();
    }
    assert_eq!(table.len(), 3000);
    table.check_state().unwrap();

    for index in (0..3000usize).step_by(3) {
        assert!(table.remove_value(format!("entry/{index}").as_bytes()));
    }
    assert_eq!(table.len(), 2000);
    table.check_state().unwrap();
    assert_eq!(table.get_value(b"entry/0"), None);
    assert_eq!(table.get_value(b"entry/1"), Some(&1));
}

#[test]
fn test_parent_chain_lookups() {
    let mut grandparent: NameTable<u8> = NameTable::new(TableOptions::empty(), 2);
    grandparent.set_value(b"root-only", 1).unwrap();
    let grandparent = Arc::new(grandparent);

    let mut parent: NameTable<u8> = NameTable::new(TableOptions::empty(), 2);
    parent.set_parent(grandparent);
    parent.set_value(b"mid", 2).unwrap();
    let parent = Arc::new(parent);

    let mut child: NameTable<u8> = NameTable::new(TableOptions::empty(), 2);
    child.set_parent(parent.clone());
    child.set_value(b"leaf", 3).unwrap();

    // Misses cascade all the way up.
    assert_eq!(child.get_value(b"leaf"), Some(&3));
    assert_eq!(child.get_value(b"mid"), Some(&2));
    assert_eq!(child.get_value(b"root-only"), Some(&1));
    assert_eq!(child.get_value(b"missing"), None);

    // Writes stay local.
    child.set_value(b"mid", 99).unwrap();
    assert_eq!(child.get_value(b"mid"), Some(&99));
    assert_eq!(parent.get_value(b"mid"), Some(&2));
}
