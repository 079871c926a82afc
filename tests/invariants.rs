//! Single-threaded property and boundary tests for `SharedTable`.

use sharedmap::{Error, SharedTable, TableHasher};

#[test]
fn insert_then_get() {
    let t = SharedTable::create(8, 8, 8).unwrap();
    assert_eq!(t.length(), 0);
    t.set("a", "1").unwrap();
    assert_eq!(t.length(), 1);
    t.set("b", "2").unwrap();
    assert_eq!(t.length(), 2);
    assert_eq!(t.get("a"), Some("1".to_string()));
    assert_eq!(t.get("b"), Some("2".to_string()));
    assert_eq!(t.get("c"), None);
}

#[test]
fn overwrite_does_not_change_size() {
    let t = SharedTable::create(8, 8, 8).unwrap();
    t.set("a", "1").unwrap();
    assert_eq!(t.length(), 1);
    t.set("a", "2").unwrap();
    assert_eq!(t.length(), 1);
    assert_eq!(t.get("a"), Some("2".to_string()));
}

#[test]
fn delete_removes_key_and_decrements_size() {
    let t = SharedTable::create(8, 8, 8).unwrap();
    t.set("a", "1").unwrap();
    t.set("b", "2").unwrap();
    t.delete("a").unwrap();
    assert_eq!(t.length(), 1);
    assert_eq!(t.get("a"), None);
    assert_eq!(t.get("b"), Some("2".to_string()));
}

#[test]
fn delete_absent_key_is_a_no_op() {
    let t = SharedTable::create(8, 8, 8).unwrap();
    t.set("a", "1").unwrap();
    t.delete("nope").unwrap();
    assert_eq!(t.length(), 1);
}

#[test]
fn empty_key_is_rejected() {
    let t = SharedTable::create(8, 8, 8).unwrap();
    assert_eq!(t.set("", "x"), Err(Error::InvalidKey));
}

#[test]
fn key_over_capacity_is_rejected() {
    let t = SharedTable::create(8, 4, 8).unwrap();
    let err = t.set("toolongforfour", "x").unwrap_err();
    match err {
        Error::KeyTooLong { len, cap } => {
            assert_eq!(cap, 4);
            assert!(len > 4);
        }
        other => panic!("expected KeyTooLong, got {other:?}"),
    }
}

#[test]
fn value_over_capacity_is_rejected() {
    let t = SharedTable::create(8, 8, 2).unwrap();
    let err = t.set("a", "toolong").unwrap_err();
    assert!(matches!(err, Error::ValueTooLong { cap: 2, .. }));
}

#[test]
fn table_full_once_capacity_exhausted() {
    let t = SharedTable::create(4, 8, 8).unwrap();
    for i in 0..4 {
        t.set(&format!("k{i}"), "v").unwrap();
    }
    let err = t.set("one-too-many", "v").unwrap_err();
    assert_eq!(err, Error::TableFull);
}

#[test]
fn all_keys_remain_retrievable_up_to_capacity() {
    let t = SharedTable::create(64, 16, 16).unwrap();
    for i in 0..64 {
        t.set(&format!("key-{i}"), &format!("val-{i}")).unwrap();
    }
    for i in 0..64 {
        assert_eq!(t.get(&format!("key-{i}")), Some(format!("val-{i}")));
    }
}

#[test]
fn reinserting_after_deletes_reuses_freed_slots() {
    let t = SharedTable::create(4, 8, 8).unwrap();
    for i in 0..4 {
        t.set(&format!("k{i}"), "v").unwrap();
    }
    for i in 0..4 {
        t.delete(&format!("k{i}")).unwrap();
    }
    assert_eq!(t.length(), 0);
    for i in 0..4 {
        t.set(&format!("k{i}"), "v2").unwrap();
    }
    assert_eq!(t.length(), 4);
    for i in 0..4 {
        assert_eq!(t.get(&format!("k{i}")), Some("v2".to_string()));
    }
}

#[test]
fn keys_cursor_yields_every_present_key() {
    let t = SharedTable::create(16, 8, 8).unwrap();
    for i in 0..10 {
        t.set(&format!("k{i}"), "v").unwrap();
    }
    let mut seen: Vec<String> = t.keys().collect();
    seen.sort();
    let mut want: Vec<String> = (0..10).map(|i| format!("k{i}")).collect();
    want.sort();
    assert_eq!(seen, want);
}

#[test]
fn map_collects_every_pair() {
    let t = SharedTable::create(16, 8, 8).unwrap();
    t.set("a", "1").unwrap();
    t.set("b", "2").unwrap();
    let mut pairs = t.map(|k, v| (k.to_string(), v.to_string()));
    pairs.sort();
    assert_eq!(
        pairs,
        vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
    );
}

#[test]
fn reduce_sums_values() {
    let t = SharedTable::create(16, 8, 8).unwrap();
    for i in 1..=5 {
        t.set(&format!("k{i}"), &i.to_string()).unwrap();
    }
    let total = t.reduce(0i64, |acc, _k, v| acc + v.parse::<i64>().unwrap());
    assert_eq!(total, 15);
}

#[test]
fn clear_empties_the_table() {
    let t = SharedTable::create(8, 8, 8).unwrap();
    t.set("a", "1").unwrap();
    t.set("b", "2").unwrap();
    t.clear();
    assert_eq!(t.length(), 0);
    assert_eq!(t.get("a"), None);
    assert_eq!(t.keys().count(), 0);
}

#[test]
fn lock_write_excludes_other_operations_from_the_caller_thread() {
    let t = SharedTable::create(8, 8, 8).unwrap();
    t.set("a", "1").unwrap();
    t.lock_write();
    // Under the caller's own exclusive hold, the caller must thread
    // `Options::caller_holds_lock_write()` through to avoid deadlocking
    // on its own gate.
    let opts = sharedmap::Options::caller_holds_lock_write();
    assert_eq!(t.get_opt("a", opts), Some("1".to_string()));
    t.set_opt("b", "2", opts).unwrap();
    t.unlock_write();
    assert_eq!(t.get("b"), Some("2".to_string()));
}

/// A hasher that collides every key onto slot 0, to drive the coalesced
/// chaining and rechaining paths deterministically.
struct AllCollide;

impl TableHasher for AllCollide {
    fn hash(&self, _key: &str, _capacity: u32) -> u32 {
        0
    }
}

#[test]
fn forced_collision_chains_and_rechains_on_delete() {
    let t = SharedTable::create_with_hasher(4, 8, 8, AllCollide).unwrap();
    t.set("a", "1").unwrap();
    t.set("b", "2").unwrap();

    assert_eq!(t.get("a"), Some("1".to_string()));
    assert_eq!(t.get("b"), Some("2".to_string()));
    assert_eq!(t.length(), 2);

    // Deleting the home occupant ("a") must leave "b" still reachable —
    // rechained into the vacated home slot.
    t.delete("a").unwrap();
    assert_eq!(t.get("a"), None);
    assert_eq!(t.get("b"), Some("2".to_string()));
    assert_eq!(t.length(), 1);

    t.delete("b").unwrap();
    assert_eq!(t.get("b"), None);
    assert_eq!(t.length(), 0);
}

#[test]
fn forced_collision_three_way_chain_survives_middle_delete() {
    let t = SharedTable::create_with_hasher(8, 8, 8, AllCollide).unwrap();
    t.set("a", "1").unwrap();
    t.set("b", "2").unwrap();
    t.set("c", "3").unwrap();

    t.delete("b").unwrap();
    assert_eq!(t.get("a"), Some("1".to_string()));
    assert_eq!(t.get("b"), None);
    assert_eq!(t.get("c"), Some("3".to_string()));
    assert_eq!(t.length(), 2);
}

#[test]
fn eviction_relocates_usurped_occupant() {
    // "a" and "b" share home 0, chaining b into the first free slot (1,
    // given the cursor starts at 0). "c"'s home is that same slot 1 —
    // inserting "c" must evict "b" out of slot 1 before taking it over.
    struct ThreeHomes;
    impl TableHasher for ThreeHomes {
        fn hash(&self, key: &str, _capacity: u32) -> u32 {
            match key {
                "a" | "b" => 0,
                "c" => 1,
                _ => unreachable!(),
            }
        }
    }

    let t = SharedTable::create_with_hasher(4, 8, 8, ThreeHomes).unwrap();
    t.set("a", "1").unwrap(); // slot 0 (home)
    t.set("b", "2").unwrap(); // slot 1 (chained tail of a's chain)
    t.set("c", "3").unwrap(); // home is slot 1: evicts "b" elsewhere

    assert_eq!(t.get("a"), Some("1".to_string()));
    assert_eq!(t.get("b"), Some("2".to_string()));
    assert_eq!(t.get("c"), Some("3".to_string()));
    assert_eq!(t.length(), 3);
}
