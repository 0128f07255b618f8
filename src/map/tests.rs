use super::{slot::SlotState, SnapMap};
use crate::{
    error::CompareError,
    policy::PromotionPolicy,
    test_util::{run_deferred, DropCounter, Tracked},
};

use std::{num::NonZeroUsize, sync::Arc};

fn after_misses(n: usize) -> PromotionPolicy {
    PromotionPolicy::AfterMisses(NonZeroUsize::new(n).unwrap())
}

#[test]
fn round_trip() {
    let map = SnapMap::new();

    map.store("a", 1);
    assert_eq!(map.load("a"), Some(1));

    map.store("a", 2);
    assert_eq!(map.load("a"), Some(2));
    assert!(map.contains_key("a"));
    assert!(!map.contains_key("b"));
}

#[test]
fn tombstone_then_load() {
    let map = SnapMap::new();

    map.store("a", 1);
    map.delete("a");
    assert_eq!(map.load("a"), None);

    // Same, with "a" promoted into the snapshot first.
    map.store("a", 1);
    assert_eq!(map.load("a"), Some(1));
    assert!(!map.stats().is_amended());

    map.delete("a");
    assert_eq!(map.load("a"), None);
    assert_eq!(map.slot_state("a"), Some(SlotState::Tombstone));
}

#[test]
fn revive() {
    let map = SnapMap::new();

    map.store("a", 1);
    map.delete("a");
    map.store("a", 2);
    assert_eq!(map.load("a"), Some(2));

    // Promoted key: the tombstone is revived in place, without the lock.
    let map = SnapMap::new();
    map.store("b", 1);
    assert_eq!(map.load("b"), Some(1));
    assert_eq!(map.stats().overlay_build_count(), 1);

    map.delete("b");
    map.store("b", 2);
    assert_eq!(map.load("b"), Some(2));

    let stats = map.stats();
    assert_eq!(stats.overlay_build_count(), 1);
    assert_eq!(stats.locked_lookup_count(), 1);
    assert!(!stats.is_amended());
    assert_eq!(map.slot_state("b"), Some(SlotState::Live));
}

#[test]
fn independence() {
    let map = SnapMap::new();

    map.store("a", 1);
    map.store("b", 2);
    map.delete("a");

    assert_eq!(map.load("b"), Some(2));
    assert_eq!(map.load("a"), None);
}

#[test]
fn promotion_is_transparent() {
    let map = SnapMap::new();
    let keys = ["a", "b", "c"];

    for (i, key) in keys.iter().enumerate() {
        map.store(*key, i);
    }

    let stats = map.stats();
    assert!(stats.is_amended());
    assert_eq!(stats.overlay_build_count(), 1);
    assert_eq!(stats.overlay_len(), 3);
    assert_eq!(stats.promotion_count(), 0);

    // Each of these lookups misses the snapshot. The third one promotes.
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(map.load(*key), Some(i));
    }

    let stats = map.stats();
    assert!(!stats.is_amended());
    assert_eq!(stats.promotion_count(), 1);
    assert_eq!(stats.locked_lookup_count(), 3);
    assert_eq!(stats.pending_misses(), 0);
    assert_eq!(stats.overlay_len(), 0);

    // Served from the snapshot now.
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(map.load(*key), Some(i));
    }
    assert_eq!(map.stats().locked_lookup_count(), 3);
}

#[test]
fn promotion_after_fixed_misses() {
    let map = SnapMap::builder().promotion_policy(after_misses(1)).build();

    map.store(1, "one");
    map.store(2, "two");
    assert_eq!(map.load(&1), Some("one"));

    let stats = map.stats();
    assert_eq!(stats.promotion_count(), 1);
    assert!(!stats.is_amended());
    assert_eq!(map.load(&2), Some("two"));
}

#[test]
fn absent_key_on_overlay_path_still_counts_a_miss() {
    let map = SnapMap::builder().promotion_policy(after_misses(100)).build();

    map.store("a", 1);

    assert_eq!(map.load("missing"), None);
    assert_eq!(map.stats().pending_misses(), 1);

    // Removing a key the overlay never had is a no-op, but still a miss.
    map.delete("missing");
    assert_eq!(map.load_and_delete("missing"), None);

    let stats = map.stats();
    assert_eq!(stats.pending_misses(), 3);
    assert_eq!(stats.locked_lookup_count(), 3);
    assert_eq!(stats.overlay_len(), 1);
    assert_eq!(map.load("a"), Some(1));
}

#[test]
fn load_and_delete() {
    let map = SnapMap::builder().promotion_policy(after_misses(100)).build();

    map.store("a", 1);
    assert!(map.overlay_contains("a"));

    // Overlay-only key: removed from the overlay for good.
    assert_eq!(map.load_and_delete("a"), Some(1));
    assert!(!map.overlay_contains("a"));
    assert_eq!(map.load_and_delete("a"), None);

    // Snapshot key: tombstoned in place.
    let map = SnapMap::new();
    map.store("b", 2);
    assert_eq!(map.load("b"), Some(2));
    assert_eq!(map.load_and_delete("b"), Some(2));
    assert_eq!(map.slot_state("b"), Some(SlotState::Tombstone));
    assert_eq!(map.load_and_delete("b"), None);
}

#[test]
fn slow_path_rereads_the_snapshot() {
    let map = SnapMap::new();
    map.store("a", 1);
    map.store("b", 2);

    let before = map.snapshot_ptr();

    // Two misses on an overlay of two entries publish a new snapshot.
    assert_eq!(map.load("a"), Some(1));
    assert_eq!(map.load("b"), Some(2));
    assert_eq!(map.stats().promotion_count(), 1);

    let after = map.snapshot_ptr();
    assert_ne!(before, after);

    // A caller that saw the old, amended snapshot takes the locked path. It
    // must find the key in the new snapshot without counting a miss.
    assert_eq!(map.lookup_slow("a"), Some(1));
    assert_eq!(map.lookup_slow("zzz"), None);

    let stats = map.stats();
    assert_eq!(stats.locked_lookup_count(), 2);
    assert_eq!(stats.pending_misses(), 0);
}

#[test]
fn store_after_expunge() {
    let map = SnapMap::new();

    map.store("a", 1);
    assert_eq!(map.load("a"), Some(1));
    map.delete("a");
    assert_eq!(map.slot_state("a"), Some(SlotState::Tombstone));

    // A new key builds an overlay without the tombstone.
    map.store("b", 2);
    assert_eq!(map.slot_state("a"), Some(SlotState::Expunged));
    assert!(!map.overlay_contains("a"));
    assert_eq!(map.stats().overlay_build_count(), 2);

    // The expunged slot is put back into the overlay before it is revived.
    map.store("a", 3);
    assert_eq!(map.slot_state("a"), Some(SlotState::Live));
    assert!(map.overlay_contains("a"));
    assert_eq!(map.load("a"), Some(3));

    // "a" survives the next promotion.
    assert_eq!(map.load("b"), Some(2));
    assert_eq!(map.load("b"), Some(2));
    assert!(!map.stats().is_amended());
    assert_eq!(map.load("a"), Some(3));
    assert_eq!(map.slot_state("a"), Some(SlotState::Live));
}

#[test]
fn promotion_drops_tombstones() {
    let map = SnapMap::new();

    map.store("a", 1);
    assert_eq!(map.load("a"), Some(1));
    map.delete("a");

    map.store("b", 2);
    assert_eq!(map.load("b"), Some(2));
    assert!(!map.stats().is_amended());

    assert_eq!(map.slot_state("a"), None);
    assert_eq!(map.slot_state("b"), Some(SlotState::Live));
}

#[test]
fn swap() {
    let map = SnapMap::new();

    assert_eq!(map.swap("k", 1), None);
    assert_eq!(map.swap("k", 2), Some(1));

    // Lock-free once promoted.
    assert_eq!(map.load("k"), Some(2));
    assert!(!map.stats().is_amended());
    assert_eq!(map.swap("k", 3), Some(2));

    map.delete("k");
    assert_eq!(map.swap("k", 4), None);
    assert_eq!(map.swap_with("k", 5, |previous| previous * 10), Some(40));
}

#[test]
fn load_or_store() {
    let map = SnapMap::new();

    assert_eq!(map.load_or_store("k", 1), (1, false));
    // Overlay hit: counts a miss, which promotes the single-entry overlay.
    assert_eq!(map.load_or_store("k", 2), (1, true));
    assert_eq!(map.stats().promotion_count(), 1);

    // Snapshot hit.
    assert_eq!(map.load_or_store("k", 3), (1, true));

    // Tombstone in the snapshot: filled without the lock.
    map.delete("k");
    assert_eq!(map.load_or_store("k", 5), (5, false));
    assert!(!map.stats().is_amended());

    // Expunged slot: revived under the lock.
    map.delete("k");
    map.store("other", 0);
    assert_eq!(map.slot_state("k"), Some(SlotState::Expunged));
    assert_eq!(map.load_or_store("k", 7), (7, false));
    assert!(map.overlay_contains("k"));
    assert_eq!(map.load("k"), Some(7));
}

#[test]
fn compare_and_swap() {
    let map = SnapMap::new();
    map.store("k", 1);

    // Overlay path.
    assert_eq!(
        map.compare_and_swap("k", &2, 3),
        Err(CompareError::Mismatch)
    );
    assert_eq!(map.stats().locked_lookup_count(), 1);

    // Snapshot path.
    assert_eq!(map.compare_and_swap("k", &1, 3), Ok(()));
    assert_eq!(map.load("k"), Some(3));

    assert_eq!(
        map.compare_and_swap("missing", &1, 2),
        Err(CompareError::Absent)
    );

    map.delete("k");
    assert_eq!(map.compare_and_swap("k", &3, 4), Err(CompareError::Absent));
    assert_eq!(map.load("k"), None);
}

#[test]
fn compare_and_delete() {
    let map = SnapMap::new();
    map.store("k", 1);
    assert_eq!(map.load("k"), Some(1));

    assert_eq!(
        map.compare_and_delete("k", &9),
        Err(CompareError::Mismatch)
    );
    assert_eq!(map.compare_and_delete("k", &1), Ok(()));
    assert_eq!(map.load("k"), None);
    assert_eq!(map.compare_and_delete("k", &1), Err(CompareError::Absent));

    // Overlay-only key: tombstoned in place, not removed.
    let map = SnapMap::builder().promotion_policy(after_misses(100)).build();
    map.store("n", 1);
    assert_eq!(map.compare_and_delete("n", &1), Ok(()));
    assert!(map.overlay_contains("n"));
    assert_eq!(map.load("n"), None);
    assert_eq!(map.compare_and_delete("absent", &1), Err(CompareError::Absent));
}

#[test]
fn scan_promotes_first() {
    let map = SnapMap::new();
    for key in ["c", "a", "b"] {
        map.store(key, key.to_uppercase());
    }
    map.delete("b");
    assert!(map.stats().is_amended());

    let mut seen = Vec::new();
    map.scan(|key, value| {
        seen.push((*key, value.clone()));
        true
    });
    seen.sort_unstable();
    assert_eq!(seen, [("a", "A".to_string()), ("c", "C".to_string())]);

    let stats = map.stats();
    assert!(!stats.is_amended());
    assert_eq!(stats.promotion_count(), 1);

    let mut visits = 0;
    map.scan(|_, _| {
        visits += 1;
        false
    });
    assert_eq!(visits, 1);
}

#[test]
fn clear() {
    let map = SnapMap::new();
    assert!(map.is_empty());
    map.clear();

    map.store(1, 10);
    assert_eq!(map.load(&1), Some(10));
    map.store(2, 20);
    assert!(!map.is_empty());

    map.clear();
    assert!(map.is_empty());
    assert_eq!(map.load(&1), None);
    assert_eq!(map.load(&2), None);

    let stats = map.stats();
    assert!(!stats.is_amended());
    assert_eq!(stats.overlay_len(), 0);
    assert_eq!(stats.pending_misses(), 0);

    map.store(3, 30);
    assert_eq!(map.load(&3), Some(30));
}

#[test]
fn values_are_dropped() {
    let counter = Arc::new(DropCounter::default());

    {
        let map = SnapMap::builder().promotion_policy(after_misses(100)).build();

        map.store("a", Tracked::new(&counter, 1));
        map.store("b", Tracked::new(&counter, 2));
        map.store("c", Tracked::new(&counter, 3));
        map.store("a", Tracked::new(&counter, 4));

        assert_eq!(map.load_with("a", |v| v.value), Some(4));
        assert_eq!(map.load_and_delete_with("b", |v| v.value), Some(2));

        drop(map);
        // The live values go with the map.
        assert!(counter.dropped() >= 2);
    }

    run_deferred();

    assert_eq!(counter.dropped(), 4);
}

#[test]
fn default_and_from_iter() {
    let map: SnapMap<u32, u32> = SnapMap::default();
    assert!(map.is_empty());

    let map: SnapMap<u32, u32> = (0..10).map(|i| (i, i * i)).collect();
    for i in 0..10 {
        assert_eq!(map.load(&i), Some(i * i));
    }
}

#[test]
fn debug_format() {
    let map = SnapMap::new();
    map.store(1, "one");
    assert!(map.stats().is_amended());

    assert_eq!(format!("{map:?}"), r#"{1: "one"}"#);

    // Formatting walks a single snapshot, so it promoted the overlay.
    let stats = map.stats();
    assert!(!stats.is_amended());
    assert_eq!(stats.promotion_count(), 1);

    map.store(2, "two");
    assert!(!map.is_empty());
    assert_eq!(map.stats().promotion_count(), 2);
}
