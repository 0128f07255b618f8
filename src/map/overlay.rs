use super::{
    slot::Slot,
    snapshot::{Entries, Snapshot},
};
use crate::{policy::PromotionPolicy, stats::MapStats};

use std::{
    borrow::Borrow,
    collections::HashMap,
    hash::{BuildHasher, Hash},
    sync::Arc,
};

use crossbeam_epoch::Guard;

/// Outcome of building an overlay from a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Rebuild {
    pub(crate) copied: usize,
    pub(crate) expunged: usize,
}

/// The lock-protected half of the map.
///
/// `entries` is `None` while the snapshot is not amended. Otherwise it holds
/// every non-expunged slot of the snapshot plus the keys added since.
pub(crate) struct Overlay<K, V, S> {
    entries: Option<Entries<K, V, S>>,
    misses: usize,
    promotion_count: u64,
    build_count: u64,
    locked_lookup_count: u64,
}

impl<K, V, S> Overlay<K, V, S> {
    pub(crate) fn new() -> Self {
        Self {
            entries: None,
            misses: 0,
            promotion_count: 0,
            build_count: 0,
            locked_lookup_count: 0,
        }
    }

    pub(crate) fn is_present(&self) -> bool {
        self.entries.is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, HashMap::len)
    }

    /// Counts a lookup that missed the snapshot. Returns the entries to publish
    /// as the next snapshot once `policy` says so.
    pub(crate) fn record_miss(&mut self, policy: PromotionPolicy) -> Option<Entries<K, V, S>> {
        debug_assert!(self.is_present(), "miss recorded without an overlay");

        self.misses += 1;
        self.locked_lookup_count += 1;

        if !policy.should_promote(self.misses, self.len()) {
            return None;
        }

        self.take_for_promotion()
    }

    /// Hands the entries over for promotion and starts counting misses anew.
    pub(crate) fn take_for_promotion(&mut self) -> Option<Entries<K, V, S>> {
        self.misses = 0;

        let entries = self.entries.take();
        if entries.is_some() {
            self.promotion_count += 1;
        }
        entries
    }

    /// Forgets the overlay without promoting it. The caller drops the returned
    /// entries after releasing the lock.
    pub(crate) fn clear(&mut self) -> Option<Entries<K, V, S>> {
        self.misses = 0;
        self.entries.take()
    }

    pub(crate) fn stats(&self, is_amended: bool) -> MapStats {
        MapStats {
            promotion_count: self.promotion_count,
            overlay_build_count: self.build_count,
            locked_lookup_count: self.locked_lookup_count,
            pending_misses: self.misses,
            overlay_len: self.len(),
            is_amended,
        }
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> Overlay<K, V, S> {
    pub(crate) fn get<Q>(&self, key: &Q) -> Option<&Arc<Slot<V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.as_ref()?.get(key)
    }

    pub(crate) fn insert(&mut self, key: K, slot: Arc<Slot<V>>) {
        debug_assert!(self.is_present(), "insert without an overlay");

        if let Some(entries) = &mut self.entries {
            entries.insert(key, slot);
        }
    }

    /// Removes `key` for good. Removing a key that is not there is fine.
    pub(crate) fn remove<Q>(&mut self, key: &Q) -> Option<Arc<Slot<V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.as_mut()?.remove(key)
    }

    /// Builds the overlay from `snapshot` unless it already exists.
    ///
    /// Live slots (and tombstones that a concurrent store revives first) are
    /// shared with the snapshot; tombstones are expunged and left out, so the
    /// next promotion drops them.
    pub(crate) fn rebuild(
        &mut self,
        snapshot: &Snapshot<K, V, S>,
        build_hasher: &S,
        min_capacity: usize,
        guard: &Guard,
    ) -> Rebuild
    where
        K: Clone,
        S: Clone,
    {
        let mut outcome = Rebuild::default();
        if self.entries.is_some() {
            return outcome;
        }

        let source = snapshot.entries();
        let capacity = source.len().max(min_capacity);
        let mut entries = HashMap::with_capacity_and_hasher(capacity, build_hasher.clone());

        for (key, slot) in source {
            if slot.try_expunge_locked(guard) {
                outcome.expunged += 1;
            } else {
                entries.insert(key.clone(), Arc::clone(slot));
                outcome.copied += 1;
            }
        }

        self.entries = Some(entries);
        self.build_count += 1;

        outcome
    }
}
