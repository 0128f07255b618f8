//! `SnapMap` and the slow paths that take the overlay lock.

pub(crate) mod overlay;
pub(crate) mod slot;
pub(crate) mod snapshot;

#[cfg(test)]
mod tests;

use self::{
    overlay::Overlay,
    slot::{Slot, ValueCell},
    snapshot::{Entries, Snapshot, SnapshotCell},
};
use crate::{builder::Builder, error::CompareError, policy::PromotionPolicy, stats::MapStats};

use std::{
    borrow::Borrow,
    collections::hash_map::RandomState,
    fmt,
    hash::{BuildHasher, Hash},
    mem,
    sync::Arc,
};

use crossbeam_epoch::{Guard, Owned};
use parking_lot::Mutex;

/// A concurrent map whose reads never take a lock.
///
/// `SnapMap` keeps two tiers:
///
/// - an immutable **snapshot** that is read without any locking, and
/// - a mutable **overlay**, guarded by a mutex, that collects keys inserted
///   since the snapshot was published.
///
/// Lookups and updates of keys that are already in the snapshot are lock-free.
/// Inserting a key that the snapshot does not know yet, and looking up such a
/// key, go through the mutex. Every such locked lookup counts as a *miss*; once
/// enough misses have accumulated (by default, as many as there are entries in
/// the overlay) the overlay is promoted to be the new snapshot, after which
/// those keys are lock-free too.
///
/// This makes `SnapMap` a good fit for maps whose key set is mostly stable and
/// that are read much more often than they are extended, such as memoized
/// results, registries and caches of computed artifacts. For write-heavy
/// workloads over a changing key set a sharded or lock-free hash table will do
/// better.
///
/// Deleted entries leave a tombstone in the snapshot that a later store of the
/// same key revives in place. Tombstones are dropped the next time the overlay
/// is built and promoted.
///
/// # Examples
///
/// ```rust
/// use snapmap::SnapMap;
///
/// use std::{sync::Arc, thread};
///
/// let map = Arc::new(SnapMap::new());
///
/// let writers: Vec<_> = (0..4u32)
///     .map(|i| {
///         let map = Arc::clone(&map);
///         thread::spawn(move || map.store(i, format!("value-{i}")))
///     })
///     .collect();
///
/// for writer in writers {
///     writer.join().expect("writer panicked");
/// }
///
/// assert_eq!(map.load(&2), Some("value-2".to_string()));
/// assert_eq!(map.load_and_delete(&2), Some("value-2".to_string()));
/// assert_eq!(map.load(&2), None);
/// ```
///
/// # Memory reclamation
///
/// Values are boxed and swapped in and out of per-key atomic slots. Values that
/// are replaced or deleted are reclaimed with [`crossbeam-epoch`][epoch], so
/// they may be dropped some time after the operation that displaced them
/// returned, and possibly on another thread.
///
/// This is why keys, values and the hasher must be `Send + Sync + 'static`.
/// A value that borrows from the stack is rejected:
///
/// ```compile_fail
/// use snapmap::SnapMap;
///
/// let owner = String::from("borrowed");
/// let map = SnapMap::new();
/// // `&owner` does not live for `'static`.
/// map.store(1, &owner);
/// map.store(1, &owner);
/// ```
///
/// and so is a value that must not be dropped on another thread:
///
/// ```compile_fail
/// use snapmap::SnapMap;
///
/// use std::rc::Rc;
///
/// let map = SnapMap::new();
/// // `Rc<i32>` is not `Send`.
/// map.store(1, Rc::new(1));
/// ```
///
/// [epoch]: https://docs.rs/crossbeam-epoch
pub struct SnapMap<K, V, S = RandomState> {
    snapshot: SnapshotCell<K, V, S>,
    overlay: Mutex<Overlay<K, V, S>>,
    build_hasher: S,
    promotion_policy: PromotionPolicy,
    initial_capacity: usize,
    name: Option<String>,
}

impl<K, V> SnapMap<K, V, RandomState>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates an empty `SnapMap` with the default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Returns a [`Builder`] to configure a `SnapMap`.
    pub fn builder() -> Builder<SnapMap<K, V, RandomState>> {
        Builder::default()
    }
}

impl<K, V, S> SnapMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Creates an empty `SnapMap` that uses `build_hasher` to hash keys.
    pub fn with_hasher(build_hasher: S) -> Self {
        SnapMap::<K, V, RandomState>::builder().build_with_hasher(build_hasher)
    }

    pub(crate) fn with_everything(
        name: Option<String>,
        initial_capacity: Option<usize>,
        promotion_policy: PromotionPolicy,
        build_hasher: S,
    ) -> Self {
        Self {
            snapshot: SnapshotCell::new(Snapshot::empty(build_hasher.clone())),
            overlay: Mutex::new(Overlay::new()),
            build_hasher,
            promotion_policy,
            initial_capacity: initial_capacity.unwrap_or_default(),
            name,
        }
    }

    /// Returns the name of this map, if one was given to the builder.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the policy deciding when the overlay is promoted.
    pub fn promotion_policy(&self) -> PromotionPolicy {
        self.promotion_policy
    }

    /// Returns a reference to the map's [`BuildHasher`].
    pub fn hasher(&self) -> &S {
        &self.build_hasher
    }

    /// Returns a copy of the value associated with `key`.
    ///
    /// The lookup is lock-free if `key` is in the current snapshot, or if the
    /// map has no overlay. Otherwise it takes the lock and counts a miss, which
    /// may promote the overlay.
    ///
    /// `Q` can be any borrowed form of `K`, but [`Hash`] and [`Eq`] on `Q`
    /// *must* match that of `K`. If your `V` does not implement [`Clone`], use
    /// [`load_with`](#method.load_with) instead.
    pub fn load<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.load_with(key, V::clone)
    }

    /// Invokes `with_value` with a reference to the value associated with
    /// `key` and returns its result.
    ///
    /// `with_value` is only invoked if a value is present, and never while the
    /// map's lock is held.
    pub fn load_with<Q, F, T>(&self, key: &Q, with_value: F) -> Option<T>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> T,
    {
        let guard = &crossbeam_epoch::pin();
        let snapshot = self.snapshot.load(guard);

        if let Some(slot) = snapshot.get(key) {
            return slot.load(guard).map(with_value);
        }
        if !snapshot.is_amended() {
            return None;
        }

        let slot = self.lookup_locked(key, Lookup::Read, guard)?;
        slot.load(guard).map(with_value)
    }

    /// Returns `true` if a value is associated with `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.load_with(key, |_| ()).is_some()
    }

    /// Associates `value` with `key`.
    ///
    /// Updating a key that is in the current snapshot is lock-free. Inserting a
    /// new key takes the lock, and the first new key after a promotion also
    /// builds a fresh overlay from the snapshot.
    pub fn store(&self, key: K, value: V) {
        self.swap_with(key, value, |_| ());
    }

    /// Associates `value` with `key` and returns a copy of the previous value.
    pub fn swap(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        self.swap_with(key, value, V::clone)
    }

    /// Associates `value` with `key`, then invokes `with_previous` with the
    /// previously associated value, if there was one.
    pub fn swap_with<F, T>(&self, key: K, value: V, with_previous: F) -> Option<T>
    where
        F: FnOnce(&V) -> T,
    {
        let guard = &crossbeam_epoch::pin();
        let mut value = slot::boxed(value);

        let snapshot = self.snapshot.load(guard);
        if let Some(slot) = snapshot.get(&key) {
            match slot.try_swap(value, guard) {
                Ok(previous) => return previous.map(with_previous),
                // Expunged: the key has to go back into the overlay first.
                Err(rejected) => value = rejected,
            }
        }

        self.swap_locked(key, value, guard).map(with_previous)
    }

    /// Removes the value associated with `key`.
    ///
    /// A key in the snapshot is turned into a tombstone without taking the
    /// lock. A key that only lives in the overlay is removed from it under the
    /// lock, which counts as a miss.
    pub fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.load_and_delete_with(key, |_| ());
    }

    /// Removes the value associated with `key` and returns a copy of it.
    pub fn load_and_delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.load_and_delete_with(key, V::clone)
    }

    /// Removes the value associated with `key`, then invokes `with_previous`
    /// with it.
    pub fn load_and_delete_with<Q, F, T>(&self, key: &Q, with_previous: F) -> Option<T>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> T,
    {
        let guard = &crossbeam_epoch::pin();
        let snapshot = self.snapshot.load(guard);

        if let Some(slot) = snapshot.get(key) {
            return slot.delete(guard).map(with_previous);
        }
        if !snapshot.is_amended() {
            return None;
        }

        let slot = self.lookup_locked(key, Lookup::Remove, guard)?;
        slot.delete(guard).map(with_previous)
    }

    /// Returns a copy of the value associated with `key` and `true` if there is
    /// one. Otherwise stores `value` and returns a copy of it with `false`.
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool)
    where
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        let mut value = slot::boxed(value);

        let snapshot = self.snapshot.load(guard);
        if let Some(slot) = snapshot.get(&key) {
            match slot.try_load_or_store(value, guard) {
                Ok((actual, loaded)) => return (actual.clone(), loaded),
                Err(rejected) => value = rejected,
            }
        }

        let slot;
        let actual;
        let loaded;
        {
            let mut overlay = self.overlay.lock();
            let snapshot = self.snapshot.load(guard);

            let mut overlay_hit = false;
            if let Some(found) = snapshot.get(&key) {
                if found.unexpunge_locked(guard) {
                    overlay.insert(key, Arc::clone(found));
                }
                slot = Arc::clone(found);
            } else if let Some(found) = overlay.get(&key) {
                slot = Arc::clone(found);
                overlay_hit = true;
            } else {
                if !snapshot.is_amended() {
                    self.amend_locked(&mut overlay, snapshot, guard);
                }
                slot = Arc::new(Slot::empty());
                overlay.insert(key, Arc::clone(&slot));
            }

            (actual, loaded) = slot.load_or_store_locked(value, guard);

            if overlay_hit {
                self.miss_locked(&mut overlay, guard);
            }
        }

        (actual.clone(), loaded)
    }

    /// Replaces the value associated with `key` by `new`, but only if it equals
    /// `current`.
    ///
    /// # Errors
    ///
    /// Returns [`CompareError::Absent`] if no value is associated with `key`,
    /// and [`CompareError::Mismatch`] if the associated value differs from
    /// `current`. The map is left unchanged in both cases.
    pub fn compare_and_swap<Q>(&self, key: &Q, current: &V, new: V) -> Result<(), CompareError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let guard = &crossbeam_epoch::pin();
        let new = slot::boxed(new);

        let snapshot = self.snapshot.load(guard);
        if let Some(slot) = snapshot.get(key) {
            return slot.compare_and_swap(current, new, guard);
        }
        if !snapshot.is_amended() {
            return Err(CompareError::Absent);
        }

        let mut overlay = self.overlay.lock();
        let snapshot = self.snapshot.load(guard);

        if let Some(slot) = snapshot.get(key) {
            slot.compare_and_swap(current, new, guard)
        } else if let Some(slot) = overlay.get(key).cloned() {
            let result = slot.compare_and_swap(current, new, guard);
            self.miss_locked(&mut overlay, guard);
            result
        } else {
            Err(CompareError::Absent)
        }
    }

    /// Removes the value associated with `key`, but only if it equals
    /// `current`.
    ///
    /// # Errors
    ///
    /// Returns [`CompareError::Absent`] if no value is associated with `key`,
    /// and [`CompareError::Mismatch`] if the associated value differs from
    /// `current`.
    pub fn compare_and_delete<Q>(&self, key: &Q, current: &V) -> Result<(), CompareError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let guard = &crossbeam_epoch::pin();
        let snapshot = self.snapshot.load(guard);

        if let Some(slot) = snapshot.get(key) {
            return slot.compare_and_delete(current, guard);
        }
        if !snapshot.is_amended() {
            return Err(CompareError::Absent);
        }

        match self.lookup_locked(key, Lookup::Read, guard) {
            Some(slot) => slot.compare_and_delete(current, guard),
            None => Err(CompareError::Absent),
        }
    }

    /// Calls `f` on every entry until it returns `false`.
    ///
    /// If the map has an overlay, it is promoted first so that a single
    /// snapshot can be walked without holding the lock. The walk sees the key
    /// set of that snapshot; values are read one by one and may reflect
    /// concurrent updates. No key is visited twice.
    ///
    /// The calling thread stays pinned to the current epoch for the whole walk,
    /// which delays reclamation of displaced values until `scan` returns.
    pub fn scan<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let guard = &crossbeam_epoch::pin();
        let mut snapshot = self.snapshot.load(guard);

        if snapshot.is_amended() {
            let mut overlay = self.overlay.lock();
            snapshot = self.snapshot.load(guard);

            if snapshot.is_amended() {
                if let Some(entries) = overlay.take_for_promotion() {
                    self.promote_locked(entries, guard);
                }
                snapshot = self.snapshot.load(guard);
            }
        }

        for (key, slot) in snapshot.entries() {
            if let Some(value) = slot.load(guard) {
                if !f(key, value) {
                    break;
                }
            }
        }
    }

    /// Returns `true` if the map holds no values.
    ///
    /// This is a [`scan`](#method.scan), so it takes the lock and promotes the
    /// overlay if the map has one, which shows up in [`stats`](#method.stats).
    pub fn is_empty(&self) -> bool {
        let mut is_empty = true;
        self.scan(|_, _| {
            is_empty = false;
            false
        });
        is_empty
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let guard = &crossbeam_epoch::pin();
        let snapshot = self.snapshot.load(guard);

        if snapshot.entries().is_empty() && !snapshot.is_amended() {
            return;
        }

        let discarded = {
            let mut overlay = self.overlay.lock();
            let snapshot = self.snapshot.load(guard);

            if !snapshot.entries().is_empty() || snapshot.is_amended() {
                self.snapshot
                    .publish(Snapshot::empty(self.build_hasher.clone()), guard);
            }

            #[cfg(feature = "logging")]
            log::trace!("{}Cleared the map", self.log_prefix());

            overlay.clear()
        };

        // Overlay-only slots drop their values here, outside the lock.
        mem::drop(discarded);
    }

    /// Returns statistics about snapshot promotion.
    pub fn stats(&self) -> MapStats {
        let guard = &crossbeam_epoch::pin();
        let overlay = self.overlay.lock();
        let is_amended = self.snapshot.load(guard).is_amended();

        overlay.stats(is_amended)
    }
}

/// What the locked slow path does with a slot found only in the overlay.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Read,
    Remove,
}

impl<K, V, S> SnapMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Slow path of the lookups. Re-reads the snapshot under the lock, because
    /// it may have been replaced since the caller looked, then falls back to
    /// the overlay and records a miss whether or not the key is there.
    fn lookup_locked<Q>(&self, key: &Q, lookup: Lookup, guard: &Guard) -> Option<Arc<Slot<V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut overlay = self.overlay.lock();
        let snapshot = self.snapshot.load(guard);

        if let Some(slot) = snapshot.get(key) {
            return Some(Arc::clone(slot));
        }
        if !snapshot.is_amended() {
            return None;
        }

        let slot = match lookup {
            Lookup::Read => overlay.get(key).cloned(),
            Lookup::Remove => overlay.remove(key),
        };
        self.miss_locked(&mut overlay, guard);

        slot
    }

    /// Slow path of the writes.
    fn swap_locked<'g>(
        &self,
        key: K,
        value: Owned<ValueCell<V>>,
        guard: &'g Guard,
    ) -> Option<&'g V> {
        let mut overlay = self.overlay.lock();
        let snapshot = self.snapshot.load(guard);

        if let Some(slot) = snapshot.get(&key) {
            if slot.unexpunge_locked(guard) {
                // The overlay was built without this slot; put it back so that
                // the next promotion keeps the key.
                overlay.insert(key, Arc::clone(slot));
            }
            slot.swap_locked(value, guard)
        } else if let Some(slot) = overlay.get(&key) {
            slot.swap_locked(value, guard)
        } else {
            if !snapshot.is_amended() {
                self.amend_locked(&mut overlay, snapshot, guard);
            }
            overlay.insert(key, Arc::new(Slot::new(value)));
            None
        }
    }

    /// Builds the overlay from `snapshot` and republishes the snapshot with the
    /// amended flag set, so that readers start consulting the overlay.
    fn amend_locked(
        &self,
        overlay: &mut Overlay<K, V, S>,
        snapshot: &Snapshot<K, V, S>,
        guard: &Guard,
    ) {
        debug_assert!(!snapshot.is_amended());
        debug_assert!(!overlay.is_present());

        let _rebuild = overlay.rebuild(snapshot, &self.build_hasher, self.initial_capacity, guard);

        #[cfg(feature = "logging")]
        log::debug!(
            "{}Built an overlay with {} entries ({} tombstones expunged)",
            self.log_prefix(),
            _rebuild.copied,
            _rebuild.expunged
        );

        self.snapshot.publish(snapshot.amended(), guard);
    }

    fn miss_locked(&self, overlay: &mut Overlay<K, V, S>, guard: &Guard) {
        if let Some(entries) = overlay.record_miss(self.promotion_policy) {
            self.promote_locked(entries, guard);
        }
    }

    fn promote_locked(&self, entries: Entries<K, V, S>, guard: &Guard) {
        #[cfg(feature = "logging")]
        log::debug!(
            "{}Promoted an overlay of {} entries into the snapshot",
            self.log_prefix(),
            entries.len()
        );

        self.snapshot.publish(Snapshot::promoted(entries), guard);
    }

    #[cfg(feature = "logging")]
    fn log_prefix(&self) -> String {
        self.name
            .as_deref()
            .map(|name| format!("[{name}] "))
            .unwrap_or_default()
    }
}

#[cfg(test)]
impl<K, V, S> SnapMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    pub(crate) fn snapshot_ptr(&self) -> *const () {
        let guard = &crossbeam_epoch::pin();
        self.snapshot.load(guard) as *const Snapshot<K, V, S> as *const ()
    }

    pub(crate) fn slot_state<Q>(&self, key: &Q) -> Option<slot::SlotState>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = &crossbeam_epoch::pin();
        self.snapshot
            .load(guard)
            .get(key)
            .map(|slot| slot.state(guard))
    }

    pub(crate) fn overlay_contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.overlay.lock().get(key).is_some()
    }

    pub(crate) fn lookup_slow<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let guard = &crossbeam_epoch::pin();
        let slot = self.lookup_locked(key, Lookup::Read, guard)?;
        slot.load(guard).cloned()
    }
}

impl<K, V, S> Default for SnapMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> FromIterator<(K, V)> for SnapMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = Self::default();
        for (key, value) in iter {
            map.store(key, value);
        }
        map
    }
}

/// Prints the live entries through [`SnapMap::scan`], so formatting a map
/// promotes its overlay like `scan` does.
impl<K, V, S> fmt::Debug for SnapMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static + fmt::Debug,
    V: Send + Sync + 'static + fmt::Debug,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d_map = f.debug_map();

        self.scan(|key, value| {
            d_map.entry(key, value);
            true
        });

        d_map.finish()
    }
}
