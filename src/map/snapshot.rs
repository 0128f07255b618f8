use super::slot::Slot;

use std::{
    borrow::Borrow,
    collections::HashMap,
    hash::{BuildHasher, Hash},
    mem,
    sync::{
        atomic::{self, Ordering},
        Arc,
    },
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

pub(crate) type Entries<K, V, S> = HashMap<K, Arc<Slot<V>>, S>;

/// Immutable read view of the map.
///
/// `amended` is set while the overlay holds keys that are missing here. The
/// entry table is shared with the snapshot it was amended from, so flipping
/// the flag never copies the table.
pub(crate) struct Snapshot<K, V, S> {
    entries: Arc<Entries<K, V, S>>,
    amended: bool,
}

impl<K, V, S> Snapshot<K, V, S> {
    pub(crate) fn empty(build_hasher: S) -> Self {
        Self::promoted(HashMap::with_hasher(build_hasher))
    }

    /// A snapshot made of a promoted overlay.
    pub(crate) fn promoted(entries: Entries<K, V, S>) -> Self {
        Self {
            entries: Arc::new(entries),
            amended: false,
        }
    }

    /// Same entries, with the amended flag set.
    pub(crate) fn amended(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            amended: true,
        }
    }

    pub(crate) fn is_amended(&self) -> bool {
        self.amended
    }

    /// All slots, including tombstones and expunged ones.
    pub(crate) fn entries(&self) -> &Entries<K, V, S> {
        &self.entries
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> Snapshot<K, V, S> {
    pub(crate) fn get<Q>(&self, key: &Q) -> Option<&Arc<Slot<V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key)
    }
}

/// Holds the current snapshot. Readers load it with acquire ordering; writers
/// replace it while holding the overlay lock.
pub(crate) struct SnapshotCell<K, V, S> {
    current: CachePadded<Atomic<Snapshot<K, V, S>>>,
}

impl<K, V, S> SnapshotCell<K, V, S> {
    pub(crate) fn new(snapshot: Snapshot<K, V, S>) -> Self {
        Self {
            current: CachePadded::new(Atomic::new(snapshot)),
        }
    }

    pub(crate) fn load<'g>(&self, guard: &'g Guard) -> &'g Snapshot<K, V, S> {
        let ptr = self.current.load(Ordering::Acquire, guard);
        debug_assert!(!ptr.is_null());

        // The pointer is only ever null while the cell is being dropped.
        unsafe { ptr.deref() }
    }

    /// Publishes `snapshot` and retires the previous one. Callers must hold the
    /// overlay lock.
    ///
    /// The retired snapshot may be dropped on another thread.
    pub(crate) fn publish(&self, snapshot: Snapshot<K, V, S>, guard: &Guard)
    where
        Snapshot<K, V, S>: Send + 'static,
    {
        let previous = self
            .current
            .swap(Owned::new(snapshot), Ordering::AcqRel, guard);

        if !previous.is_null() {
            unsafe {
                guard.defer_unchecked(move || {
                    atomic::fence(Ordering::Acquire);
                    mem::drop(previous.into_owned());
                })
            };
        }
    }
}

impl<K, V, S> Drop for SnapshotCell<K, V, S> {
    fn drop(&mut self) {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let ptr = self.current.swap(Shared::null(), Ordering::Relaxed, guard);

        if !ptr.is_null() {
            atomic::fence(Ordering::Acquire);
            mem::drop(unsafe { ptr.into_owned() });
        }
    }
}
