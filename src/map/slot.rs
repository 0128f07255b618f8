use std::{
    mem,
    sync::atomic::{self, Ordering},
};

use crossbeam_epoch::{Atomic, CompareExchangeError, Guard, Owned, Shared};

use crate::error::CompareError;

/// Set on a null value pointer once the slot has been expunged.
pub(crate) const EXPUNGED_TAG: usize = 0b1;

/// Heap cell holding one value. The alignment leaves room for the expunged tag.
#[repr(align(2))]
#[derive(Debug)]
pub(crate) struct ValueCell<V> {
    pub(crate) value: V,
}

pub(crate) fn boxed<V>(value: V) -> Owned<ValueCell<V>> {
    Owned::new(ValueCell { value })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotState {
    Live,
    Tombstone,
    Expunged,
}

/// Per-key value holder shared between the snapshot and the overlay.
///
/// The value pointer encodes three states:
///
/// - non-null: `Live`,
/// - null: `Tombstone` (deleted, may be revived in place),
/// - null with [`EXPUNGED_TAG`]: `Expunged` (deleted and left out of the
///   overlay; never revived in place except by [`Slot::unexpunge_locked`]).
///
/// Values displaced from a slot are retired through the caller's epoch guard,
/// so references handed out stay valid for as long as that guard is pinned.
pub(crate) struct Slot<V> {
    value: Atomic<ValueCell<V>>,
}

impl<V> Slot<V> {
    pub(crate) fn new(value: Owned<ValueCell<V>>) -> Self {
        Self {
            value: Atomic::from(value),
        }
    }

    /// Creates a slot in the `Tombstone` state.
    pub(crate) fn empty() -> Self {
        Self {
            value: Atomic::null(),
        }
    }

    pub(crate) fn state(&self, guard: &Guard) -> SlotState {
        state_of(self.value.load(Ordering::Acquire, guard))
    }

    pub(crate) fn load<'g>(&'g self, guard: &'g Guard) -> Option<&'g V> {
        let ptr = self.value.load(Ordering::Acquire, guard);

        unsafe { ptr.as_ref() }.map(|cell| &cell.value)
    }

    /// Replaces the value unless the slot has been expunged, returning the
    /// previous value (if the slot was live).
    ///
    /// On `Err` the new value is handed back and the caller has to take the
    /// locked path.
    pub(crate) fn try_swap<'g>(
        &self,
        mut new: Owned<ValueCell<V>>,
        guard: &'g Guard,
    ) -> Result<Option<&'g V>, Owned<ValueCell<V>>>
    where
        V: Send + 'static,
    {
        let mut current = self.value.load(Ordering::Acquire, guard);

        loop {
            if is_expunged(current) {
                return Err(new);
            }

            match self.value.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return Ok(unsafe { retire(guard, current) }),
                Err(CompareExchangeError {
                    current: actual,
                    new: rejected,
                }) => {
                    current = actual;
                    new = rejected;
                }
            }
        }
    }

    /// Unconditionally replaces the value. Must only be called while holding
    /// the overlay lock, on a slot known not to be expunged.
    pub(crate) fn swap_locked<'g>(
        &self,
        new: Owned<ValueCell<V>>,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        V: Send + 'static,
    {
        let previous = self.value.swap(new, Ordering::AcqRel, guard);
        debug_assert!(!is_expunged(previous), "stored into an expunged slot");

        unsafe { retire(guard, previous) }
    }

    /// Turns a live slot into a tombstone and returns the removed value.
    pub(crate) fn delete<'g>(&self, guard: &'g Guard) -> Option<&'g V>
    where
        V: Send + 'static,
    {
        let mut current = self.value.load(Ordering::Acquire, guard);

        loop {
            if current.is_null() {
                // Tombstone or expunged.
                return None;
            }

            match self.value.compare_exchange_weak(
                current,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return unsafe { retire(guard, current) },
                Err(e) => current = e.current,
            }
        }
    }

    /// Marks a tombstone as expunged. Returns `true` if the slot is expunged
    /// afterwards, `false` if it holds a live value and must be kept.
    ///
    /// Only called while rebuilding the overlay under the lock.
    pub(crate) fn try_expunge_locked(&self, guard: &Guard) -> bool {
        let mut current = self.value.load(Ordering::Acquire, guard);
        debug_assert!(
            !is_expunged(current),
            "overlay rebuild found an already expunged slot"
        );

        loop {
            if !current.is_null() {
                return false;
            }
            if is_expunged(current) {
                return true;
            }

            match self.value.compare_exchange(
                current,
                Shared::null().with_tag(EXPUNGED_TAG),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return true,
                Err(e) => current = e.current,
            }
        }
    }

    /// Turns an expunged slot back into a tombstone. Returns `true` if the slot
    /// was expunged, in which case the caller must put it back into the overlay
    /// before releasing the lock.
    pub(crate) fn unexpunge_locked(&self, guard: &Guard) -> bool {
        self.value
            .compare_exchange(
                Shared::null().with_tag(EXPUNGED_TAG),
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
    }

    /// Returns the live value with `true`, or stores `new` into a tombstone and
    /// returns it with `false`. Hands `new` back if the slot is expunged.
    pub(crate) fn try_load_or_store<'g>(
        &'g self,
        mut new: Owned<ValueCell<V>>,
        guard: &'g Guard,
    ) -> Result<(&'g V, bool), Owned<ValueCell<V>>> {
        let mut current = self.value.load(Ordering::Acquire, guard);

        loop {
            if let Some(cell) = unsafe { current.as_ref() } {
                return Ok((&cell.value, true));
            }
            if is_expunged(current) {
                return Err(new);
            }

            match self.value.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(stored) => {
                    let cell = unsafe { stored.deref() };
                    return Ok((&cell.value, false));
                }
                Err(CompareExchangeError {
                    current: actual,
                    new: rejected,
                }) => {
                    current = actual;
                    new = rejected;
                }
            }
        }
    }

    /// Same as [`Slot::try_load_or_store`], for a slot that cannot be expunged
    /// because the caller holds the overlay lock and has already unexpunged it
    /// (or found it in the overlay).
    pub(crate) fn load_or_store_locked<'g>(
        &'g self,
        mut new: Owned<ValueCell<V>>,
        guard: &'g Guard,
    ) -> (&'g V, bool) {
        let mut current = self.value.load(Ordering::Acquire, guard);
        debug_assert!(
            !is_expunged(current),
            "load_or_store_locked on an expunged slot"
        );

        loop {
            if let Some(cell) = unsafe { current.as_ref() } {
                return (&cell.value, true);
            }

            match self.value.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(stored) => {
                    let cell = unsafe { stored.deref() };
                    return (&cell.value, false);
                }
                Err(CompareExchangeError {
                    current: actual,
                    new: rejected,
                }) => {
                    current = actual;
                    new = rejected;
                }
            }
        }
    }

    pub(crate) fn compare_and_swap(
        &self,
        expected: &V,
        mut new: Owned<ValueCell<V>>,
        guard: &Guard,
    ) -> Result<(), CompareError>
    where
        V: PartialEq + Send + 'static,
    {
        let mut current = self.value.load(Ordering::Acquire, guard);

        loop {
            let Some(cell) = (unsafe { current.as_ref() }) else {
                return Err(CompareError::Absent);
            };
            if cell.value != *expected {
                return Err(CompareError::Mismatch);
            }

            match self.value.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    unsafe { retire(guard, current) };
                    return Ok(());
                }
                Err(CompareExchangeError {
                    current: actual,
                    new: rejected,
                }) => {
                    current = actual;
                    new = rejected;
                }
            }
        }
    }

    pub(crate) fn compare_and_delete(&self, expected: &V, guard: &Guard) -> Result<(), CompareError>
    where
        V: PartialEq + Send + 'static,
    {
        let mut current = self.value.load(Ordering::Acquire, guard);

        loop {
            let Some(cell) = (unsafe { current.as_ref() }) else {
                return Err(CompareError::Absent);
            };
            if cell.value != *expected {
                return Err(CompareError::Mismatch);
            }

            match self.value.compare_exchange_weak(
                current,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    unsafe { retire(guard, current) };
                    return Ok(());
                }
                Err(e) => current = e.current,
            }
        }
    }
}

impl<V> Drop for Slot<V> {
    fn drop(&mut self) {
        // Nobody else can reach this slot anymore, so the value can go now.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let ptr = self.value.swap(Shared::null(), Ordering::Relaxed, guard);

        if !ptr.is_null() {
            atomic::fence(Ordering::Acquire);
            mem::drop(unsafe { ptr.into_owned() });
        }
    }
}

#[inline]
fn is_expunged<V>(ptr: Shared<'_, ValueCell<V>>) -> bool {
    ptr.tag() & EXPUNGED_TAG != 0
}

#[inline]
fn state_of<V>(ptr: Shared<'_, ValueCell<V>>) -> SlotState {
    if !ptr.is_null() {
        SlotState::Live
    } else if is_expunged(ptr) {
        SlotState::Expunged
    } else {
        SlotState::Tombstone
    }
}

/// Defers destruction of a value that has just been unlinked from a slot and
/// returns a reference that stays valid while `guard` is pinned.
///
/// The destructor may run on any thread once the epoch advances, hence the
/// `Send + 'static` bound.
unsafe fn retire<'g, V>(guard: &'g Guard, ptr: Shared<'g, ValueCell<V>>) -> Option<&'g V>
where
    V: Send + 'static,
{
    let cell = ptr.as_ref()?;

    guard.defer_unchecked(move || {
        atomic::fence(Ordering::Acquire);
        mem::drop(ptr.into_owned());
    });

    Some(&cell.value)
}
