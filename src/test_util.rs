use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crossbeam_epoch::Owned;

/// Counts how many [`Tracked`] values sharing it have been dropped.
#[derive(Debug, Default)]
pub(crate) struct DropCounter {
    dropped: AtomicUsize,
}

impl DropCounter {
    pub(crate) fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Acquire)
    }
}

/// A value that reports its own destruction to a [`DropCounter`].
#[derive(Debug)]
pub(crate) struct Tracked<T> {
    counter: Arc<DropCounter>,
    pub(crate) value: T,
}

impl<T> Tracked<T> {
    pub(crate) fn new(counter: &Arc<DropCounter>, value: T) -> Self {
        Self {
            counter: Arc::clone(counter),
            value,
        }
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.counter.dropped.fetch_add(1, Ordering::AcqRel);
    }
}

impl<T: PartialEq> PartialEq for Tracked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

/// Pushes enough garbage through the epoch collector that everything deferred
/// by the current thread has been destroyed.
pub(crate) fn run_deferred() {
    for _ in 0..65536 {
        let guard = crossbeam_epoch::pin();

        unsafe { guard.defer_destroy(Owned::new(0).into_shared(&guard)) };

        guard.flush();
    }
}
