use std::num::NonZeroUsize;

/// Decides when the overlay is promoted into a new snapshot.
///
/// Every lookup that has to take the lock because a key was missing from the
/// snapshot counts as a miss. Once the policy's threshold is reached, the
/// overlay becomes the new snapshot and the miss counter starts over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PromotionPolicy {
    /// Promote once the number of misses reaches the number of entries in the
    /// overlay. The cost of copying the overlay is then amortized over the
    /// lookups that paid for the lock.
    #[default]
    OverlayLen,

    /// Promote once the given number of misses has been recorded, regardless
    /// of the overlay size.
    AfterMisses(NonZeroUsize),
}

impl PromotionPolicy {
    pub(crate) fn should_promote(self, misses: usize, overlay_len: usize) -> bool {
        match self {
            Self::OverlayLen => misses >= overlay_len,
            Self::AfterMisses(threshold) => misses >= threshold.get(),
        }
    }
}
