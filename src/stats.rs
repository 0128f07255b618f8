//! Statistics about the internal state of a [`SnapMap`][map-struct].
//!
//! [map-struct]: ../struct.SnapMap.html

/// A point-in-time view of the promotion machinery of a map.
///
/// The numbers are read while holding the map's lock, so they are consistent
/// with each other. They are diagnostic only and never influence the map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapStats {
    pub(crate) promotion_count: u64,
    pub(crate) overlay_build_count: u64,
    pub(crate) locked_lookup_count: u64,
    pub(crate) pending_misses: usize,
    pub(crate) overlay_len: usize,
    pub(crate) is_amended: bool,
}

impl MapStats {
    /// How many times the overlay has been promoted into a new snapshot.
    pub fn promotion_count(&self) -> u64 {
        self.promotion_count
    }

    /// How many times an overlay has been built from the snapshot to make room
    /// for a new key.
    pub fn overlay_build_count(&self) -> u64 {
        self.overlay_build_count
    }

    /// How many lookups missed the snapshot and fell back to the overlay under
    /// the lock. Each of them counted towards a promotion.
    pub fn locked_lookup_count(&self) -> u64 {
        self.locked_lookup_count
    }

    /// Misses recorded since the last promotion.
    pub fn pending_misses(&self) -> usize {
        self.pending_misses
    }

    /// Number of entries in the overlay, including ones that only exist there.
    /// Zero when the map has no overlay.
    pub fn overlay_len(&self) -> usize {
        self.overlay_len
    }

    /// Whether the overlay currently holds keys missing from the snapshot.
    pub fn is_amended(&self) -> bool {
        self.is_amended
    }
}
