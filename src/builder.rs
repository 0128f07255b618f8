use crate::{policy::PromotionPolicy, SnapMap};

use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    marker::PhantomData,
};

/// Builds a [`SnapMap`][map-struct] with various configuration knobs.
///
/// [map-struct]: ./struct.SnapMap.html
///
/// # Examples
///
/// ```rust
/// use snapmap::{PromotionPolicy, SnapMap};
///
/// use std::num::NonZeroUsize;
///
/// let map = SnapMap::builder()
///     // Used as a prefix of the log messages.
///     .name("sessions")
///     // Room for this many keys when an overlay is built.
///     .initial_capacity(1_000)
///     // Promote the overlay after every 64 locked lookups.
///     .promotion_policy(PromotionPolicy::AfterMisses(NonZeroUsize::new(64).unwrap()))
///     .build();
///
/// map.store(7, "seven");
/// assert_eq!(map.load(&7), Some("seven"));
/// assert_eq!(map.name(), Some("sessions"));
/// ```
///
#[must_use]
pub struct Builder<M> {
    name: Option<String>,
    initial_capacity: Option<usize>,
    promotion_policy: PromotionPolicy,
    map_type: PhantomData<M>,
}

impl<M> Default for Builder<M> {
    fn default() -> Self {
        Self {
            name: None,
            initial_capacity: None,
            promotion_policy: PromotionPolicy::default(),
            map_type: PhantomData,
        }
    }
}

impl<K, V> Builder<SnapMap<K, V, RandomState>>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Builds a `SnapMap<K, V>`.
    pub fn build(self) -> SnapMap<K, V, RandomState> {
        self.build_with_hasher(RandomState::default())
    }

    /// Builds a `SnapMap<K, V, S>` that hashes keys with `hasher`.
    pub fn build_with_hasher<S>(self, hasher: S) -> SnapMap<K, V, S>
    where
        S: BuildHasher + Clone + Send + Sync + 'static,
    {
        SnapMap::with_everything(
            self.name,
            self.initial_capacity,
            self.promotion_policy,
            hasher,
        )
    }
}

impl<M> Builder<M> {
    /// Sets the name of the map. The name shows up in log messages.
    pub fn name(self, name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..self
        }
    }

    /// Sets the capacity reserved for the overlay each time it is built from
    /// the snapshot.
    pub fn initial_capacity(self, capacity: usize) -> Self {
        Self {
            initial_capacity: Some(capacity),
            ..self
        }
    }

    /// Sets the policy deciding when the overlay is promoted into a new
    /// snapshot. Defaults to [`PromotionPolicy::OverlayLen`].
    pub fn promotion_policy(self, policy: PromotionPolicy) -> Self {
        Self {
            promotion_policy: policy,
            ..self
        }
    }
}
