#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! A read-optimized concurrent map.
//!
//! [`SnapMap`] serves lookups from an immutable snapshot that is read without
//! taking any lock. Keys inserted since the snapshot was published live in a
//! mutex-guarded overlay, and the overlay is promoted to be the next snapshot
//! once lookups that had to take the lock have paid for the copy.
//!
//! The map suits workloads that read a mostly stable set of keys over and over
//! again, such as memoized results or registries. It is not a good fit for
//! workloads that keep inserting new keys.
//!
//! # Example
//!
//! ```rust
//! use snapmap::SnapMap;
//!
//! let map = SnapMap::new();
//!
//! map.store("alice", 1);
//! map.store("bob", 2);
//! assert_eq!(map.load("alice"), Some(1));
//!
//! // Updates of existing keys are lock-free.
//! assert_eq!(map.swap("alice", 10), Some(1));
//!
//! assert_eq!(map.load_or_store("carol", 3), (3, false));
//! assert_eq!(map.load_or_store("carol", 30), (3, true));
//!
//! map.delete("bob");
//! assert!(!map.contains_key("bob"));
//!
//! let mut keys = Vec::new();
//! map.scan(|key, _| {
//!     keys.push(*key);
//!     true
//! });
//! keys.sort_unstable();
//! assert_eq!(keys, ["alice", "carol"]);
//! ```
//!
//! # Logging
//!
//! Enable the `logging` feature to have maps emit [`log`][log-crate] records
//! when the overlay is built or promoted.
//!
//! [log-crate]: https://docs.rs/log

mod builder;
mod error;
mod map;
mod policy;
pub mod stats;

#[cfg(test)]
mod test_util;

pub use builder::Builder;
pub use error::CompareError;
pub use map::SnapMap;
pub use policy::PromotionPolicy;
pub use stats::MapStats;
