//! A concurrent hash table with per-bin locks and cooperative, incremental resizing.
//!
//! [`HashMap`] supports fully concurrent retrievals and high expected concurrency for updates.
//! Retrievals never block. They reflect the results of the most recently *completed* updates
//! holding upon their onset. An update to a key happens-before any subsequent retrieval of that
//! key that reports the updated value.
//!
//! # Design
//!
//! The map is an array of bins, each holding a singly linked chain of entries. Each bin is
//! locked independently, by flipping a status bit in the control word of its first entry, so
//! updates to different bins proceed in parallel. A thread that finds a bin locked spins for a
//! short, randomized while and then parks until the lock holder wakes it up.
//!
//! The table doubles in size when it becomes three quarters full. All threads that run into a
//! resize help carry it out: they claim strides of bins from the top of the table, move each
//! bin into the new table, and leave a forwarding marker behind. Bins whose lock is held are
//! set aside and revisited once the rest of the stride is done. Lookups that run into a
//! forwarding marker continue in the new table, so they never wait for a resize.
//!
//! The number of entries is kept in a striped counter, so that concurrent insertions and
//! removals do not all contend on one memory location. As a consequence [`HashMap::len`] only
//! reflects some recent state of the map while it is being modified.
//!
//! # Atomic updates
//!
//! Beyond `get`, `insert` and `remove`, the map offers updates that read and write a single
//! key atomically: [`HashMap::try_insert`], [`HashMap::compute_if_absent`],
//! [`HashMap::compute_if_present`], [`HashMap::compute`], [`HashMap::merge`],
//! [`HashMap::replace`], [`HashMap::replace_if_exists`] and [`HashMap::remove_pair`]. The
//! closures they take run while the key's bin is locked, so they should be short, and must not
//! access the map themselves.
//!
//! ```
//! use stripemap::HashMap;
//!
//! let words = HashMap::new();
//! let words = words.pin();
//! for word in "the quick brown fox jumps over the lazy dog".split(' ') {
//!     words.merge(word, 1, |count, one| Some(count + one));
//! }
//! assert_eq!(words.get("the"), Some(&2));
//! assert_eq!(words.get("fox"), Some(&1));
//! ```
//!
//! # A note on `Guard` and memory use
//!
//! You may have noticed that many of the access methods on this map take a reference to a
//! [`Guard`]. The exact details of this are beyond the scope of this documentation (for
//! that, see the [`seize`] crate), but some of the implications bear repeating here.
//!
//! Memory that is no longer reachable through the map (old values, unlinked entries and
//! resized-away tables) is only freed once no thread can still be looking at it. Every
//! reference handed out by the map is tied to the lifetime of the guard it was obtained
//! under, and whatever a guard can observe stays allocated for as long as the guard lives.
//!
//! A guard is obtained with [`HashMap::guard`], or implicitly through [`HashMap::pin`], which
//! returns a [`HashMapRef`] that carries its own guard:
//!
//! ```
//! use stripemap::HashMap;
//!
//! let map = HashMap::new();
//! {
//!     let guard = map.guard();
//!     map.insert(1, "one", &guard);
//!     assert_eq!(map.get(&1, &guard), Some(&"one"));
//! }
//! let pinned = map.pin();
//! assert_eq!(pinned.get(&1), Some(&"one"));
//! ```
//!
//! Holding on to a guard for a long time keeps garbage from being freed, so pin for the
//! duration of an operation or batch of operations, not for the lifetime of a thread.
//! Guards are tied to the map that created them: passing a guard from another map is caught
//! and turned into a panic, since it would not protect anything.
//!
//! # Consistency
//!
//! Aggregate status methods like [`HashMap::len`] and [`HashMap::is_empty`] are typically
//! useful only when a map is not undergoing concurrent updates in other threads. Otherwise
//! the results of these methods reflect transient states that may be adequate for monitoring
//! or estimation purposes, but not for program control.
//!
//! Similarly, iterators, [`HashMap::for_each`] and [`HashMap::clear`] are weakly consistent:
//! they reflect the state of the map at some point at or since their creation, and never
//! fail because of concurrent modification. An iterator returns every entry that stays in the
//! map for its whole lifetime exactly once, and entries added or removed in the meantime at
//! most once.
//!
//! # Hashing
//!
//! Keys are hashed with a randomly seeded [`ahash`] hasher by default, which makes it hard
//! for an adversary to force many keys into one bin. Chains are never turned into trees, so a
//! weak hasher degrades lookups in crowded bins to a linear scan.
//!
//! # Features
//!
//! - `rayon`: implements `FromParallelIterator` and `ParallelExtend` for the map.
//! - `tracing`: emits events when a resize starts and completes, and when threads defer,
//!   or park on, locked bins.
#![deny(
    missing_docs,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]
#![warn(rust_2018_idioms)]
#![allow(clippy::cognitive_complexity)]

mod counter;
mod map;
mod map_ref;
mod node;
mod raw;
mod reclaim;
mod xorshift;

#[cfg(feature = "rayon")]
mod rayon_impls;

/// Iterator types.
pub mod iter;

pub use map::{HashMap, TryInsertError, TryReserveError};
pub use map_ref::HashMapRef;

/// Default hasher for [`HashMap`].
pub type DefaultHashBuilder = ahash::RandomState;

/// Types needed to safely access shared data concurrently.
pub use seize::Guard;
