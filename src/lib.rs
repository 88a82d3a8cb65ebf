//! A concurrent hash map built from layered prime-sized strata, per-slot
//! packed read/write locks, and a distributed size counter.
//!
//! # Design
//!
//! Most concurrent maps resize by allocating a bigger table and rehashing
//! into it. [`LayeredHashMap`] instead *appends*: the table is a sequence of
//! strata whose cumulative sizes follow a fixed prime table, and growing
//! means allocating the next stratum. A key's hash is masked to the active
//! bit width and reduced modulo the largest prime, which yields a raw index
//! into the virtual concatenation of all strata; a short calculation turns
//! the raw index into a (stratum, slot) pair.
//!
//! Three mechanisms carry the concurrency:
//!
//! - **Per-slot locks.** Each slot owns a single 32-bit atomic word packing
//!   an occupancy flag, a writer bit, and a live-reader count. Acquiring the
//!   lock also answers "is this slot populated?" from the same atomic
//!   operation, and a writer's release publishes the new occupancy in one
//!   store.
//! - **A distributed size counter.** Each thread tallies its inserts and
//!   removes into a private, cache-padded shard; a per-table manager
//!   periodically sums the shards, consults a callback for the next
//!   synchronization target, and spreads the slack back as per-shard
//!   thresholds. [`LayeredHashMap::size`] is still *exact*: it holds a
//!   barrier that shard updates honor, so the sum is taken at a single
//!   linearization point.
//! - **Callback-driven growth.** The counter's callback compares the global
//!   count against the current capacity and appends a stratum when the
//!   table is full, relocating the entries whose position changes under the
//!   widened mask. Readers and writers coordinate with an in-flight growth
//!   through one atomic geometry word.
//!
//! Up to 1024 maps can be live in a process at once; each holds an instance
//! id binding it to a counter manager and to one shard per participating
//! thread. Ids are recycled when maps are dropped.
//!
//! # Hashing
//!
//! Key placement is part of the map's observable behavior, so keys hash
//! through the deterministic [`LayerHash`] trait rather than a randomized
//! [`std::hash::BuildHasher`]: integers hash to themselves, pairs xor their
//! halves, strings use DJB2. See the trait docs for details.
//!
//! # Examples
//!
//! ```
//! use layermap::LayeredHashMap;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let map = Arc::new(LayeredHashMap::new()?);
//!
//! let handles: Vec<_> = (0..4)
//!     .map(|t| {
//!         let map = Arc::clone(&map);
//!         thread::spawn(move || {
//!             for i in 0..100u64 {
//!                 map.write(t * 1_000 + i, i);
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! assert_eq!(map.size(), 400);
//! assert_eq!(map.read(&2_042)?, 42);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Limits
//!
//! There is no iteration, no shrinking, and values come back by clone (the
//! map never hands out references into its slots, so nothing needs deferred
//! reclamation).

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod counter;
mod geometry;
mod hash;
mod lock;
mod map;
mod registry;

pub use hash::LayerHash;
pub use map::{InstancePoolExhausted, KeyNotFound, LayeredHashMap, MissReason};
