//! The layered concurrent hash map.
//!
//! The table is a short sequence of *strata*: independently allocated slot
//! arrays whose cumulative sizes walk the prime table in
//! [`geometry`](crate::geometry). A key's hash is reduced to a raw index in
//! `0..PRIMES[last_layer]` and the raw index picks one slot; the slot's
//! packed lock word arbitrates readers and writers and carries the slot's
//! occupancy. There is no global lock on the read/write path; the only
//! table-wide shared words are the `geometry` word (read-mostly) and the
//! distributed size counter (thread-local in the common case).
//!
//! # Growth
//!
//! When the size counter's callback observes a global count above the
//! current capacity, it appends one stratum and *sweeps*: every entry whose
//! raw index changes under the widened hash mask is relocated, under both
//! the source and destination slot locks, so a key is findable in exactly
//! one slot at every instant. Growth is serialized by the counter manager's
//! lock; concurrent readers and writers coordinate with the sweep purely
//! through the packed `geometry` word; see the comments on
//! [`RawTable::grow`].

use std::cell::UnsafeCell;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::geometry::{self, MAX_LAYERS, PRIMES};
use crate::lock::SlotLock;
use crate::registry::{self, InstanceId};
use crate::LayerHash;

/// Why a lookup came back empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissReason {
    /// The slot the key hashes to holds no entries at all.
    SlotEmpty,
    /// The slot is populated, but no entry in it carries the key.
    NotInSlot,
}

/// The error type for [`LayeredHashMap::read`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyNotFound {
    /// Whether the miss was an empty slot or an unmatched key.
    pub reason: MissReason,
}

impl Display for KeyNotFound {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.reason {
            MissReason::SlotEmpty => write!(f, "key not found: its slot is not populated"),
            MissReason::NotInSlot => write!(f, "key not found in its slot"),
        }
    }
}

impl Error for KeyNotFound {}

/// The error type for [`LayeredHashMap::new`]: every instance id is bound
/// to a live table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstancePoolExhausted(pub(crate) ());

impl Display for InstancePoolExhausted {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot create table: all {} instance ids are in use",
            registry::MAX_INSTANCES
        )
    }
}

impl Error for InstancePoolExhausted {}

/// Sweep-in-progress flag, packed into bit 0 of the geometry word next to
/// the last-layer index. One word, so no operation can observe a torn
/// (layer, flag) pair.
const GROWING: usize = 1;

/// One hash bucket: the earliest-surviving entry inline, later colliding
/// entries in a vector.
struct Bucket<K, V> {
    main: Option<(K, V)>,
    collisions: Vec<(K, V)>,
}

impl<K: Eq, V> Bucket<K, V> {
    const fn new() -> Self {
        Self {
            main: None,
            collisions: Vec::new(),
        }
    }

    fn get(&self, key: &K) -> Option<&V> {
        match &self.main {
            Some((k, v)) if k == key => Some(v),
            Some(_) => self
                .collisions
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v),
            None => None,
        }
    }

    fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if matches!(&self.main, Some((k, _)) if k == key) {
            return self.main.as_mut().map(|(_, v)| v);
        }
        self.collisions
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Inserts or overwrites. Returns whether a new entry was created.
    fn put(&mut self, key: K, value: V) -> bool {
        if let Some((k, v)) = &mut self.main {
            if *k == key {
                *v = value;
                return false;
            }
            if let Some((_, v)) = self.collisions.iter_mut().find(|(k, _)| *k == key) {
                *v = value;
                return false;
            }
            self.collisions.push((key, value));
            true
        } else {
            self.main = Some((key, value));
            true
        }
    }

    /// Removes the entry for `key` if present. The last collision backfills
    /// a removed main entry so the main pair always holds the
    /// earliest-inserted survivor's slot.
    fn remove(&mut self, key: &K) -> bool {
        if matches!(&self.main, Some((k, _)) if k == key) {
            self.main = self.collisions.pop();
            return true;
        }
        if self.main.is_none() {
            return false;
        }
        if let Some(at) = self.collisions.iter().position(|(k, _)| k == key) {
            self.collisions.swap_remove(at);
            true
        } else {
            false
        }
    }

    fn is_occupied(&self) -> bool {
        self.main.is_some()
    }
}

/// One table slot: the packed lock word plus the bucket it guards.
struct Slot<K, V> {
    lock: SlotLock,
    bucket: UnsafeCell<Bucket<K, V>>,
}

impl<K: Eq, V> Slot<K, V> {
    fn new() -> Self {
        Self {
            lock: SlotLock::new(),
            bucket: UnsafeCell::new(Bucket::new()),
        }
    }
}

// safety: the bucket is only read under the slot's read lock and only
// mutated under its write lock, so sharing a slot is as safe as sending
// its contents between the threads that take the lock.
unsafe impl<K: Send, V: Send> Send for Slot<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Slot<K, V> {}

/// The shared table state: the geometry word and the published strata.
struct RawTable<K, V> {
    /// `last_layer << 1 | GROWING`.
    geometry: AtomicUsize,
    /// Stratum `i` is null until published; once published it is immutable
    /// in shape and lives until the table is dropped.
    strata: [AtomicPtr<Slot<K, V>>; MAX_LAYERS],
    /// Index into the process-wide manager and shard arrays.
    instance: usize,
    marker: PhantomData<Box<[Slot<K, V>]>>,
}

impl<K, V> RawTable<K, V>
where
    K: LayerHash + Eq,
{
    fn with_first_stratum(instance: usize) -> Self {
        let table = Self {
            geometry: AtomicUsize::new(0),
            strata: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            instance,
            marker: PhantomData,
        };
        table.strata[0].store(Self::alloc_stratum(0), Ordering::Release);
        table
    }

    fn alloc_stratum(layer: usize) -> *mut Slot<K, V> {
        let slots: Box<[Slot<K, V>]> = (0..geometry::layer_len(layer)).map(|_| Slot::new()).collect();
        Box::into_raw(slots) as *mut Slot<K, V>
    }

    fn last_layer(&self) -> usize {
        self.geometry.load(Ordering::Acquire) >> 1
    }

    fn capacity(&self) -> usize {
        PRIMES[self.last_layer()]
    }

    fn stratum(&self, layer: usize) -> &[Slot<K, V>] {
        let ptr = self.strata[layer].load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        // safety: a stratum is published before the geometry word routes any
        // operation to it, and is only freed by drop, which takes &mut self.
        unsafe { std::slice::from_raw_parts(ptr, geometry::layer_len(layer)) }
    }

    fn slot(&self, pos: (usize, usize)) -> &Slot<K, V> {
        &self.stratum(pos.0)[pos.1]
    }

    fn increment(&self) {
        registry::with_shard(self.instance, |shard| shard.increment());
    }

    fn decrement(&self) {
        registry::with_shard(self.instance, |shard| shard.decrement());
    }

    /// Looks up `key` under the slot's read lock and clones the value out.
    ///
    /// A miss is only final if the geometry word did not move during the
    /// probe: a concurrent growth step may have relocated the key between
    /// the position computation and the slot access.
    fn read(&self, key: &K) -> Result<V, KeyNotFound>
    where
        V: Clone,
    {
        let hash = key.layer_hash();
        let mut g = self.geometry.load(Ordering::Acquire);
        loop {
            let last = g >> 1;
            let miss = if g & GROWING == 0 {
                let pos = geometry::locate(geometry::raw_hash(hash, last));
                match self.probe(pos, key) {
                    Ok(value) => return Ok(value),
                    Err(reason) => reason,
                }
            } else {
                // The sweep moves entries from their pre-growth slot to
                // their post-growth slot, never back. Probing in the same
                // order cannot miss a key that is present throughout.
                let old_pos = geometry::locate(geometry::raw_hash(hash, last - 1));
                let new_pos = geometry::locate(geometry::raw_hash(hash, last));
                if old_pos != new_pos {
                    if let Ok(value) = self.probe(old_pos, key) {
                        return Ok(value);
                    }
                }
                match self.probe(new_pos, key) {
                    Ok(value) => return Ok(value),
                    Err(reason) => reason,
                }
            };
            let now = self.geometry.load(Ordering::Acquire);
            if now == g {
                return Err(KeyNotFound { reason: miss });
            }
            g = now;
        }
    }

    fn probe(&self, pos: (usize, usize), key: &K) -> Result<V, MissReason>
    where
        V: Clone,
    {
        let slot = self.slot(pos);
        let guard = slot.lock.read();
        if !guard.occupied() {
            return Err(MissReason::SlotEmpty);
        }
        // safety: the read guard holds off writers for its lifetime.
        let bucket = unsafe { &*slot.bucket.get() };
        bucket.get(key).cloned().ok_or(MissReason::NotInSlot)
    }

    /// Inserts or overwrites `key`.
    ///
    /// The geometry word is re-checked after the slot lock is acquired: if a
    /// growth step completed in between, the canonical slot may have moved
    /// and the write retries. Once the lock is held under an unchanged
    /// word, any later sweep is ordered after this write by the slot lock
    /// itself and will migrate whatever it commits.
    fn write(&self, key: K, value: V) {
        let hash = key.layer_hash();
        let mut g = self.geometry.load(Ordering::Acquire);
        loop {
            let last = g >> 1;
            if g & GROWING == 0 {
                let pos = geometry::locate(geometry::raw_hash(hash, last));
                let slot = self.slot(pos);
                let mut guard = slot.lock.write();
                let now = self.geometry.load(Ordering::Acquire);
                if now != g {
                    drop(guard);
                    g = now;
                    continue;
                }
                // safety: the write guard is exclusive.
                let bucket = unsafe { &mut *slot.bucket.get() };
                debug_assert_eq!(guard.occupied, bucket.is_occupied());
                let inserted = bucket.put(key, value);
                guard.occupied = true;
                drop(guard);
                if inserted {
                    self.increment();
                }
                return;
            }

            // Mid-sweep: the key may still live in its pre-growth slot.
            // Update it there if so; otherwise fall through to the
            // post-growth slot, which is where fresh inserts belong.
            let old_pos = geometry::locate(geometry::raw_hash(hash, last - 1));
            let new_pos = geometry::locate(geometry::raw_hash(hash, last));
            if old_pos != new_pos {
                let slot = self.slot(old_pos);
                let mut guard = slot.lock.write();
                let now = self.geometry.load(Ordering::Acquire);
                if now != g {
                    drop(guard);
                    g = now;
                    continue;
                }
                if guard.occupied {
                    // safety: the write guard is exclusive.
                    let bucket = unsafe { &mut *slot.bucket.get() };
                    if let Some(v) = bucket.get_mut(&key) {
                        *v = value;
                        return;
                    }
                }
                drop(guard);
            }
            let slot = self.slot(new_pos);
            let mut guard = slot.lock.write();
            let now = self.geometry.load(Ordering::Acquire);
            if now != g {
                drop(guard);
                g = now;
                continue;
            }
            // safety: the write guard is exclusive.
            let bucket = unsafe { &mut *slot.bucket.get() };
            debug_assert_eq!(guard.occupied, bucket.is_occupied());
            let inserted = bucket.put(key, value);
            guard.occupied = true;
            drop(guard);
            if inserted {
                self.increment();
            }
            return;
        }
    }

    /// Removes `key`, reporting whether a live entry was deleted. Same
    /// geometry discipline as [`RawTable::write`].
    fn delete(&self, key: &K) -> bool {
        let hash = key.layer_hash();
        let mut g = self.geometry.load(Ordering::Acquire);
        loop {
            let last = g >> 1;
            if g & GROWING == 0 {
                let pos = geometry::locate(geometry::raw_hash(hash, last));
                let slot = self.slot(pos);
                let mut guard = slot.lock.write();
                let now = self.geometry.load(Ordering::Acquire);
                if now != g {
                    drop(guard);
                    g = now;
                    continue;
                }
                // safety: the write guard is exclusive.
                let bucket = unsafe { &mut *slot.bucket.get() };
                let removed = bucket.remove(key);
                guard.occupied = bucket.is_occupied();
                drop(guard);
                if removed {
                    self.decrement();
                }
                return removed;
            }

            let old_pos = geometry::locate(geometry::raw_hash(hash, last - 1));
            let new_pos = geometry::locate(geometry::raw_hash(hash, last));
            if old_pos != new_pos {
                let slot = self.slot(old_pos);
                let mut guard = slot.lock.write();
                let now = self.geometry.load(Ordering::Acquire);
                if now != g {
                    drop(guard);
                    g = now;
                    continue;
                }
                if guard.occupied {
                    // safety: the write guard is exclusive.
                    let bucket = unsafe { &mut *slot.bucket.get() };
                    if bucket.remove(key) {
                        guard.occupied = bucket.is_occupied();
                        drop(guard);
                        self.decrement();
                        return true;
                    }
                }
                drop(guard);
            }
            let slot = self.slot(new_pos);
            let mut guard = slot.lock.write();
            let now = self.geometry.load(Ordering::Acquire);
            if now != g {
                drop(guard);
                g = now;
                continue;
            }
            // safety: the write guard is exclusive.
            let bucket = unsafe { &mut *slot.bucket.get() };
            let removed = bucket.remove(key);
            guard.occupied = bucket.is_occupied();
            drop(guard);
            if removed {
                self.decrement();
            }
            return removed;
        }
    }

    /// Appends one stratum and relocates every entry whose raw index
    /// changes under the widened mask. Callers serialize growth through the
    /// counter manager's lock.
    ///
    /// Ordering: the stratum pointer is published first, then the geometry
    /// word with `GROWING` set (so operations switch to double-probing),
    /// then the sweep runs, then `GROWING` clears. A relocated entry lands
    /// either in the new stratum or in a layer-0 slot with a smaller index
    /// than its source (a property of the prime and mask tables), so the
    /// in-order sweep never revisits a destination, and holding source and
    /// destination write locks across each move keeps every key findable in
    /// exactly one slot at every instant.
    fn grow(&self) {
        let g = self.geometry.load(Ordering::Acquire);
        debug_assert_eq!(g & GROWING, 0);
        let last = g >> 1;
        if last + 1 >= MAX_LAYERS {
            return;
        }
        let new_last = last + 1;
        self.strata[new_last].store(Self::alloc_stratum(new_last), Ordering::Release);
        self.geometry
            .store((new_last << 1) | GROWING, Ordering::Release);
        self.sweep(new_last);
        self.geometry.store(new_last << 1, Ordering::Release);
    }

    fn sweep(&self, new_last: usize) {
        let mut moved: Vec<(K, V)> = Vec::new();
        for layer in 0..new_last {
            let stratum = self.stratum(layer);
            for (idx, slot) in stratum.iter().enumerate() {
                let raw = geometry::prime_below(layer) + idx;
                let mut guard = slot.lock.write();
                if !guard.occupied {
                    continue;
                }
                // safety: the write guard is exclusive.
                let bucket = unsafe { &mut *slot.bucket.get() };
                let mut i = 0;
                while i < bucket.collisions.len() {
                    let stays =
                        geometry::raw_hash(bucket.collisions[i].0.layer_hash(), new_last) == raw;
                    if stays {
                        i += 1;
                    } else {
                        moved.push(bucket.collisions.swap_remove(i));
                    }
                }
                let main_moves = bucket
                    .main
                    .as_ref()
                    .map_or(false, |(k, _)| {
                        geometry::raw_hash(k.layer_hash(), new_last) != raw
                    });
                if main_moves {
                    if let Some(pair) = bucket.main.take() {
                        moved.push(pair);
                    }
                    bucket.main = bucket.collisions.pop();
                }
                // Deliver while still holding the source lock so the moved
                // entries never vanish from the table's point of view.
                for (k, v) in moved.drain(..) {
                    let dest = geometry::locate(geometry::raw_hash(k.layer_hash(), new_last));
                    debug_assert_ne!(dest, (layer, idx));
                    let dslot = self.slot(dest);
                    let mut dguard = dslot.lock.write();
                    // safety: the destination write guard is exclusive.
                    let dbucket = unsafe { &mut *dslot.bucket.get() };
                    if dbucket.main.is_none() {
                        dbucket.main = Some((k, v));
                    } else {
                        dbucket.collisions.push((k, v));
                    }
                    dguard.occupied = true;
                    drop(dguard);
                }
                guard.occupied = bucket.is_occupied();
            }
        }
    }
}

impl<K, V> Drop for RawTable<K, V> {
    fn drop(&mut self) {
        for layer in 0..MAX_LAYERS {
            let ptr = *self.strata[layer].get_mut();
            if ptr.is_null() {
                continue;
            }
            let len = geometry::layer_len(layer);
            // safety: the pointer came from Box::into_raw of a boxed slice
            // of exactly `len` slots, and &mut self means no outstanding
            // references into it.
            drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len)) });
        }
    }
}

/// A concurrent hash map over layered prime-sized strata.
///
/// Shared by reference between threads (wrap it in an [`Arc`] or borrow it
/// from a scope); all operations take `&self`.
///
/// Keys supply their own hash through [`LayerHash`] and equality through
/// [`Eq`]. Values are returned by clone.
///
/// # Examples
///
/// ```
/// use layermap::LayeredHashMap;
///
/// let map = LayeredHashMap::new()?;
/// map.write("alpha", 7);
/// assert_eq!(map.read(&"alpha")?, 7);
/// assert_eq!(map.size(), 1);
/// assert!(map.delete(&"alpha"));
/// assert!(map.read(&"alpha").is_err());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct LayeredHashMap<K, V> {
    raw: Arc<RawTable<K, V>>,
    id: InstanceId,
}

impl<K, V> LayeredHashMap<K, V>
where
    K: LayerHash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates an empty map with one stratum pre-allocated.
    ///
    /// Fails when all instance ids are bound to live maps.
    pub fn new() -> Result<Self, InstancePoolExhausted> {
        let id = registry::acquire_instance()?;
        let raw = Arc::new(RawTable::with_first_stratum(id.index()));
        let callback_table = Arc::clone(&raw);
        // The callback owns a handle to the table state; dropping the map
        // resets the manager, which releases it.
        registry::manager(id.index()).set_callback(Box::new(move |global| {
            if global > callback_table.capacity() as u64 {
                callback_table.grow();
            }
            callback_table.capacity() as u64
        }));
        Ok(Self { raw, id })
    }

    /// Creates an empty map with at least `capacity` slots pre-allocated
    /// (rounded up to a stratum boundary, capped by the prime table).
    pub fn with_capacity(capacity: usize) -> Result<Self, InstancePoolExhausted> {
        let map = Self::new()?;
        // The map is not shared yet, so growth needs no serialization.
        while map.raw.capacity() < capacity && map.raw.last_layer() + 1 < MAX_LAYERS {
            map.raw.grow();
        }
        Ok(map)
    }

    /// Inserts `key` or overwrites its value.
    pub fn write(&self, key: K, value: V) {
        self.raw.write(key, value);
    }

    /// Returns a clone of the value stored for `key`.
    pub fn read(&self, key: &K) -> Result<V, KeyNotFound>
    where
        V: Clone,
    {
        self.raw.read(key)
    }

    /// Removes `key`, returning whether a live entry was deleted.
    pub fn delete(&self, key: &K) -> bool {
        self.raw.delete(key)
    }

    /// The exact number of live entries.
    ///
    /// Takes the counter's barrier: concurrent shard updates wait while the
    /// total is summed, so the result is the true count at a single point
    /// during the call.
    pub fn size(&self) -> u64 {
        registry::manager(self.id.index()).global()
    }

    /// The current slot count across all strata.
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }
}

impl<K, V> Drop for LayeredHashMap<K, V> {
    fn drop(&mut self) {
        // Resetting the manager drops the growth callback (releasing its
        // table handle) and zeroes the counter state, so the instance id
        // (returned to the pool when `self.id` drops) starts clean for the
        // next table.
        registry::manager(self.id.index()).reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_put_get_remove() {
        let mut bucket: Bucket<u64, &str> = Bucket::new();
        assert!(!bucket.is_occupied());
        assert!(!bucket.remove(&1));

        assert!(bucket.put(1, "one"));
        assert!(bucket.put(2, "two"));
        assert!(bucket.put(3, "three"));
        assert!(!bucket.put(2, "TWO"));

        assert_eq!(bucket.get(&1), Some(&"one"));
        assert_eq!(bucket.get(&2), Some(&"TWO"));
        assert_eq!(bucket.get(&3), Some(&"three"));
        assert_eq!(bucket.get(&4), None);

        // Removing the main entry promotes the last collision.
        assert!(bucket.remove(&1));
        assert_eq!(bucket.main.as_ref().map(|(k, _)| *k), Some(3));
        assert!(bucket.is_occupied());
        assert_eq!(bucket.get(&2), Some(&"TWO"));

        assert!(bucket.remove(&2));
        assert!(bucket.remove(&3));
        assert!(!bucket.is_occupied());
        assert!(!bucket.remove(&3));
    }

    #[test]
    fn manual_growth_relocates_entries() {
        let map = LayeredHashMap::new().unwrap();
        // Multiplying by a prime scatters the masked hashes, so some keys
        // change slots when the mask widens.
        let keys: Vec<u64> = (0..2_000).map(|i| i * 7_919).collect();
        for &k in &keys {
            map.write(k, k + 1);
        }
        let before = map.size();
        let layer0 = map.capacity();

        map.raw.grow();
        assert!(map.capacity() > layer0);
        map.raw.grow();

        for &k in &keys {
            assert_eq!(map.read(&k), Ok(k + 1), "key {} lost in growth", k);
        }
        assert_eq!(map.size(), before);
    }

    #[test]
    fn growth_preserves_collision_chains() {
        let map = LayeredHashMap::new().unwrap();
        let p0 = map.capacity() as u64;
        // All three land on raw index 0 of layer 0.
        let mask_width = (map.capacity()).next_power_of_two() as u64;
        for k in [0, p0, mask_width] {
            map.write(k, k);
        }
        assert_eq!(map.size(), 3);

        map.raw.grow();
        for k in [0, p0, mask_width] {
            assert_eq!(map.read(&k), Ok(k));
        }
        assert_eq!(map.size(), 3);
    }
}
