//! Process-wide state binding tables to counter managers and per-thread
//! shards.
//!
//! Up to [`MAX_INSTANCES`] tables can be live at once. Each table owns an
//! instance id drawn from a shared pool; the id selects one entry of the
//! static manager array and one cell of every thread's shard array. Ids are
//! recycled: dropping a table resets its manager and returns the id, so the
//! slot is reusable by a later table.

use parking_lot::Mutex;
use std::cell::OnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::counter::{Manager, Shard};
use crate::InstancePoolExhausted;

/// Maximum number of simultaneously live tables.
pub(crate) const MAX_INSTANCES: usize = 1024;

// A const item, not an inline expression, so the array initializer below is
// allowed to copy it.
#[allow(clippy::declare_interior_mutable_const)]
const MANAGER_INIT: Manager = Manager::new();

/// One manager per instance slot, alive for the process lifetime.
static MANAGERS: [Manager; MAX_INSTANCES] = [MANAGER_INIT; MAX_INSTANCES];

/// Ids returned by dropped tables, preferred over minting fresh ones.
static FREE_IDS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

/// High-water mark of ids that have ever been handed out.
static FRESH_IDS: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn manager(id: usize) -> &'static Manager {
    &MANAGERS[id]
}

/// An owned instance id. Returns itself to the pool on drop.
pub(crate) struct InstanceId(usize);

impl InstanceId {
    pub(crate) fn index(&self) -> usize {
        self.0
    }
}

impl Drop for InstanceId {
    fn drop(&mut self) {
        FREE_IDS.lock().push(self.0);
    }
}

/// Draws an id from the pool, minting a fresh one if no recycled id is
/// available.
pub(crate) fn acquire_instance() -> Result<InstanceId, InstancePoolExhausted> {
    if let Some(id) = FREE_IDS.lock().pop() {
        return Ok(InstanceId(id));
    }
    let mut minted = FRESH_IDS.load(Ordering::Relaxed);
    loop {
        if minted >= MAX_INSTANCES {
            return Err(InstancePoolExhausted(()));
        }
        match FRESH_IDS.compare_exchange_weak(
            minted,
            minted + 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return Ok(InstanceId(minted)),
            Err(now) => minted = now,
        }
    }
}

/// A thread's shard for one instance slot. Deregisters on thread exit so
/// the manager folds the shard's value into its destroyed sum.
struct ShardHandle {
    shard: Arc<Shard>,
}

impl Drop for ShardHandle {
    fn drop(&mut self) {
        self.shard.manager().deregister(&self.shard);
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const SHARD_INIT: OnceCell<ShardHandle> = OnceCell::new();

thread_local! {
    /// This thread's shards, one cell per instance slot, materialized on
    /// first use. A cell outlives every table that reuses its instance id;
    /// the manager reset between tables clears the shard's value.
    static SHARDS: [OnceCell<ShardHandle>; MAX_INSTANCES] = [SHARD_INIT; MAX_INSTANCES];
}

/// Runs `f` with the calling thread's shard for `id`, registering it with
/// the instance's manager on first access from this thread.
pub(crate) fn with_shard<R>(id: usize, f: impl FnOnce(&Shard) -> R) -> R {
    SHARDS.with(|cells| {
        let handle = cells[id].get_or_init(|| {
            let shard = Arc::new(Shard::new(manager(id)));
            manager(id).register(Arc::clone(&shard));
            ShardHandle { shard }
        });
        f(&handle.shard)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_recycled() {
        // Far more acquire/release cycles than there are ids; without
        // recycling the pool would exhaust.
        for _ in 0..4 * MAX_INSTANCES {
            let id = acquire_instance().unwrap();
            assert!(id.index() < MAX_INSTANCES);
        }
    }

    #[test]
    fn shard_is_registered_once_per_thread() {
        let id = acquire_instance().unwrap();
        with_shard(id.index(), |shard| shard.increment());
        with_shard(id.index(), |shard| shard.increment());
        assert_eq!(manager(id.index()).global(), 2);
        manager(id.index()).reset();
    }
}
