//! The distributed size counter: per-thread shards coordinated by a
//! per-table manager.
//!
//! A single shared atomic counter is the first thing to saturate under a
//! write-heavy workload, so each participating thread instead accumulates
//! into a private [`Shard`] and only synchronizes when its local value
//! crosses a threshold. The [`Manager`] owns the bookkeeping: it sums the
//! shards on demand, asks a callback where the next synchronization point
//! should be, and spreads the resulting slack back over the shards as new
//! thresholds.
//!
//! Exact reads are still possible: [`Manager::global`] holds a barrier lock
//! for the duration of the sum, and every shard mutation finishes by
//! waiting out that barrier, so the value returned is the true total at the
//! moment the sum completes.

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::geometry;

/// Minimum slack ratio handed back by a recompute. Keeps thresholds from
/// collapsing onto the current total once the callback's target has been
/// reached, which would turn every increment into a recompute.
pub(crate) const MAX_ERROR: f64 = 1e-5;

/// Maps an observed global value to the next threshold target.
pub(crate) type ThresholdCallback = Box<dyn Fn(u64) -> u64 + Send + Sync>;

/// One thread's private portion of a distributed counter.
///
/// A shard is owned by exactly one thread for its entire lifetime; only the
/// manager reads it from elsewhere. The value and threshold words are
/// cache-padded so two threads' shards never contend on a line.
pub(crate) struct Shard {
    value: CachePadded<AtomicI64>,
    threshold: CachePadded<AtomicI64>,
    manager: &'static Manager,
}

impl Shard {
    pub(crate) fn new(manager: &'static Manager) -> Self {
        Self {
            value: CachePadded::new(AtomicI64::new(0)),
            threshold: CachePadded::new(AtomicI64::new(0)),
            manager,
        }
    }

    pub(crate) fn manager(&self) -> &'static Manager {
        self.manager
    }

    /// Adds one. Triggers a manager update when the new value reaches the
    /// shard's threshold, then honors any exact read in flight.
    pub(crate) fn increment(&self) {
        let new = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        if new >= self.threshold.load(Ordering::SeqCst) {
            self.manager.update();
        }
        self.manager.wait_for_barrier();
    }

    /// Subtracts one. Decrements never trigger updates; the thresholds only
    /// guard the growth direction.
    pub(crate) fn decrement(&self) {
        self.value.fetch_sub(1, Ordering::SeqCst);
        self.manager.wait_for_barrier();
    }

    /// Replaces the threshold with `value + slack`.
    fn adjust_threshold(&self, slack: i64) {
        self.threshold
            .store(self.value.load(Ordering::SeqCst) + slack, Ordering::SeqCst);
    }

    fn snapshot(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.value.store(0, Ordering::SeqCst);
    }
}

struct ManagerInner {
    shards: Vec<Arc<Shard>>,
    /// Running sum of values from shards whose owning threads have exited.
    destroyed_sum: i64,
    /// `None` means the default callback (targets the first stratum size).
    callback: Option<ThresholdCallback>,
}

impl ManagerInner {
    fn live_sum(&self) -> i64 {
        self.shards.iter().map(|s| s.snapshot()).sum()
    }

    /// Re-derives every shard's threshold from the current global value.
    ///
    /// The callback turns the observed global into a target; the gap to
    /// that target (floored at `target * MAX_ERROR`) is the number of
    /// un-synchronized operations the shards may absorb before the next
    /// recompute, split evenly among them.
    fn recompute(&mut self) {
        if self.shards.is_empty() {
            return;
        }
        let global = (self.live_sum() + self.destroyed_sum).max(0) as u64;
        let target = match &self.callback {
            Some(cb) => cb(global),
            None => geometry::PRIMES[0] as u64,
        };
        let slack = (target as i64 - global as i64).max((target as f64 * MAX_ERROR) as i64)
            / self.shards.len() as i64;
        for shard in &self.shards {
            shard.adjust_threshold(slack);
        }
    }
}

/// Coordinator for one table's shards.
///
/// The coarse lock serializes the shard list and recomputes; the barrier
/// lock gates shard mutations against exact reads.
pub(crate) struct Manager {
    inner: Mutex<ManagerInner>,
    barrier: Mutex<()>,
}

impl Manager {
    pub(crate) const fn new() -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                shards: Vec::new(),
                destroyed_sum: 0,
                callback: None,
            }),
            barrier: Mutex::new(()),
        }
    }

    /// Adds a shard and recomputes: more shards mean a smaller per-shard
    /// slice of the slack.
    pub(crate) fn register(&self, shard: Arc<Shard>) {
        let mut inner = self.inner.lock();
        inner.shards.push(shard);
        inner.recompute();
    }

    /// Removes a shard, folding its final value into the destroyed sum so
    /// the global total is unaffected by thread exit.
    pub(crate) fn deregister(&self, shard: &Arc<Shard>) {
        let mut inner = self.inner.lock();
        if let Some(at) = inner.shards.iter().position(|s| Arc::ptr_eq(s, shard)) {
            let last_value = inner.shards[at].snapshot();
            inner.destroyed_sum += last_value;
            inner.shards.swap_remove(at);
        }
    }

    pub(crate) fn set_callback(&self, callback: ThresholdCallback) {
        self.inner.lock().callback = Some(callback);
    }

    /// Called by a shard that crossed its threshold.
    ///
    /// Only one recompute needs to run per burst of crossings: the thread
    /// that wins the lock recomputes, and any thread that loses the race
    /// just waits for that recompute to finish before proceeding.
    pub(crate) fn update(&self) {
        match self.inner.try_lock() {
            Some(mut inner) => inner.recompute(),
            None => drop(self.inner.lock()),
        }
    }

    /// The exact global value.
    ///
    /// Holds the barrier for the whole sum; shard mutations issued
    /// meanwhile finish their atomic op and then spin in
    /// [`Manager::wait_for_barrier`] until the sum is taken, so the result
    /// is the total at a single linearization point.
    pub(crate) fn global(&self) -> u64 {
        let _barrier = self.barrier.lock();
        let inner = self.inner.lock();
        (inner.live_sum() + inner.destroyed_sum).max(0) as u64
    }

    /// Spins while an exact read is in flight. No-op otherwise.
    pub(crate) fn wait_for_barrier(&self) {
        if self.barrier.is_locked() {
            let backoff = Backoff::new();
            while self.barrier.is_locked() {
                backoff.snooze();
            }
        }
    }

    /// Restores the initial state for reuse by a new table: clears the
    /// destroyed sum and every live shard, drops the installed callback,
    /// and re-derives thresholds from the (now zero) global.
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.destroyed_sum = 0;
        inner.callback = None;
        for shard in &inner.shards {
            shard.clear();
        }
        inner.recompute();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn leaked_manager() -> &'static Manager {
        Box::leak(Box::new(Manager::new()))
    }

    #[test]
    fn single_shard_counts() {
        let manager = leaked_manager();
        let shard = Arc::new(Shard::new(manager));
        manager.register(Arc::clone(&shard));

        for _ in 0..100 {
            shard.increment();
        }
        for _ in 0..40 {
            shard.decrement();
        }
        assert_eq!(manager.global(), 60);
    }

    #[test]
    fn global_is_exact_across_threads() {
        let manager = leaked_manager();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                thread::spawn(move || {
                    let shard = Arc::new(Shard::new(manager));
                    manager.register(Arc::clone(&shard));
                    for _ in 0..10_000 {
                        shard.increment();
                    }
                    for _ in 0..3_000 {
                        shard.decrement();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(manager.global(), 4 * 7_000);
    }

    #[test]
    fn deregistered_shards_still_count() {
        let manager = leaked_manager();
        let shard = Arc::new(Shard::new(manager));
        manager.register(Arc::clone(&shard));
        for _ in 0..25 {
            shard.increment();
        }
        manager.deregister(&shard);
        assert_eq!(manager.global(), 25);

        // A new shard keeps accumulating on top of the destroyed sum.
        let other = Arc::new(Shard::new(manager));
        manager.register(Arc::clone(&other));
        other.increment();
        assert_eq!(manager.global(), 26);
    }

    #[test]
    fn callback_drives_thresholds() {
        let manager = leaked_manager();
        manager.set_callback(Box::new(|global| global + 1_000));

        let a = Arc::new(Shard::new(manager));
        let b = Arc::new(Shard::new(manager));
        manager.register(Arc::clone(&a));
        manager.register(Arc::clone(&b));

        // Registering recomputed with global = 0, target 1000, two shards:
        // each shard gets 500 operations of slack.
        assert_eq!(a.threshold.load(Ordering::SeqCst), 500);
        assert_eq!(b.threshold.load(Ordering::SeqCst), 500);

        for _ in 0..500 {
            a.increment();
        }
        // Crossing the threshold recomputes from global = 500.
        assert_eq!(manager.global(), 500);
        assert!(a.threshold.load(Ordering::SeqCst) > 500);
    }

    #[test]
    fn reset_restores_initial_state() {
        let manager = leaked_manager();
        manager.set_callback(Box::new(|_| 1 << 20));
        let shard = Arc::new(Shard::new(manager));
        manager.register(Arc::clone(&shard));
        for _ in 0..10 {
            shard.increment();
        }
        assert_eq!(manager.global(), 10);

        manager.reset();
        assert_eq!(manager.global(), 0);
        assert_eq!(shard.snapshot(), 0);
    }

    #[test]
    fn concurrent_exact_reads() {
        let manager = leaked_manager();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let writers: Vec<_> = (0..2)
            .map(|_| {
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let shard = Arc::new(Shard::new(manager));
                    manager.register(Arc::clone(&shard));
                    let mut net = 0i64;
                    while !stop.load(Ordering::Relaxed) {
                        shard.increment();
                        net += 1;
                    }
                    net
                })
            })
            .collect();

        // Increment-only load: exact reads must be monotone.
        let mut last = 0;
        for _ in 0..100 {
            let now = manager.global();
            assert!(now >= last, "global went backwards: {} -> {}", last, now);
            last = now;
        }
        stop.store(true, Ordering::Relaxed);

        let total: i64 = writers.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(manager.global(), total as u64);
    }
}
