//! The per-slot lock: a single 32-bit atomic word shared between the lock
//! state and the slot's occupancy flag.
//!
//! ```text
//!  31        30        29                            0
//! |---------|---------|------------------------------|
//! | OCCUPIED| WRITER  |         reader count         |
//! |---------|---------|------------------------------|
//! ```
//!
//! Packing the occupancy flag into the lock word means every successful
//! acquisition learns whether the slot holds data from the same atomic
//! operation that granted access, and a writer publishes the new occupancy
//! and releases the lock in one store.
//!
//! At most one writer holds the lock at a time. A writer that has won the
//! `WRITER` bit turns away new readers immediately, then drains the readers
//! that were already in. Fairness is not guaranteed; all waiting is a
//! bounded spin with cooperative yields.

use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};

/// Slot-holds-data flag, bit 31. Owned by the write side: only
/// `write_unlock` changes it.
const OCCUPIED: u32 = 1 << 31;

/// Writer-held flag, bit 30.
const WRITER: u32 = 1 << 30;

/// Mask of the live-reader count, bits 29..0.
const READERS: u32 = WRITER - 1;

pub(crate) struct SlotLock {
    state: AtomicU32,
}

impl SlotLock {
    /// A released lock over an empty slot.
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Acquires the lock for reading, returning a guard that reports the
    /// occupancy bit observed at acquisition.
    pub(crate) fn read(&self) -> ReadGuard<'_> {
        let backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & WRITER == 0 {
                // Increment the reader count, leaving the other bits as
                // observed. The pre-CAS word carries the occupancy answer.
                if self
                    .state
                    .compare_exchange(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return ReadGuard {
                        lock: self,
                        occupied: state & OCCUPIED != 0,
                    };
                }
            }
            backoff.snooze();
        }
    }

    /// Acquires the lock for writing, returning a guard that reports the
    /// occupancy bit observed at acquisition and commits a (possibly
    /// changed) occupancy on drop.
    pub(crate) fn write(&self) -> WriteGuard<'_> {
        let backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & WRITER == 0 {
                if self
                    .state
                    .compare_exchange(
                        state,
                        state | WRITER,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // The bit is ours; late readers now bounce. Wait out the
                    // readers that were already counted.
                    let drain = Backoff::new();
                    while self.state.load(Ordering::Acquire) & READERS != 0 {
                        drain.snooze();
                    }
                    let occupied = state & OCCUPIED != 0;
                    return WriteGuard {
                        lock: self,
                        occupied,
                    };
                }
            }
            backoff.snooze();
        }
    }

    fn read_unlock(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    fn write_unlock(&self, occupied: bool) {
        // The reader count is zero while the writer holds the lock, so a
        // plain store releases the WRITER bit and publishes the occupancy.
        let state = if occupied { OCCUPIED } else { 0 };
        self.state.store(state, Ordering::Release);
    }
}

/// Shared access to a slot. Unlocks on drop.
pub(crate) struct ReadGuard<'a> {
    lock: &'a SlotLock,
    occupied: bool,
}

impl ReadGuard<'_> {
    /// Whether the slot held data when the lock was acquired.
    pub(crate) fn occupied(&self) -> bool {
        self.occupied
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// Exclusive access to a slot. The holder updates `occupied` to reflect the
/// slot's state after its mutation; dropping the guard commits it.
pub(crate) struct WriteGuard<'a> {
    lock: &'a SlotLock,
    pub(crate) occupied: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_unlock(self.occupied);
    }
}
