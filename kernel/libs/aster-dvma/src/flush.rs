// SPDX-License-Identifier: MPL-2.0

//! Deferred IOTLB invalidation.
//!
//! Unbinding a relaxed handle does not invalidate the IOTLB. Instead, every
//! cleared entry slot is stamped with the flush generation, and a later bind
//! that reuses the slot flushes only if no flush has completed since.
//!
//! The generation starts at one and is bumped once per completed global
//! flush. While a flush runs, the top bit of the counter is set. A stamp taken
//! at that time records the generation the running flush will publish, so the
//! running flush is never mistaken for one that covers the slot.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::Daddr;

/// Invalidation primitives of the IOMMU that translates a domain.
///
/// Both operations must be complete when they return.
pub trait IotlbInvalidator: Send + Sync {
    /// Invalidates every cached translation of the domain.
    fn invalidate_all(&self);

    /// Invalidates the cached translations of `daddr..daddr + len`.
    fn invalidate_range(&self, daddr: Daddr, len: u64);
}

const IN_PROGRESS: u64 = 1 << 63;

/// The stamp of a slot that no flush needs to cover.
pub const CLEAN_STAMP: u64 = 0;

/// The flush-generation counter of a domain.
pub struct FlushGeneration {
    value: AtomicU64,
    /// Serializes the check-and-flush sequence.
    flush_lock: Mutex<()>,
}

impl FlushGeneration {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(1),
            flush_lock: Mutex::new(()),
        }
    }

    /// Returns the generation published by the last completed flush.
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst) & !IN_PROGRESS
    }

    /// Returns whether a global flush is running.
    pub fn is_flushing(&self) -> bool {
        self.value.load(Ordering::SeqCst) & IN_PROGRESS != 0
    }

    /// Returns the stamp for slots that were cleared before this call.
    pub fn stamp(&self) -> u64 {
        let value = self.value.load(Ordering::SeqCst);
        if value & IN_PROGRESS != 0 {
            (value & !IN_PROGRESS) + 1
        } else {
            value
        }
    }

    /// Returns whether a completed flush covers slots stamped with `stamp`.
    pub fn covers(&self, stamp: u64) -> bool {
        self.current() > stamp
    }

    /// Flushes with `invalidator` unless a completed flush already covers
    /// `stamp`.
    ///
    /// Concurrent callers are coalesced: a caller that waits for a running
    /// flush re-checks its stamp afterwards and returns without flushing if
    /// the flush it waited for covered it. Returns whether this call flushed.
    pub fn flush_past(&self, stamp: u64, invalidator: &dyn IotlbInvalidator) -> bool {
        if self.covers(stamp) {
            return false;
        }

        let _guard = self.flush_lock.lock();
        if self.covers(stamp) {
            return false;
        }

        let generation = self.current();
        self.value.store(generation | IN_PROGRESS, Ordering::SeqCst);
        invalidator.invalidate_all();
        self.value.store(generation + 1, Ordering::SeqCst);
        true
    }

    /// Flushes unconditionally and returns the new generation.
    pub fn flush_and_bump(&self, invalidator: &dyn IotlbInvalidator) -> u64 {
        let _guard = self.flush_lock.lock();
        let generation = self.current();
        self.value.store(generation | IN_PROGRESS, Ordering::SeqCst);
        invalidator.invalidate_all();
        self.value.store(generation + 1, Ordering::SeqCst);
        generation + 1
    }
}

impl Default for FlushGeneration {
    fn default() -> Self {
        Self::new()
    }
}
