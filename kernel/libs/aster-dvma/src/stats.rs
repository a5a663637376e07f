// SPDX-License-Identifier: MPL-2.0

//! Counters of DVMA activity in a domain.

use core::sync::atomic::{AtomicU64, Ordering};

/// A point-in-time copy of the counters of a domain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DvmaStats {
    /// Handles that are allocated and not yet freed.
    pub active_handles: u64,
    /// Handles that are currently bound.
    pub active_binds: u64,
    pub fast_path_binds: u64,
    pub general_path_binds: u64,
    /// Binds that needed more than one window.
    pub partial_binds: u64,
    /// Global IOTLB invalidations.
    pub global_flushes: u64,
    /// Range IOTLB invalidations issued by strict handles.
    pub range_flushes: u64,
    /// Global invalidations avoided because a completed flush already covered
    /// the reused slots.
    pub skipped_flushes: u64,
    /// Failed device address or page-table allocations.
    pub alloc_failures: u64,
}

#[derive(Default)]
pub(crate) struct StatCounters {
    pub active_handles: Counter,
    pub active_binds: Counter,
    pub fast_path_binds: Counter,
    pub general_path_binds: Counter,
    pub partial_binds: Counter,
    pub global_flushes: Counter,
    pub range_flushes: Counter,
    pub skipped_flushes: Counter,
    pub alloc_failures: Counter,
}

#[derive(Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl StatCounters {
    pub fn snapshot(&self) -> DvmaStats {
        DvmaStats {
            active_handles: self.active_handles.get(),
            active_binds: self.active_binds.get(),
            fast_path_binds: self.fast_path_binds.get(),
            general_path_binds: self.general_path_binds.get(),
            partial_binds: self.partial_binds.get(),
            global_flushes: self.global_flushes.get(),
            range_flushes: self.range_flushes.get(),
            skipped_flushes: self.skipped_flushes.get(),
            alloc_failures: self.alloc_failures.get(),
        }
    }
}
