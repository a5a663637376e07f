// SPDX-License-Identifier: MPL-2.0

//! The address-space context shared by the handles of a device group.

use alloc::{boxed::Box, collections::btree_map::BTreeMap};
use core::{
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use log::{debug, error, info};
use smallvec::SmallVec;
use spin::Mutex;

use crate::{
    Daddr, DvmaConfig, Error, PAGE_SHIFT, Paddr, Result,
    flush::{FlushGeneration, IotlbInvalidator},
    iova::{IovaAllocator, RangeIovaAllocator},
    page_table::{LeafPageTable, PageTableService, PteFlags},
    stats::{DvmaStats, StatCounters},
};

/// The identifier of a [`DmaHandle`] within its domain.
///
/// [`DmaHandle`]: crate::DmaHandle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u64);

impl HandleId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// The verdict on a translation fault reported by the IOMMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// The address lies in the live mapping of a handle; the fault can be
    /// reported to the handle's owner.
    Attributable(HandleId),
    /// The address lies in no live mapping.
    Unknown,
}

/// A callback that runs once resources are released.
pub type ResourceCallback = Box<dyn FnOnce() + Send>;

/// What to do when resources for a handle or a mapping are exhausted.
pub enum WaitPolicy {
    /// Spin until resources are released, then retry.
    Wait,
    /// Fail immediately.
    NoWait,
    /// Fail immediately and run the callback once resources are released.
    Callback(ResourceCallback),
}

impl core::fmt::Debug for WaitPolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WaitPolicy::Wait => f.write_str("Wait"),
            WaitPolicy::NoWait => f.write_str("NoWait"),
            WaitPolicy::Callback(_) => f.write_str("Callback"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveRange {
    len: u64,
    owner: HandleId,
}

/// A device address space.
///
/// The domain owns the collaborators that all of its handles share: the
/// device address allocator, the page table and the IOTLB invalidation
/// primitives, together with the flush-generation counter.
pub struct Domain {
    config: DvmaConfig,
    iova: Box<dyn IovaAllocator>,
    table: Box<dyn PageTableService>,
    invalidator: Box<dyn IotlbInvalidator>,
    generation: FlushGeneration,
    /// Mapped ranges of bound handles, by base address.
    live: Mutex<BTreeMap<Daddr, LiveRange>>,
    waiters: Mutex<SmallVec<[ResourceCallback; 4]>>,
    /// Bumped every time resources are released.
    resource_event: AtomicU64,
    next_handle_id: AtomicU64,
    stats: StatCounters,
}

impl Domain {
    /// Creates a domain from its collaborators.
    pub fn new(
        mut config: DvmaConfig,
        iova: Box<dyn IovaAllocator>,
        table: Box<dyn PageTableService>,
        invalidator: Box<dyn IotlbInvalidator>,
    ) -> Self {
        config.fast_range_pages = config.fast_range_pages.min(table.contig_pages()).max(1);
        info!(
            "dvma: domain created (strict_flush: {}, fast_path: {}, fast_range_pages: {})",
            config.strict_flush, config.fast_path, config.fast_range_pages
        );

        Self {
            config,
            iova,
            table,
            invalidator,
            generation: FlushGeneration::new(),
            live: Mutex::new(BTreeMap::new()),
            waiters: Mutex::new(SmallVec::new()),
            resource_event: AtomicU64::new(0),
            next_handle_id: AtomicU64::new(1),
            stats: StatCounters::default(),
        }
    }

    /// Creates a domain that manages `range` with the in-memory allocator and
    /// page table of this crate.
    pub fn with_range(
        config: DvmaConfig,
        range: Range<Daddr>,
        invalidator: Box<dyn IotlbInvalidator>,
    ) -> Self {
        Self::new(
            config,
            Box::new(RangeIovaAllocator::new(range)),
            Box::new(LeafPageTable::new()),
            invalidator,
        )
    }

    pub fn config(&self) -> &DvmaConfig {
        &self.config
    }

    /// Returns the generation published by the last completed global flush.
    pub fn flush_generation(&self) -> u64 {
        self.generation.current()
    }

    /// Returns a snapshot of the activity counters.
    pub fn stats(&self) -> DvmaStats {
        self.stats.snapshot()
    }

    /// Invalidates the whole IOTLB of the domain.
    ///
    /// Every slot retired before the call becomes reusable without another
    /// flush.
    pub fn flush_all(&self) {
        self.generation.flush_and_bump(self.invalidator.as_ref());
        self.stats.global_flushes.inc();
    }

    /// Translates `daddr` through the page table of the domain.
    pub fn translate(&self, daddr: Daddr) -> Option<Paddr> {
        let run = self.table.lookup_contig(daddr, 1)?;
        let entry = run.entries()[0].load(Ordering::Acquire);
        (entry != 0).then(|| PteFlags::frame_of(entry) + (daddr & ((1 << PAGE_SHIFT) - 1)))
    }

    /// Classifies a translation fault at `daddr`.
    pub fn classify_fault(&self, daddr: Daddr) -> FaultClass {
        let live = self.live.lock();
        match live.range(..=daddr).next_back() {
            Some((&base, range)) if daddr - base < range.len => {
                debug!(
                    "dvma: fault at {:#x} is in the mapping of handle {}",
                    daddr, range.owner.0
                );
                FaultClass::Attributable(range.owner)
            }
            _ => {
                error!("dvma: fault at {:#x} hits no live mapping", daddr);
                FaultClass::Unknown
            }
        }
    }

    pub(crate) fn iova(&self) -> &dyn IovaAllocator {
        self.iova.as_ref()
    }

    pub(crate) fn table(&self) -> &dyn PageTableService {
        self.table.as_ref()
    }

    pub(crate) fn generation(&self) -> &FlushGeneration {
        &self.generation
    }

    pub(crate) fn counters(&self) -> &StatCounters {
        &self.stats
    }

    pub(crate) fn alloc_handle_id(&self) -> HandleId {
        HandleId(self.next_handle_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Flushes the whole IOTLB unless a completed flush covers `stamp`.
    pub(crate) fn flush_past(&self, stamp: u64) {
        if self.generation.flush_past(stamp, self.invalidator.as_ref()) {
            self.stats.global_flushes.inc();
        } else {
            self.stats.skipped_flushes.inc();
        }
    }

    pub(crate) fn flush_range(&self, daddr: Daddr, len: u64) {
        self.invalidator.invalidate_range(daddr, len);
        self.stats.range_flushes.inc();
    }

    pub(crate) fn track(&self, base: Daddr, len: u64, owner: HandleId) {
        self.live.lock().insert(base, LiveRange { len, owner });
    }

    pub(crate) fn untrack(&self, base: Daddr) {
        self.live.lock().remove(&base);
    }

    /// Runs `attempt`, applying `policy` when it fails for lack of resources.
    pub(crate) fn with_policy<T>(
        &self,
        policy: WaitPolicy,
        mut attempt: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        loop {
            let event = self.resource_event.load(Ordering::Acquire);
            let err = match attempt() {
                Err(err @ (Error::OutOfSpace | Error::NoResources)) => err,
                result => return result,
            };
            self.stats.alloc_failures.inc();

            match policy {
                WaitPolicy::Wait => {
                    debug!("dvma: waiting for resources after {:?}", err);
                    while self.resource_event.load(Ordering::Acquire) == event {
                        core::hint::spin_loop();
                    }
                }
                WaitPolicy::NoWait => return Err(err),
                WaitPolicy::Callback(callback) => {
                    self.waiters.lock().push(callback);
                    return Err(err);
                }
            }
        }
    }

    /// Announces that resources were released and runs pending callbacks.
    pub(crate) fn resources_released(&self) {
        self.resource_event.fetch_add(1, Ordering::Release);
        let callbacks = core::mem::take(&mut *self.waiters.lock());
        for callback in callbacks {
            callback();
        }
    }
}

impl core::fmt::Debug for Domain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Domain")
            .field("config", &self.config)
            .field("flush_generation", &self.generation.current())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicUsize;

    use super::*;
    use crate::page_table::PteRun;

    struct Nop;

    impl IotlbInvalidator for Nop {
        fn invalidate_all(&self) {}
        fn invalidate_range(&self, _daddr: Daddr, _len: u64) {}
    }

    fn domain() -> Domain {
        Domain::with_range(DvmaConfig::default(), 0x1000..0x100000, Box::new(Nop))
    }

    #[test]
    fn faults_are_attributed_to_live_ranges() {
        let domain = domain();
        let id = domain.alloc_handle_id();
        domain.track(0x4000, 0x2000, id);

        assert_eq!(domain.classify_fault(0x4000), FaultClass::Attributable(id));
        assert_eq!(domain.classify_fault(0x5fff), FaultClass::Attributable(id));
        assert_eq!(domain.classify_fault(0x6000), FaultClass::Unknown);
        assert_eq!(domain.classify_fault(0x3fff), FaultClass::Unknown);

        domain.untrack(0x4000);
        assert_eq!(domain.classify_fault(0x4000), FaultClass::Unknown);
    }

    #[test]
    fn callbacks_run_once_on_release() {
        let domain = domain();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let result: Result<()> = domain.with_policy(
            WaitPolicy::Callback(Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })),
            || Err(Error::OutOfSpace),
        );
        assert_eq!(result, Err(Error::OutOfSpace));
        assert_eq!(runs.load(Ordering::Relaxed), 0);

        domain.resources_released();
        domain.resources_released();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(domain.stats().alloc_failures, 1);
    }

    #[test]
    fn other_errors_bypass_the_policy() {
        let domain = domain();
        let result: Result<()> = domain.with_policy(WaitPolicy::Wait, || Err(Error::InvalidArgs));
        assert_eq!(result, Err(Error::InvalidArgs));
        assert_eq!(domain.stats().alloc_failures, 0);
    }

    #[test]
    fn fast_range_pages_are_clamped() {
        let config = DvmaConfig {
            fast_range_pages: 4096,
            ..Default::default()
        };
        let domain = Domain::with_range(config, 0x1000..0x100000, Box::new(Nop));
        assert_eq!(domain.config().fast_range_pages, 512);
    }

    /// A table that claims it cannot hand out contiguous runs.
    struct NoRuns(LeafPageTable);

    impl PageTableService for NoRuns {
        fn contig_pages(&self) -> usize {
            0
        }

        fn get_contig(&self, daddr: Daddr, max_pages: usize) -> Result<PteRun> {
            self.0.get_contig(daddr, max_pages)
        }

        fn lookup_contig(&self, daddr: Daddr, max_pages: usize) -> Option<PteRun> {
            self.0.lookup_contig(daddr, max_pages)
        }
    }

    #[test]
    fn fast_range_keeps_a_page_without_runs() {
        let domain = Domain::new(
            DvmaConfig::default(),
            Box::new(RangeIovaAllocator::new(0x1000..0x100000)),
            Box::new(NoRuns(LeafPageTable::new())),
            Box::new(Nop),
        );
        assert_eq!(domain.config().fast_range_pages, 1);
    }
}
