// SPDX-License-Identifier: MPL-2.0

//! Allocation of device address ranges.

use alloc::collections::btree_map::BTreeMap;
use core::ops::Range;

use align_ext::AlignExt;
use log::trace;
use spin::Mutex;

use crate::{Daddr, Error, Result};

/// A request for a range of device addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IovaRequest {
    /// The size of the range in bytes.
    pub size: u64,
    /// The alignment of the range start, a power of two.
    pub align: u64,
    /// A power-of-two boundary the range must not cross.
    pub boundary: Option<u64>,
    /// The lowest acceptable address.
    pub lo: Daddr,
    /// The highest acceptable address (inclusive).
    pub hi: Daddr,
}

/// The allocator of a device address space.
///
/// Implementations are shared by all handles of a domain and synchronize
/// internally.
pub trait IovaAllocator: Send + Sync {
    /// Allocates a range that satisfies `request` and returns its start.
    ///
    /// Fails with [`Error::OutOfSpace`] if no such range is free.
    fn alloc(&self, request: &IovaRequest) -> Result<Daddr>;

    /// Frees a range returned by [`IovaAllocator::alloc`].
    fn free(&self, base: Daddr, size: u64);
}

/// A first-fit allocator over a single range of device addresses.
pub struct RangeIovaAllocator {
    /// Free ranges, from start to (exclusive) end.
    free_list: Mutex<BTreeMap<Daddr, Daddr>>,
}

impl RangeIovaAllocator {
    /// Creates an allocator that manages `range`, which is initially free.
    pub fn new(range: Range<Daddr>) -> Self {
        let mut free_list = BTreeMap::new();
        if !range.is_empty() {
            free_list.insert(range.start, range.end);
        }
        Self {
            free_list: Mutex::new(free_list),
        }
    }

    /// Returns the total number of free bytes.
    pub fn free_bytes(&self) -> u64 {
        self.free_list
            .lock()
            .iter()
            .map(|(start, end)| end - start)
            .sum()
    }
}

/// Finds the first address in `start..end` where `request` fits.
fn fit(start: Daddr, end: Daddr, request: &IovaRequest) -> Option<Daddr> {
    let size = request.size;
    let align_up = |addr: Daddr| Some(addr.checked_add(request.align - 1)? & !(request.align - 1));
    let mut candidate = align_up(start.max(request.lo))?;

    if let Some(boundary) = request.boundary {
        if size > boundary {
            return None;
        }
        let last = candidate.checked_add(size - 1)?;
        if candidate.align_down(boundary) != last.align_down(boundary) {
            candidate = align_up(last.align_down(boundary))?;
        }
    }

    let last = candidate.checked_add(size - 1)?;
    (last < end && last <= request.hi).then_some(candidate)
}

impl IovaAllocator for RangeIovaAllocator {
    fn alloc(&self, request: &IovaRequest) -> Result<Daddr> {
        debug_assert!(request.size > 0);
        debug_assert!(request.align.is_power_of_two());

        let mut free_list = self.free_list.lock();
        let found = free_list
            .iter()
            .filter(|&(_, &end)| end > request.lo)
            .take_while(|&(&start, _)| start <= request.hi)
            .find_map(|(&start, &end)| fit(start, end, request).map(|base| (start, end, base)));
        let Some((start, end, base)) = found else {
            return Err(Error::OutOfSpace);
        };

        free_list.remove(&start);
        if start < base {
            free_list.insert(start, base);
        }
        if base + request.size < end {
            free_list.insert(base + request.size, end);
        }

        trace!("iova: allocated {:#x}..{:#x}", base, base + request.size);
        Ok(base)
    }

    fn free(&self, base: Daddr, size: u64) {
        let mut free_list = self.free_list.lock();
        let mut start = base;
        let mut end = base + size;

        if let Some((&prev_start, &prev_end)) = free_list.range(..base).next_back() {
            debug_assert!(prev_end <= base, "double free of {:#x}", base);
            if prev_end == base {
                free_list.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(&next_end) = free_list.get(&end) {
            free_list.remove(&end);
            end = next_end;
        }
        debug_assert!(free_list.range(start..end).next().is_none());
        free_list.insert(start, end);

        trace!("iova: freed {:#x}..{:#x}", base, base + size);
    }
}
