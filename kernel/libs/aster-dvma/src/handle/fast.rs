// SPDX-License-Identifier: MPL-2.0

//! Preallocated device address ranges for small virtual buffers.
//!
//! A fast range belongs to one handle. Its device addresses and entry slots
//! are reserved once, so binding a small buffer through it needs neither the
//! allocator nor a walk of the page table.

use core::sync::atomic::Ordering;

use log::debug;

use super::{cookie::CookieBuilder, unbind::clear_entries};
use crate::{
    Daddr, DeviceAttributes, DmaObject, Domain, Error, PAGE_SHIFT, PAGE_SIZE, Result,
    flush::CLEAN_STAMP,
    iova::IovaRequest,
    page_table::{PteFlags, PteRun},
};

#[derive(Debug)]
pub(crate) struct FastRange {
    daddr: Daddr,
    pages: usize,
    run: PteRun,
    /// The number of pages mapped by the current bind, zero when idle.
    in_use_pages: usize,
    /// The latest stamp of the slots of the range.
    last_unmap_generation: u64,
}

impl FastRange {
    /// Reserves a fast range reachable by a device with `attrs`.
    ///
    /// The range never crosses a table page, so a single run covers it.
    pub fn create(domain: &Domain, attrs: &DeviceAttributes) -> Result<Self> {
        let pages = domain.config().fast_range_pages;
        let size = (pages as u64) << PAGE_SHIFT;
        let table_span = (domain.table().contig_pages() as u64) << PAGE_SHIFT;

        let daddr = domain.iova().alloc(&IovaRequest {
            size,
            align: PAGE_SIZE as u64,
            boundary: table_span.is_power_of_two().then_some(table_span),
            lo: attrs.addr_lo,
            hi: attrs.addr_hi,
        })?;
        let run = match domain.table().get_contig(daddr, pages) {
            Ok(run) if run.len() == pages => run,
            Ok(_) => {
                domain.iova().free(daddr, size);
                return Err(Error::TableExhausted);
            }
            Err(err) => {
                domain.iova().free(daddr, size);
                return Err(err);
            }
        };

        // The slots may have been retired by earlier owners of the addresses.
        let last_unmap_generation = run
            .stamps()
            .iter()
            .map(|stamp| stamp.load(Ordering::Relaxed))
            .max()
            .unwrap_or(CLEAN_STAMP);

        debug!("dvma: fast range at {:#x} ({} pages)", daddr, pages);
        Ok(Self {
            daddr,
            pages,
            run,
            in_use_pages: 0,
            last_unmap_generation,
        })
    }

    pub fn daddr(&self) -> Daddr {
        self.daddr
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn is_idle(&self) -> bool {
        self.in_use_pages == 0
    }

    /// Returns whether the range can be bound without flushing the IOTLB.
    pub fn is_reusable(&self, domain: &Domain) -> bool {
        self.is_idle() && domain.generation().covers(self.last_unmap_generation)
    }

    /// Maps the pages of `object` at the start of the range.
    ///
    /// The object must fit the range. On failure nothing stays mapped.
    pub fn map(
        &mut self,
        domain: &Domain,
        object: &DmaObject<'_>,
        flags: PteFlags,
        builder: &mut CookieBuilder<'_>,
    ) -> Result<()> {
        debug_assert!(self.is_idle());

        let mut mapped = 0;
        for chunk in object.chunks() {
            let chunk = match chunk {
                Ok(chunk) if mapped < self.pages => chunk,
                other => {
                    self.in_use_pages = mapped;
                    self.retire(domain);
                    return Err(other.err().unwrap_or(Error::InvalidArgs));
                }
            };

            self.run.install(mapped, flags.encode(chunk.frame));
            let page_daddr = self.daddr + ((mapped as u64) << PAGE_SHIFT);
            builder.push(page_daddr + chunk.offset as u64, chunk.len as u64);
            mapped += 1;
        }

        self.in_use_pages = mapped;
        Ok(())
    }

    /// Clears the mapped pages and makes the range idle.
    pub fn retire(&mut self, domain: &Domain) {
        if self.in_use_pages == 0 {
            return;
        }
        self.last_unmap_generation =
            clear_entries(domain, Some(&self.run), self.daddr, self.in_use_pages, false);
        self.in_use_pages = 0;
    }

    /// Returns the device addresses of the range to the allocator.
    pub fn release(mut self, domain: &Domain) {
        self.retire(domain);
        domain
            .iova()
            .free(self.daddr, (self.pages as u64) << PAGE_SHIFT);
    }
}
