// SPDX-License-Identifier: MPL-2.0

//! The bind engine.

use align_ext::AlignExt;
use log::{debug, warn};

use super::{
    DmaDirection, DmaHandle, MappedVia, Mapping,
    cookie::{Cookie, CookieBuilder, max_cookies},
    fast::FastRange,
    unbind::clear_entries,
    window::count_windows,
};
use crate::{
    Daddr, DmaObject, Domain, Error, PAGE_SHIFT, Paddr, Result, UsageError, WaitPolicy,
    flush::CLEAN_STAMP,
    iova::IovaRequest,
    object::Extent,
    page_table::{PteFlags, PteRun},
};

/// How much of a bound buffer the first window covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStatus {
    /// The first window covers the whole buffer.
    FullyMapped,
    /// The buffer needs this many windows; the rest are obtained with
    /// [`DmaHandle::window`].
    PartiallyMapped(usize),
}

/// The outcome of a successful bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bound<'a> {
    pub status: BindStatus,
    /// The cookies of window 0.
    pub first_window: &'a [Cookie],
}

impl DmaHandle<'_> {
    /// Maps `object` for DMA in `direction` and describes it as cookies.
    ///
    /// Small virtual buffers are mapped through the preallocated fast range
    /// of the handle when they can; anything else gets fresh device
    /// addresses. `policy` applies when the device address space is full.
    ///
    /// On failure nothing stays mapped.
    pub fn bind(
        &mut self,
        object: &DmaObject<'_>,
        direction: DmaDirection,
        policy: WaitPolicy,
    ) -> Result<Bound<'_>> {
        if self.mapping.is_some() {
            warn!("dvma: handle {} bound twice", self.id.as_u64());
            return Err(UsageError::AlreadyBound.into());
        }
        self.attrs.check_bindable().inspect_err(|_| {
            warn!(
                "dvma: handle {} cannot bind with {:?}",
                self.id.as_u64(),
                self.attrs
            );
        })?;

        let extent = object.extent()?;
        if self.attrs.alignment_required
            && !(extent.first_offset as u64).is_aligned_to(self.attrs.alignment)
        {
            return Err(Error::InvalidArgs);
        }
        if self.limits.max_cookie == 0 {
            return Err(Error::IncompatibleConfig);
        }

        let span = (extent.pages as u64) << PAGE_SHIFT;
        self.cookies
            .reserve(max_cookies(extent.len, span, extent.pages, &self.limits))?;

        let flags = direction.pte_flags();
        let mapping = if self.fast_path_ready(object, &extent) {
            self.bind_fast(object, &extent, flags)?
        } else {
            self.bind_general(object, &extent, flags, policy)?
        };

        let domain = self.domain;
        domain.track(mapping.daddr, (mapping.pages as u64) << PAGE_SHIFT, self.id);
        domain.counters().active_binds.inc();
        debug!(
            "dvma: handle {} bound {:#x} bytes at {:#x} ({} cookies, {} windows)",
            self.id.as_u64(),
            extent.len,
            mapping.daddr,
            self.cookies.len(),
            self.window_count
        );
        self.mapping = Some(mapping);

        self.cursor.rewind();
        let first = self.cursor.advance(&self.cookies, &self.limits)?;
        let status = if self.window_count > 1 {
            domain.counters().partial_binds.inc();
            BindStatus::PartiallyMapped(self.window_count)
        } else {
            BindStatus::FullyMapped
        };
        Ok(Bound {
            status,
            first_window: first.to_window(&self.cookies).cookies,
        })
    }

    /// Returns whether `object` can be bound through the fast range, creating
    /// the range on first use.
    fn fast_path_ready(&mut self, object: &DmaObject<'_>, extent: &Extent) -> bool {
        if !self.domain.config().fast_path || self.strict || !self.attrs.fast_path_compatible() {
            return false;
        }
        if !matches!(object, DmaObject::Virt { .. })
            || extent.pages > self.domain.config().fast_range_pages
            || extent.len > self.limits.max_cookie
        {
            return false;
        }

        if self.fast.is_none() {
            match FastRange::create(self.domain, &self.attrs) {
                Ok(fast) => self.fast = Some(fast),
                Err(err) => {
                    warn!("dvma: no fast range for handle {}: {:?}", self.id.as_u64(), err);
                    return false;
                }
            }
        }
        self.fast
            .as_ref()
            .is_some_and(|fast| extent.pages <= fast.pages() && fast.is_reusable(self.domain))
    }

    fn bind_fast(
        &mut self,
        object: &DmaObject<'_>,
        extent: &Extent,
        flags: PteFlags,
    ) -> Result<Mapping> {
        let domain = self.domain;
        let Some(fast) = self.fast.as_mut() else {
            return Err(Error::NoResources);
        };

        let mut builder = CookieBuilder::new(&mut self.cookies, self.limits, extent.len);
        if let Err(err) = fast.map(domain, object, flags, &mut builder) {
            self.cookies.clear();
            return Err(err);
        }
        builder.finish();

        self.window_count = match count_windows(&self.cookies, &self.limits) {
            Ok(count) => count,
            Err(err) => {
                fast.retire(domain);
                self.cookies.clear();
                return Err(err);
            }
        };
        domain.counters().fast_path_binds.inc();
        Ok(Mapping {
            daddr: fast.daddr(),
            pages: extent.pages,
            via: MappedVia::FastRange,
        })
    }

    fn bind_general(
        &mut self,
        object: &DmaObject<'_>,
        extent: &Extent,
        flags: PteFlags,
        policy: WaitPolicy,
    ) -> Result<Mapping> {
        let domain = self.domain;
        let limits = self.limits;
        let span = (extent.pages as u64) << PAGE_SHIFT;

        // A transfer that cannot fit between two boundaries is mapped
        // contiguously and cut into cookies at the boundaries instead.
        let needs_boundary_split = limits.boundary != 0 && span > limits.boundary;
        let request = IovaRequest {
            size: span,
            align: self.attrs.daddr_alignment(),
            boundary: (limits.boundary != 0 && !needs_boundary_split).then_some(limits.boundary),
            lo: self.attrs.addr_lo,
            hi: self.attrs.addr_hi,
        };
        let base = domain.with_policy(policy, || domain.iova().alloc(&request))?;

        let mut mapper = PageMapper::new(domain, base, extent.pages, flags);
        let mut builder = CookieBuilder::new(&mut self.cookies, limits, extent.len);
        let mapped: Result<()> = object.chunks().try_for_each(|chunk| {
            let chunk = chunk?;
            let page_daddr = mapper.map(chunk.frame)?;
            builder.push(page_daddr + chunk.offset as u64, chunk.len as u64);
            Ok(())
        });
        if let Err(err) = mapped {
            self.unwind(mapper, err);
            return Err(err);
        }
        builder.finish();

        self.window_count = match count_windows(&self.cookies, &limits) {
            Ok(count) => count,
            Err(err) => {
                warn!(
                    "dvma: handle {} cannot split {:#x} bytes into windows",
                    self.id.as_u64(),
                    extent.len
                );
                self.unwind(mapper, err);
                return Err(err);
            }
        };

        if self.strict {
            domain.flush_range(base, span);
        } else if mapper.max_stamp != CLEAN_STAMP {
            domain.flush_past(mapper.max_stamp);
        }

        domain.counters().general_path_binds.inc();
        Ok(Mapping {
            daddr: base,
            pages: extent.pages,
            via: MappedVia::Allocated {
                run: mapper.into_cached_run(),
            },
        })
    }

    /// Undoes a general-path bind that failed after its addresses were
    /// allocated.
    fn unwind(&mut self, mapper: PageMapper<'_>, err: Error) {
        debug!("dvma: handle {} unwinds a bind: {:?}", self.id.as_u64(), err);
        if err == Error::TableExhausted {
            self.domain.counters().alloc_failures.inc();
        }
        self.cookies.clear();
        self.window_count = 0;

        let (base, mapped, pages) = (mapper.base, mapper.mapped, mapper.pages);
        if mapped > 0 {
            clear_entries(self.domain, None, base, mapped, self.strict);
        }
        self.domain.iova().free(base, (pages as u64) << PAGE_SHIFT);
        self.domain.resources_released();
    }
}

/// Writes the entries of a freshly allocated range, one page at a time.
struct PageMapper<'a> {
    domain: &'a Domain,
    base: Daddr,
    pages: usize,
    flags: PteFlags,
    run: Option<PteRun>,
    /// The index of the next slot in `run`.
    index: usize,
    mapped: usize,
    /// Whether `run` is the only run of the range.
    single_run: bool,
    /// The latest stamp among the reused slots.
    max_stamp: u64,
}

impl<'a> PageMapper<'a> {
    fn new(domain: &'a Domain, base: Daddr, pages: usize, flags: PteFlags) -> Self {
        Self {
            domain,
            base,
            pages,
            flags,
            run: None,
            index: 0,
            mapped: 0,
            single_run: true,
            max_stamp: CLEAN_STAMP,
        }
    }

    /// Maps the next page to `frame` and returns its device address.
    fn map(&mut self, frame: Paddr) -> Result<Daddr> {
        if self.mapped == self.pages {
            return Err(Error::InvalidArgs);
        }
        let daddr = self.base + ((self.mapped as u64) << PAGE_SHIFT);

        let run = match self.run.take() {
            Some(run) if self.index < run.len() => run,
            exhausted => {
                if exhausted.is_some() {
                    self.single_run = false;
                }
                self.index = 0;
                let run = self
                    .domain
                    .table()
                    .get_contig(daddr, self.pages - self.mapped)?;
                if run.is_empty() {
                    return Err(Error::TableExhausted);
                }
                run
            }
        };

        let stamp = run.install(self.index, self.flags.encode(frame));
        self.max_stamp = self.max_stamp.max(stamp);
        self.index += 1;
        self.mapped += 1;
        self.run = Some(run);
        Ok(daddr)
    }

    fn into_cached_run(self) -> Option<PteRun> {
        self.run.filter(|_| self.single_run)
    }
}
