// SPDX-License-Identifier: MPL-2.0

//! The unbind engine.

use core::sync::atomic::{Ordering, fence};

use log::{debug, warn};

use super::{DmaHandle, MappedVia, Mapping};
use crate::{
    Daddr, Domain, PAGE_SHIFT, Result, UsageError, flush::CLEAN_STAMP, page_table::PteRun,
};

impl DmaHandle<'_> {
    /// Removes the mapping of the bound buffer.
    ///
    /// The IOTLB is not invalidated unless the handle is strict; the slots of
    /// the mapping are stamped instead, so the bind that reuses them can tell
    /// whether it must flush.
    pub fn unbind(&mut self) -> Result<()> {
        let Some(mapping) = self.mapping.take() else {
            warn!("dvma: handle {} unbound while not bound", self.id.as_u64());
            return Err(UsageError::NotBound.into());
        };
        self.retire(mapping);
        Ok(())
    }

    pub(super) fn retire(&mut self, mapping: Mapping) {
        let domain = self.domain;
        domain.untrack(mapping.daddr);

        match mapping.via {
            MappedVia::FastRange => {
                if let Some(fast) = self.fast.as_mut() {
                    fast.retire(domain);
                }
            }
            MappedVia::Allocated { run } => {
                clear_entries(domain, run.as_ref(), mapping.daddr, mapping.pages, self.strict);
                domain
                    .iova()
                    .free(mapping.daddr, (mapping.pages as u64) << PAGE_SHIFT);
            }
        }

        self.cookies.clear();
        self.cursor.rewind();
        self.window_count = 0;
        domain.counters().active_binds.dec();
        debug!(
            "dvma: handle {} unbound {:#x} ({} pages)",
            self.id.as_u64(),
            mapping.daddr,
            mapping.pages
        );
        domain.resources_released();
    }
}

/// Clears the entries of `pages` pages at `daddr` and stamps their slots.
///
/// `cached` is the run of the whole range, if the bind kept it. Strict
/// mappings are invalidated right away and stamped clean. Returns the stamp.
pub(super) fn clear_entries(
    domain: &Domain,
    cached: Option<&PteRun>,
    daddr: Daddr,
    pages: usize,
    strict: bool,
) -> u64 {
    for_each_run(domain, cached, daddr, pages, |run, len| {
        for index in 0..len {
            run.clear(index);
        }
    });
    // Order the cleared entries before the generation read below.
    fence(Ordering::SeqCst);

    let stamp = if strict {
        domain.flush_range(daddr, (pages as u64) << PAGE_SHIFT);
        CLEAN_STAMP
    } else {
        domain.generation().stamp()
    };
    for_each_run(domain, cached, daddr, pages, |run, len| {
        for index in 0..len {
            run.stamp(index, stamp);
        }
    });
    stamp
}

/// Calls `f` with every run of slots of the range, and the number of slots
/// of the run that belong to the range.
fn for_each_run(
    domain: &Domain,
    cached: Option<&PteRun>,
    daddr: Daddr,
    pages: usize,
    mut f: impl FnMut(&PteRun, usize),
) {
    if let Some(run) = cached {
        debug_assert!(run.len() >= pages);
        f(run, pages.min(run.len()));
        return;
    }

    let mut done = 0;
    while done < pages {
        let at = daddr + ((done as u64) << PAGE_SHIFT);
        let Some(run) = domain.table().lookup_contig(at, pages - done) else {
            warn!("dvma: no table page for mapped address {:#x}", at);
            return;
        };
        if run.is_empty() {
            return;
        }
        let len = run.len().min(pages - done);
        f(&run, len);
        done += len;
    }
}
