// SPDX-License-Identifier: MPL-2.0

//! The last-level page table that translates device addresses.
//!
//! Every entry slot has a parallel timestamp slot. While an entry is zero its
//! timestamp records the flush generation at the time the entry was cleared,
//! so that the slot is not handed to a new mapping before the IOTLB has been
//! invalidated past that generation.

use alloc::{collections::btree_map::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::{Daddr, Error, PAGE_SHIFT, Paddr, Result};

/// The number of entries in one table page.
pub const NR_ENTRIES_PER_TABLE: usize = 512;

bitflags! {
    /// The access rights encoded in a page-table entry.
    pub struct PteFlags: u64 {
        /// The entry maps a page.
        const PRESENT = 1 << 0;
        /// The device may read the page.
        const READ    = 1 << 1;
        /// The device may write the page.
        const WRITE   = 1 << 2;
    }
}

impl PteFlags {
    /// Encodes an entry that maps the page at `frame`.
    pub fn encode(self, frame: Paddr) -> u64 {
        debug_assert_eq!(frame & ((1 << PAGE_SHIFT) - 1), 0);
        frame | (self | PteFlags::PRESENT).bits()
    }

    /// Decodes the physical page address of an entry.
    pub fn frame_of(entry: u64) -> Paddr {
        entry & !((1 << PAGE_SHIFT) - 1)
    }
}

/// One page of entry slots and their timestamp slots.
pub struct TablePage {
    entries: Vec<AtomicU64>,
    stamps: Vec<AtomicU64>,
}

impl TablePage {
    /// Creates a table page whose slots are all zero.
    pub fn new() -> Self {
        Self {
            entries: (0..NR_ENTRIES_PER_TABLE).map(|_| AtomicU64::new(0)).collect(),
            stamps: (0..NR_ENTRIES_PER_TABLE).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl Default for TablePage {
    fn default() -> Self {
        Self::new()
    }
}

/// A run of consecutive entry slots that lie in one table page.
///
/// The run keeps its table page alive, so it can be cached by a handle and
/// used again at unbind time without walking the table.
#[derive(Clone)]
pub struct PteRun {
    daddr: Daddr,
    page: Arc<TablePage>,
    first: usize,
    len: usize,
}

impl core::fmt::Debug for PteRun {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PteRun")
            .field("daddr", &self.daddr)
            .field("len", &self.len)
            .finish()
    }
}

impl PteRun {
    /// Creates a run of `len` slots starting at slot `first` of `page`.
    ///
    /// # Panics
    ///
    /// Panics if the slots are not all in the page.
    pub fn new(daddr: Daddr, page: Arc<TablePage>, first: usize, len: usize) -> Self {
        assert!(first + len <= page.entries.len());
        Self {
            daddr,
            page,
            first,
            len,
        }
    }

    /// Returns the device address mapped by the first slot.
    pub fn daddr(&self) -> Daddr {
        self.daddr
    }

    /// Returns the number of slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the run has no slots.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the entry slots.
    pub fn entries(&self) -> &[AtomicU64] {
        &self.page.entries[self.first..self.first + self.len]
    }

    /// Returns the timestamp slots, index-aligned with [`Self::entries`].
    pub fn stamps(&self) -> &[AtomicU64] {
        &self.page.stamps[self.first..self.first + self.len]
    }

    /// Writes entry `index` and returns the timestamp of its previous
    /// occupant.
    pub fn install(&self, index: usize, entry: u64) -> u64 {
        debug_assert_eq!(self.entries()[index].load(Ordering::Relaxed), 0);
        self.entries()[index].store(entry, Ordering::Release);
        self.stamps()[index].load(Ordering::Relaxed)
    }

    /// Clears entry `index`.
    ///
    /// The slot must be stamped with [`Self::stamp`] before it is released.
    pub fn clear(&self, index: usize) {
        self.entries()[index].store(0, Ordering::Release);
    }

    /// Records the generation a flush must pass before slot `index` is
    /// reused.
    pub fn stamp(&self, index: usize, generation: u64) {
        debug_assert_eq!(self.entries()[index].load(Ordering::Relaxed), 0);
        self.stamps()[index].store(generation, Ordering::Relaxed);
    }
}

/// The page-table service of a domain.
///
/// Implementations are shared by all handles of a domain and synchronize
/// internally.
pub trait PageTableService: Send + Sync {
    /// Returns how many entries a single run can cover at most.
    fn contig_pages(&self) -> usize;

    /// Returns the run of slots for `daddr`, allocating table pages as
    /// needed.
    ///
    /// The run covers at most `max_pages` slots; it is shorter when the
    /// slots continue in another table page.
    fn get_contig(&self, daddr: Daddr, max_pages: usize) -> Result<PteRun>;

    /// Returns the run of slots for `daddr` if its table page exists.
    fn lookup_contig(&self, daddr: Daddr, max_pages: usize) -> Option<PteRun>;
}

/// A single-level, in-memory page table.
///
/// Table pages are allocated on first use and never freed.
pub struct LeafPageTable {
    pages: Mutex<BTreeMap<u64, Arc<TablePage>>>,
    max_table_pages: usize,
}

impl LeafPageTable {
    /// Creates an empty page table.
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Creates an empty page table that can hold at most `max_table_pages`
    /// table pages.
    pub fn with_limit(max_table_pages: usize) -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
            max_table_pages,
        }
    }

    /// Returns the entry that maps `daddr`, or zero.
    pub fn entry(&self, daddr: Daddr) -> u64 {
        self.lookup_contig(daddr, 1)
            .map_or(0, |run| run.entries()[0].load(Ordering::Acquire))
    }

    /// Translates `daddr` to the physical address it maps, if any.
    pub fn translate(&self, daddr: Daddr) -> Option<Paddr> {
        let entry = self.entry(daddr);
        (entry != 0).then(|| PteFlags::frame_of(entry) + (daddr & ((1 << PAGE_SHIFT) - 1)))
    }

    /// Counts the live entries in the page range `daddr..daddr + pages`.
    pub fn count_live(&self, daddr: Daddr, pages: usize) -> usize {
        (0..pages as u64)
            .filter(|&i| self.entry(daddr + (i << PAGE_SHIFT)) != 0)
            .count()
    }

    fn locate(daddr: Daddr, max_pages: usize) -> (u64, usize, usize) {
        let pfn = daddr >> PAGE_SHIFT;
        let table = pfn / NR_ENTRIES_PER_TABLE as u64;
        let first = (pfn % NR_ENTRIES_PER_TABLE as u64) as usize;
        (table, first, max_pages.min(NR_ENTRIES_PER_TABLE - first))
    }
}

impl Default for LeafPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTableService for LeafPageTable {
    fn contig_pages(&self) -> usize {
        NR_ENTRIES_PER_TABLE
    }

    fn get_contig(&self, daddr: Daddr, max_pages: usize) -> Result<PteRun> {
        let (table, first, len) = Self::locate(daddr, max_pages);
        let mut pages = self.pages.lock();
        let page = match pages.get(&table) {
            Some(page) => page.clone(),
            None => {
                if pages.len() >= self.max_table_pages {
                    return Err(Error::TableExhausted);
                }
                let page = Arc::new(TablePage::new());
                pages.insert(table, page.clone());
                page
            }
        };
        Ok(PteRun::new(daddr, page, first, len))
    }

    fn lookup_contig(&self, daddr: Daddr, max_pages: usize) -> Option<PteRun> {
        let (table, first, len) = Self::locate(daddr, max_pages);
        let page = self.pages.lock().get(&table)?.clone();
        Some(PteRun::new(daddr, page, first, len))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::PAGE_SIZE;

    #[test]
    fn runs_stop_at_table_pages() {
        let table = LeafPageTable::new();
        let daddr = (NR_ENTRIES_PER_TABLE as u64 - 2) << PAGE_SHIFT;
        let run = table.get_contig(daddr, 8).unwrap();
        assert_eq!(run.len(), 2);
        let next = table.get_contig(daddr + 2 * PAGE_SIZE as u64, 6).unwrap();
        assert_eq!(next.len(), 6);
        assert!(table.lookup_contig(1 << 40, 1).is_none());
    }

    #[test]
    fn install_and_clear() {
        let table = LeafPageTable::new();
        let run = table.get_contig(0x5000, 1).unwrap();
        let entry = (PteFlags::READ | PteFlags::WRITE).encode(0xabc000);
        assert_eq!(run.install(0, entry), 0);
        assert_eq!(table.translate(0x5123), Some(0xabc123));

        run.clear(0);
        run.stamp(0, 7);
        assert_eq!(table.translate(0x5123), None);
        assert_eq!(run.install(0, entry), 7);
    }

    #[test]
    fn limited_tables_are_exhausted() {
        let table = LeafPageTable::with_limit(1);
        table.get_contig(0, 1).unwrap();
        assert!(matches!(
            table.get_contig(1 << 30, 1),
            Err(Error::TableExhausted)
        ));
    }

    #[test]
    fn encoded_entries_are_never_zero() {
        assert_ne!(PteFlags::empty().encode(0), 0);
        assert_eq!(PteFlags::frame_of(PteFlags::READ.encode(0x7000)), 0x7000);
    }
}
