// SPDX-License-Identifier: MPL-2.0

//! DVMA: mapping scattered buffers for devices behind an IOMMU.
//!
//! A device sees memory through a [`Domain`], a device address space whose
//! translations live in a page table and are cached in the IOTLB. A driver
//! allocates a [`DmaHandle`] with the [`DeviceAttributes`] of its device and
//! binds buffers ([`DmaObject`]s) to it. Binding allocates device addresses,
//! writes the page-table entries and describes the buffer as a list of
//! [`Cookie`]s, the contiguous device address ranges that the device's
//! scatter/gather engine consumes. Buffers whose cookie lists exceed what the
//! device takes at once are handed out in [`Window`]s.
//!
//! IOTLB invalidation is deferred: unbinding stamps the cleared entries with
//! the flush generation of the domain, and only a later bind that reuses the
//! entries, with no flush in between, invalidates the IOTLB.
//!
//! # Example
//!
//! ```
//! use aster_dvma::{
//!     BindStatus, DeviceAttributes, DmaDirection, DmaHandle, DmaObject, Domain, DvmaConfig,
//!     IotlbInvalidator, PhysTranslator, WaitPolicy,
//! };
//!
//! struct Iotlb;
//!
//! impl IotlbInvalidator for Iotlb {
//!     fn invalidate_all(&self) {}
//!     fn invalidate_range(&self, _daddr: u64, _len: u64) {}
//! }
//!
//! struct Identity;
//!
//! impl PhysTranslator for Identity {
//!     fn virt_to_phys(&self, vaddr: usize) -> Option<u64> {
//!         Some(vaddr as u64)
//!     }
//! }
//!
//! let domain = Domain::with_range(DvmaConfig::default(), 0x1000..0x1000_0000, Box::new(Iotlb));
//! let mut handle =
//!     DmaHandle::allocate(&domain, DeviceAttributes::default(), WaitPolicy::NoWait).unwrap();
//!
//! let buffer = DmaObject::Virt { vaddr: 0x20_0000, len: 0x3000, mmu: &Identity };
//! let bound = handle
//!     .bind(&buffer, DmaDirection::ToDevice, WaitPolicy::NoWait)
//!     .unwrap();
//! assert_eq!(bound.status, BindStatus::FullyMapped);
//! assert_eq!(bound.first_window.len(), 1);
//!
//! handle.unbind().unwrap();
//! handle.free().unwrap();
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

mod attr;
mod config;
mod domain;
mod error;
mod flush;
mod handle;
mod iova;
mod object;
mod page_table;
mod stats;

pub use self::{
    attr::DeviceAttributes,
    config::DvmaConfig,
    domain::{Domain, FaultClass, HandleId, ResourceCallback, WaitPolicy},
    error::{Error, Result, UsageError},
    flush::{CLEAN_STAMP, FlushGeneration, IotlbInvalidator},
    handle::{BindStatus, Bound, Cookie, DmaDirection, DmaHandle, Window},
    iova::{IovaAllocator, IovaRequest, RangeIovaAllocator},
    object::{Backing, DmaObject, IoVector, PageNode, PhysTranslator},
    page_table::{
        LeafPageTable, NR_ENTRIES_PER_TABLE, PageTableService, PteFlags, PteRun, TablePage,
    },
    stats::DvmaStats,
};

/// The base-2 logarithm of the page size.
pub const PAGE_SHIFT: u32 = 12;
/// The size of a page in both the host and the device address space.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// A device (I/O virtual) address.
pub type Daddr = u64;
/// A physical address.
pub type Paddr = u64;
/// A host virtual address.
pub type Vaddr = usize;
