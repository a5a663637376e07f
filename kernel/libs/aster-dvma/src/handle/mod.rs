// SPDX-License-Identifier: MPL-2.0

//! DMA handles.
//!
//! A [`DmaHandle`] carries the attributes of one device and is bound to one
//! buffer at a time. Binding maps the buffer into the device address space
//! of the domain and describes it as a list of [`Cookie`]s. When the list is
//! longer than the device can consume at once, it is handed out in
//! [`Window`]s.

mod bind;
mod cookie;
mod fast;
mod unbind;
mod window;


use log::{debug, warn};

pub use self::{
    bind::{BindStatus, Bound},
    cookie::Cookie,
    window::Window,
};
use self::{cookie::CookieList, fast::FastRange, window::WindowCursor};
use crate::{
    Daddr, DeviceAttributes, Domain, Error, PAGE_SHIFT, Result, UsageError, WaitPolicy,
    attr::Limits,
    domain::HandleId,
    page_table::{PteFlags, PteRun},
};

/// The number of cookies a handle has room for when it is allocated.
const PREALLOC_COOKIES: usize = 16;

/// The direction of the transfers of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// The device reads the buffer.
    ToDevice,
    /// The device writes the buffer.
    FromDevice,
    /// The device reads and writes the buffer.
    Bidirectional,
}

impl DmaDirection {
    fn pte_flags(self) -> PteFlags {
        match self {
            DmaDirection::ToDevice => PteFlags::READ,
            DmaDirection::FromDevice => PteFlags::WRITE,
            DmaDirection::Bidirectional => PteFlags::READ | PteFlags::WRITE,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Mapping {
    daddr: Daddr,
    pages: usize,
    via: MappedVia,
}

#[derive(Debug)]
pub(crate) enum MappedVia {
    FastRange,
    /// The addresses came from the allocator. The run of slots is kept if a
    /// single run covers the whole range.
    Allocated { run: Option<PteRun> },
}

/// A handle for the DMA transfers of one device.
///
/// The handle borrows its domain. Binds and unbinds of one handle are
/// serialized by `&mut self`; handles of the same domain can be used
/// concurrently.
pub struct DmaHandle<'d> {
    domain: &'d Domain,
    id: HandleId,
    attrs: DeviceAttributes,
    limits: Limits,
    /// Invalidates the IOTLB at every mapping change.
    strict: bool,
    cookies: CookieList,
    mapping: Option<Mapping>,
    cursor: WindowCursor,
    window_count: usize,
    fast: Option<FastRange>,
}

impl<'d> DmaHandle<'d> {
    /// Allocates a handle for a device with `attrs` in `domain`.
    ///
    /// Fails with [`Error::IncompatibleConfig`] if the domain checks
    /// attributes and `attrs` are invalid, or with [`Error::NoResources`] if
    /// memory for the handle cannot be allocated under `policy`.
    pub fn allocate(
        domain: &'d Domain,
        attrs: DeviceAttributes,
        policy: WaitPolicy,
    ) -> Result<Self> {
        if domain.config().check_attrs {
            attrs.validate().inspect_err(|_| {
                warn!("dvma: rejected device attributes {:?}", attrs);
            })?;
        }

        let limits = attrs.limits();
        let mut cookies = CookieList::default();
        domain.with_policy(policy, || {
            cookies.reserve(PREALLOC_COOKIES.min(limits.max_cookie_count))
        })?;

        let handle = Self {
            domain,
            id: domain.alloc_handle_id(),
            strict: attrs.strict_flush || domain.config().strict_flush,
            attrs,
            limits,
            cookies,
            mapping: None,
            cursor: WindowCursor::default(),
            window_count: 0,
            fast: None,
        };
        domain.counters().active_handles.inc();
        debug!("dvma: allocated handle {}", handle.id.as_u64());
        Ok(handle)
    }

    /// Frees the handle.
    ///
    /// A handle must be unbound before it is freed. A bound handle is
    /// unbound and freed anyway, but the misuse is reported.
    pub fn free(mut self) -> Result<()> {
        if self.mapping.is_some() {
            warn!("dvma: handle {} freed while bound", self.id.as_u64());
            self.unbind()?;
            return Err(UsageError::FreeWhileBound.into());
        }
        Ok(())
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn attributes(&self) -> &DeviceAttributes {
        &self.attrs
    }

    pub fn is_bound(&self) -> bool {
        self.mapping.is_some()
    }

    /// Returns all cookies of the bound buffer.
    pub fn cookies(&self) -> &[Cookie] {
        self.cookies.as_slice()
    }

    /// Returns the number of windows of the bound buffer, or zero.
    pub fn window_count(&self) -> usize {
        self.window_count
    }

    /// Returns the index of the window handed out last.
    pub fn current_window(&self) -> Option<usize> {
        self.cursor.current()
    }

    /// Returns the first device address and the page count of the mapping.
    pub fn mapped_range(&self) -> Option<(Daddr, usize)> {
        self.mapping
            .as_ref()
            .map(|mapping| (mapping.daddr, mapping.pages))
    }

    /// Returns whether a fault at `daddr` hits the mapping of this handle.
    pub fn is_fault_in_span(&self, daddr: Daddr) -> bool {
        self.mapping.as_ref().is_some_and(|mapping| {
            let span = (mapping.pages as u64) << PAGE_SHIFT;
            daddr >= mapping.daddr && daddr - mapping.daddr < span
        })
    }

    /// Returns window `index` of the bound buffer.
    ///
    /// Asking for the window after the current one is cheap; any other
    /// window is found by walking the cookies from the start.
    pub fn window(&mut self, index: usize) -> Result<Window<'_>> {
        if self.mapping.is_none() {
            return Err(UsageError::NotBound.into());
        }
        if index >= self.window_count {
            return Err(Error::OutOfRange);
        }
        let extent = self.cursor.seek(index, &self.cookies, &self.limits)?;
        Ok(extent.to_window(&self.cookies))
    }
}

impl Drop for DmaHandle<'_> {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            warn!("dvma: handle {} dropped while bound", self.id.as_u64());
            self.retire(mapping);
        }
        if let Some(fast) = self.fast.take() {
            fast.release(self.domain);
        }
        self.domain.counters().active_handles.dec();
        debug!("dvma: freed handle {}", self.id.as_u64());
        self.domain.resources_released();
    }
}

impl core::fmt::Debug for DmaHandle<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaHandle")
            .field("id", &self.id)
            .field("mapping", &self.mapping)
            .field("cookies", &self.cookies.len())
            .field("window_count", &self.window_count)
            .finish_non_exhaustive()
    }
}
