// SPDX-License-Identifier: MPL-2.0

//! Device DMA attributes.

use align_ext::{AlignExt, MultipleExt};

use crate::{Daddr, Error, PAGE_SIZE, Result};

/// The DMA capabilities and restrictions of a device.
///
/// The attributes are supplied by the device driver when it allocates a
/// [`DmaHandle`] and stay fixed for the lifetime of the handle.
///
/// [`DmaHandle`]: crate::DmaHandle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttributes {
    /// The lowest device address the device can generate.
    pub addr_lo: Daddr,
    /// The highest device address the device can generate (inclusive).
    pub addr_hi: Daddr,
    /// The alignment of the device address range, a power of two.
    pub alignment: u64,
    /// A power-of-two device address boundary no cookie may cross.
    ///
    /// Zero means the device has no such restriction.
    pub segment_boundary: u64,
    /// The byte multiple every transfer segment except the last one must
    /// respect. It need not be a power of two.
    pub granularity: u64,
    /// The largest length of a single cookie.
    pub max_cookie_size: u64,
    /// The largest number of bytes the device can transfer in one window.
    pub max_transfer_size: u64,
    /// The largest number of cookies the device can consume in one window.
    pub max_cookie_count: usize,
    /// Invalidates the IOTLB synchronously for every mapping change.
    pub strict_flush: bool,
    /// The device has no scatter/gather count or transfer size limit.
    ///
    /// Transfers on such devices are never split into windows.
    pub no_limit: bool,
    /// The buffer offset must honor [`Self::alignment`] at bind time.
    pub alignment_required: bool,
}

impl Default for DeviceAttributes {
    fn default() -> Self {
        Self {
            addr_lo: 0,
            addr_hi: u64::MAX,
            alignment: 1,
            segment_boundary: 0,
            granularity: 1,
            max_cookie_size: u32::MAX as u64,
            max_transfer_size: u64::MAX,
            max_cookie_count: usize::MAX,
            strict_flush: false,
            no_limit: false,
            alignment_required: false,
        }
    }
}

impl DeviceAttributes {
    /// Checks that the attributes describe a device that can be served.
    pub fn validate(&self) -> Result<()> {
        let page_size = PAGE_SIZE as u64;

        if self.addr_hi <= self.addr_lo {
            return Err(Error::IncompatibleConfig);
        }
        self.check_bindable()?;
        if self.segment_boundary != 0 && self.segment_boundary < page_size {
            return Err(Error::IncompatibleConfig);
        }
        if self.granularity == 0 || self.granularity > page_size {
            return Err(Error::IncompatibleConfig);
        }
        // The device must be able to reach every byte offset of a page.
        if self.max_cookie_size < page_size || self.max_transfer_size < page_size {
            return Err(Error::IncompatibleConfig);
        }
        if self.max_cookie_count == 0 {
            return Err(Error::IncompatibleConfig);
        }
        Ok(())
    }

    /// Checks the attributes that binding cannot work without.
    ///
    /// Binds run this even when the domain does not validate attributes at
    /// allocation.
    pub(crate) fn check_bindable(&self) -> Result<()> {
        if !self.alignment.is_power_of_two() {
            return Err(Error::IncompatibleConfig);
        }
        if self.segment_boundary != 0
            && (!self.segment_boundary.is_power_of_two() || self.segment_boundary < 2)
        {
            return Err(Error::IncompatibleConfig);
        }
        Ok(())
    }

    /// Returns the allocation alignment of the device address range.
    pub(crate) fn daddr_alignment(&self) -> u64 {
        self.alignment.max(PAGE_SIZE as u64)
    }

    /// Returns whether the attributes allow binding through the fast path.
    pub(crate) fn fast_path_compatible(&self) -> bool {
        self.segment_boundary == 0 && self.alignment <= PAGE_SIZE as u64 && !self.strict_flush
    }

    pub(crate) fn limits(&self) -> Limits {
        let granularity = self.granularity.max(1);
        let max_transfer = if self.no_limit {
            u64::MAX
        } else {
            self.max_transfer_size.round_down_to(granularity)
        };
        let max_cookie = self
            .max_cookie_size
            .min(max_transfer)
            .min(u32::MAX as u64)
            .round_down_to(granularity);

        Limits {
            max_cookie,
            max_transfer,
            max_cookie_count: if self.no_limit {
                usize::MAX
            } else {
                self.max_cookie_count
            },
            boundary: self.segment_boundary,
            granularity,
        }
    }
}

/// Limits derived from [`DeviceAttributes`] that the bind engine works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Limits {
    /// The largest cookie, a multiple of the granularity.
    pub max_cookie: u64,
    /// The largest window, a multiple of the granularity.
    pub max_transfer: u64,
    pub max_cookie_count: usize,
    pub boundary: u64,
    pub granularity: u64,
}

impl Limits {
    /// Returns the number of bytes from `daddr` to the next segment boundary.
    pub(crate) fn room_before_boundary(&self, daddr: Daddr) -> u64 {
        if self.boundary == 0 {
            u64::MAX
        } else {
            daddr.distance_to_boundary(self.boundary)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(DeviceAttributes::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_attributes() {
        let bad = [
            DeviceAttributes {
                addr_hi: 0,
                ..Default::default()
            },
            DeviceAttributes {
                segment_boundary: 0x3000,
                ..Default::default()
            },
            DeviceAttributes {
                segment_boundary: 0x800,
                ..Default::default()
            },
            DeviceAttributes {
                granularity: 0,
                ..Default::default()
            },
            DeviceAttributes {
                granularity: 0x2000,
                ..Default::default()
            },
            DeviceAttributes {
                max_cookie_size: 512,
                ..Default::default()
            },
            DeviceAttributes {
                max_cookie_count: 0,
                ..Default::default()
            },
            DeviceAttributes {
                alignment: 24,
                ..Default::default()
            },
        ];
        for attrs in bad {
            assert_eq!(attrs.validate(), Err(Error::IncompatibleConfig), "{:?}", attrs);
        }
    }

    #[test]
    fn bind_checks_only_what_binding_needs() {
        let small_boundary = DeviceAttributes {
            segment_boundary: 0x800,
            ..Default::default()
        };
        assert_eq!(small_boundary.check_bindable(), Ok(()));

        for segment_boundary in [1, 0x3000] {
            let attrs = DeviceAttributes {
                segment_boundary,
                ..Default::default()
            };
            assert_eq!(attrs.check_bindable(), Err(Error::IncompatibleConfig));
        }
        let attrs = DeviceAttributes {
            alignment: 24,
            ..Default::default()
        };
        assert_eq!(attrs.check_bindable(), Err(Error::IncompatibleConfig));
    }

    #[test]
    fn limits_respect_granularity() {
        let attrs = DeviceAttributes {
            granularity: 512,
            max_cookie_size: 0x1100,
            max_transfer_size: 0x2300,
            ..Default::default()
        };
        let limits = attrs.limits();
        assert_eq!(limits.max_transfer, 0x2200);
        assert_eq!(limits.max_cookie, 0x1000);
    }

    #[test]
    fn no_limit_disables_window_limits() {
        let attrs = DeviceAttributes {
            max_cookie_size: 0x2000,
            max_transfer_size: 0x1000,
            max_cookie_count: 1,
            no_limit: true,
            ..Default::default()
        };
        let limits = attrs.limits();
        assert_eq!(limits.max_cookie, 0x2000);
        assert_eq!(limits.max_cookie_count, usize::MAX);
    }

    #[test]
    fn boundary_room() {
        let limits = DeviceAttributes {
            segment_boundary: 0x1000,
            ..Default::default()
        }
        .limits();
        assert_eq!(limits.room_before_boundary(0x1800), 0x800);
        assert_eq!(limits.room_before_boundary(0x2000), 0x1000);
    }
}
