// SPDX-License-Identifier: MPL-2.0

//! Cookie construction.
//!
//! The bind engine feeds the device address of every mapped page piece to a
//! [`CookieBuilder`]. Pieces that are contiguous in the device address space
//! are merged into runs, and every run is cut into cookies that respect the
//! segment boundary and the largest cookie size of the device.
//!
//! A cut whose transfer offset is not a multiple of the granularity must not
//! become a window edge. Such cookies are chained to their successor, and a
//! window takes or leaves a whole chain.

use alloc::vec::Vec;

use align_ext::MultipleExt;
use log::trace;

use crate::{Daddr, Result, attr::Limits};

/// A device address range handed to the device for one segment of a
/// transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie {
    pub device_address: Daddr,
    pub length: u32,
}

impl Cookie {
    /// Returns the device address right after the cookie.
    pub fn end(&self) -> Daddr {
        self.device_address + self.length as u64
    }
}

/// The cookies of a transfer and the places where the transfer may be cut.
#[derive(Debug, Default)]
pub(crate) struct CookieList {
    cookies: Vec<Cookie>,
    /// Whether cookie `i` must stay in the same window as cookie `i + 1`.
    joins_next: Vec<bool>,
}

impl CookieList {
    /// Makes room for `additional` more cookies without reallocating.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        self.cookies.try_reserve(additional)?;
        self.joins_next.try_reserve(additional)?;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
        self.joins_next.clear();
    }

    pub fn as_slice(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// Returns the end (exclusive) of the chain of cookies that starts at
    /// `start`.
    pub fn chain_end(&self, start: usize) -> usize {
        let mut end = start;
        while end < self.joins_next.len() && self.joins_next[end] {
            end += 1;
        }
        (end + 1).min(self.cookies.len())
    }

    fn push(&mut self, cookie: Cookie, joins_next: bool) {
        trace!(
            "dvma: cookie {:#x}+{:#x}{}",
            cookie.device_address,
            cookie.length,
            if joins_next { " (chained)" } else { "" }
        );
        self.cookies.push(cookie);
        self.joins_next.push(joins_next);
    }
}

/// Returns how many cookies a transfer can be cut into at most.
///
/// `runs` is the number of device address runs the transfer is mapped to.
pub(crate) fn max_cookies(len: u64, span: u64, runs: usize, limits: &Limits) -> usize {
    let size_cuts = len / limits.max_cookie.max(1);
    let boundary_cuts = match limits.boundary {
        0 => 0,
        boundary => span / boundary + 1,
    };
    // Every cut may leave a chained remainder behind.
    2 * (runs + (size_cuts + boundary_cuts) as usize)
}

/// Builds the cookie list of one transfer.
pub(crate) struct CookieBuilder<'a> {
    list: &'a mut CookieList,
    limits: Limits,
    total: u64,
    /// The number of bytes already turned into cookies.
    emitted: u64,
    /// The run of contiguous device addresses not yet cut into cookies.
    pending: Option<(Daddr, u64)>,
}

impl<'a> CookieBuilder<'a> {
    /// Starts building the cookies of a transfer of `total` bytes into
    /// `list`, which is cleared.
    pub fn new(list: &'a mut CookieList, limits: Limits, total: u64) -> Self {
        debug_assert!(limits.max_cookie > 0);
        list.clear();
        Self {
            list,
            limits,
            total,
            emitted: 0,
            pending: None,
        }
    }

    /// Adds `len` bytes of the transfer that are mapped at `daddr`.
    pub fn push(&mut self, daddr: Daddr, len: u64) {
        if let Some((start, pending_len)) = &mut self.pending {
            if *start + *pending_len == daddr {
                *pending_len += len;
                return;
            }
        }
        if let Some((start, pending_len)) = self.pending.replace((daddr, len)) {
            self.cut(start, pending_len);
        }
    }

    /// Cuts the last run.
    pub fn finish(mut self) {
        if let Some((start, len)) = self.pending.take() {
            self.cut(start, len);
        }
        debug_assert_eq!(self.emitted, self.total);
    }

    /// Cuts a contiguous run into cookies.
    ///
    /// Each cookie is as long as the run, the room before the next segment
    /// boundary and the largest cookie size allow. A boundary always forces a
    /// cut. If a cut (other than at the end of the transfer) lands off the
    /// granularity, the cookie is shortened to the granularity and the
    /// shortfall becomes a remainder cookie chained to its successor.
    fn cut(&mut self, mut daddr: Daddr, mut remaining: u64) {
        let granularity = self.limits.granularity;

        while remaining > 0 {
            let len = remaining
                .min(self.limits.room_before_boundary(daddr))
                .min(self.limits.max_cookie);
            let end = self.emitted + len;
            let short = end.rem_of(granularity);

            if short == 0 || end == self.total {
                self.emit(daddr, len, false);
            } else {
                let aligned = len.saturating_sub(short);
                if aligned > 0 {
                    self.emit(daddr, aligned, false);
                }
                self.emit(daddr + aligned, len - aligned, true);
            }

            daddr += len;
            remaining -= len;
        }
    }

    fn emit(&mut self, daddr: Daddr, len: u64, joins_next: bool) {
        self.list.push(
            Cookie {
                device_address: daddr,
                length: len as u32,
            },
            joins_next,
        );
        self.emitted += len;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::DeviceAttributes;

    fn build(attrs: DeviceAttributes, pieces: &[(Daddr, u64)]) -> CookieList {
        let total = pieces.iter().map(|(_, len)| len).sum();
        let mut list = CookieList::default();
        let mut builder = CookieBuilder::new(&mut list, attrs.limits(), total);
        for &(daddr, len) in pieces {
            builder.push(daddr, len);
        }
        builder.finish();
        list
    }

    fn spans(list: &CookieList) -> Vec<(Daddr, u32)> {
        list.as_slice()
            .iter()
            .map(|c| (c.device_address, c.length))
            .collect()
    }

    #[test]
    fn contiguous_pieces_merge() {
        let list = build(
            DeviceAttributes::default(),
            &[(0x1800, 0x800), (0x2000, 0x1000), (0x3000, 0x10)],
        );
        assert_eq!(spans(&list), [(0x1800, 0x1810)]);
    }

    #[test]
    fn discontiguous_pieces_start_new_cookies() {
        let list = build(
            DeviceAttributes::default(),
            &[(0x1000, 0x800), (0x3000, 0x1000)],
        );
        assert_eq!(spans(&list), [(0x1000, 0x800), (0x3000, 0x1000)]);
    }

    #[test]
    fn size_limit_cuts() {
        let attrs = DeviceAttributes {
            max_cookie_size: 0x1000,
            ..Default::default()
        };
        let list = build(attrs, &[(0x1000, 0x2800)]);
        assert_eq!(
            spans(&list),
            [(0x1000, 0x1000), (0x2000, 0x1000), (0x3000, 0x800)]
        );
    }

    #[test]
    fn boundary_cuts() {
        let attrs = DeviceAttributes {
            segment_boundary: 0x1000,
            ..Default::default()
        };
        let list = build(attrs, &[(0x1c00, 0x1800)]);
        assert_eq!(spans(&list), [(0x1c00, 0x400), (0x2000, 0x1000), (0x3000, 0x400)]);
    }

    #[test]
    fn off_granularity_cuts_leave_chained_remainders() {
        let attrs = DeviceAttributes {
            segment_boundary: 0x1000,
            granularity: 0x200,
            ..Default::default()
        };
        let list = build(attrs, &[(0x1f00, 0x1400)]);
        // Both boundary cuts land 0x100 bytes off the granularity.
        assert_eq!(
            spans(&list),
            [(0x1f00, 0x100), (0x2000, 0xf00), (0x2f00, 0x100), (0x3000, 0x300)]
        );
        assert_eq!(list.chain_end(0), 2);
        assert_eq!(list.chain_end(1), 2);
        assert_eq!(list.chain_end(2), 4);
        assert_eq!(list.chain_end(3), 4);
    }

    #[test]
    fn off_granularity_cookies_are_shortened() {
        let attrs = DeviceAttributes {
            segment_boundary: 0x1000,
            granularity: 0x300,
            ..Default::default()
        };
        let list = build(attrs, &[(0x1000, 0x1400)]);
        // 0x1000 is not a multiple of 0x300: keep 0xf00, chain 0x100.
        assert_eq!(
            spans(&list),
            [(0x1000, 0xf00), (0x1f00, 0x100), (0x2000, 0x400)]
        );
        assert_eq!(list.chain_end(0), 1);
        assert_eq!(list.chain_end(1), 3);
    }

    #[test]
    fn worst_case_estimate_holds() {
        let attrs = DeviceAttributes {
            segment_boundary: 0x1000,
            granularity: 0x300,
            max_cookie_size: 0x1000,
            ..Default::default()
        };
        let list = build(attrs.clone(), &[(0x1100, 0x3000), (0x8000, 0x123)]);
        assert!(list.len() <= max_cookies(0x3123, 0x5000, 2, &attrs.limits()));
    }
}
