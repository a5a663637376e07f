// SPDX-License-Identifier: MPL-2.0

//! Partitioning of long cookie lists into windows.
//!
//! A window holds as many whole cookie chains as the scatter/gather count and
//! the transfer size of the device allow. Windows are normally taken in
//! order; any other request restarts from the first cookie.

use log::trace;

use super::cookie::{Cookie, CookieList};
use crate::{Error, Result, attr::Limits};

/// A part of a transfer that the device can consume at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window<'a> {
    pub index: usize,
    pub cookies: &'a [Cookie],
    /// The byte offset of the window into the transfer.
    pub offset: u64,
    /// The number of bytes the window covers.
    pub length: u64,
}

/// The cookies of a window, as indices into the cookie list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowExtent {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub offset: u64,
    pub length: u64,
}

impl WindowExtent {
    pub fn to_window(self, cookies: &CookieList) -> Window<'_> {
        Window {
            index: self.index,
            cookies: &cookies.as_slice()[self.start..self.end],
            offset: self.offset,
            length: self.length,
        }
    }
}

/// The position of a handle in its window sequence.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WindowCursor {
    /// The window returned last.
    current: Option<usize>,
    next_cookie: usize,
    next_offset: u64,
}

impl WindowCursor {
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn rewind(&mut self) {
        *self = Self::default();
    }

    /// Returns whether every cookie has been handed out.
    fn is_done(&self, cookies: &CookieList) -> bool {
        self.next_cookie >= cookies.len()
    }

    /// Takes the window that follows the current one.
    ///
    /// Fails with [`Error::IncompatibleConfig`] if the next cookie chain does
    /// not fit even an empty window.
    pub fn advance(&mut self, cookies: &CookieList, limits: &Limits) -> Result<WindowExtent> {
        if self.is_done(cookies) {
            return Err(Error::OutOfRange);
        }

        let start = self.next_cookie;
        let mut end = start;
        let mut length = 0u64;
        while end < cookies.len() {
            let chain_end = cookies.chain_end(end);
            let chain_len: u64 = cookies.as_slice()[end..chain_end]
                .iter()
                .map(|cookie| cookie.length as u64)
                .sum();
            if chain_end - start > limits.max_cookie_count
                || length + chain_len > limits.max_transfer
            {
                break;
            }
            length += chain_len;
            end = chain_end;
        }
        if end == start {
            return Err(Error::IncompatibleConfig);
        }

        let extent = WindowExtent {
            index: self.current.map_or(0, |index| index + 1),
            start,
            end,
            offset: self.next_offset,
            length,
        };
        trace!(
            "dvma: window {} covers cookies {}..{} ({:#x} bytes at {:#x})",
            extent.index, start, end, length, extent.offset
        );

        self.current = Some(extent.index);
        self.next_cookie = end;
        self.next_offset += length;
        Ok(extent)
    }

    /// Moves to window `index`.
    ///
    /// The next window is taken directly. Any other window is reached by
    /// walking again from the first one.
    pub fn seek(
        &mut self,
        index: usize,
        cookies: &CookieList,
        limits: &Limits,
    ) -> Result<WindowExtent> {
        let next = self.current.map_or(0, |current| current + 1);
        if index != next {
            self.rewind();
            for _ in 0..index {
                self.advance(cookies, limits)?;
            }
        }
        self.advance(cookies, limits)
    }
}

/// Counts the windows of `cookies`.
pub(crate) fn count_windows(cookies: &CookieList, limits: &Limits) -> Result<usize> {
    let mut cursor = WindowCursor::default();
    let mut count = 0;
    while !cursor.is_done(cookies) {
        cursor.advance(cookies, limits)?;
        count += 1;
    }
    Ok(count)
}
