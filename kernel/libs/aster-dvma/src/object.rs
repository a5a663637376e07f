// SPDX-License-Identifier: MPL-2.0

//! Descriptions of the memory buffers that can be bound for DMA.
//!
//! Whatever the shape of a buffer, the bind engine only sees it through
//! [`PageChunks`], which yields the buffer one physical page piece at a time.

use align_ext::AlignExt;

use crate::{Error, PAGE_SIZE, Paddr, Result, Vaddr};

/// The host MMU service that translates virtual addresses.
pub trait PhysTranslator: Sync {
    /// Returns the physical address backing `vaddr`, if it is mapped.
    fn virt_to_phys(&self, vaddr: Vaddr) -> Option<Paddr>;
}

/// A node of a singly-linked list of physical pages.
#[derive(Debug, Clone, Copy)]
pub struct PageNode<'a> {
    /// The page-aligned physical address of the page.
    pub paddr: Paddr,
    /// The next page of the buffer.
    pub next: Option<&'a PageNode<'a>>,
}

/// The memory that backs one contiguous piece of a buffer.
#[derive(Debug, Clone, Copy)]
pub enum Backing<'a> {
    /// Virtually contiguous memory that is translated page by page.
    Virt {
        /// The start of the memory.
        vaddr: Vaddr,
        /// The translator of the address space that `vaddr` belongs to.
        mmu: &'a dyn PhysTranslator,
    },
    /// An array of page-aligned physical addresses.
    PageArray(&'a [Paddr]),
    /// A linked list of physical pages.
    PageList(&'a PageNode<'a>),
}

/// One independently addressed piece of a multi-vector buffer.
#[derive(Debug, Clone, Copy)]
pub struct IoVector<'a> {
    /// The byte offset of the piece into its backing memory.
    pub offset: usize,
    /// The length of the piece in bytes.
    pub len: usize,
    /// The memory that backs the piece.
    pub backing: Backing<'a>,
}

/// A buffer to be bound for DMA.
#[derive(Debug, Clone, Copy)]
pub enum DmaObject<'a> {
    /// A virtual address range.
    Virt {
        vaddr: Vaddr,
        len: usize,
        mmu: &'a dyn PhysTranslator,
    },
    /// An explicit array of physical pages, starting `offset` bytes into the
    /// first page of the array.
    PageArray {
        pages: &'a [Paddr],
        offset: usize,
        len: usize,
    },
    /// An explicit list of physical pages, starting `offset` bytes into the
    /// first page of the list.
    PageList {
        head: &'a PageNode<'a>,
        offset: usize,
        len: usize,
    },
    /// A list of independently addressed pieces.
    Vectors(&'a [IoVector<'a>]),
}

impl core::fmt::Debug for dyn PhysTranslator + '_ {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("PhysTranslator")
    }
}

/// The size of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Extent {
    /// The number of bytes.
    pub len: u64,
    /// The number of device pages needed to map the bytes.
    pub pages: usize,
    /// The offset of the first byte into its page.
    pub first_offset: usize,
}

impl<'a> DmaObject<'a> {
    fn nr_segments(&self) -> usize {
        match self {
            DmaObject::Vectors(vectors) => vectors.len(),
            _ => 1,
        }
    }

    fn segment(&self, index: usize) -> Option<IoVector<'a>> {
        match *self {
            DmaObject::Vectors(vectors) => vectors.get(index).copied(),
            _ if index > 0 => None,
            DmaObject::Virt { vaddr, len, mmu } => Some(IoVector {
                offset: 0,
                len,
                backing: Backing::Virt { vaddr, mmu },
            }),
            DmaObject::PageArray { pages, offset, len } => Some(IoVector {
                offset,
                len,
                backing: Backing::PageArray(pages),
            }),
            DmaObject::PageList { head, offset, len } => Some(IoVector {
                offset,
                len,
                backing: Backing::PageList(head),
            }),
        }
    }

    /// Computes the length and the page count of the buffer.
    ///
    /// Empty buffers are rejected.
    pub(crate) fn extent(&self) -> Result<Extent> {
        let mut len = 0u64;
        let mut pages = 0usize;
        let mut first_offset = None;

        for index in 0..self.nr_segments() {
            let Some(segment) = self.segment(index) else {
                break;
            };
            if segment.len == 0 {
                continue;
            }
            let in_page = segment.page_offset();
            first_offset.get_or_insert(in_page);
            let span = in_page
                .checked_add(segment.len)
                .ok_or(Error::InvalidArgs)?
                .align_up(PAGE_SIZE);
            pages = pages
                .checked_add(span / PAGE_SIZE)
                .ok_or(Error::InvalidArgs)?;
            len += segment.len as u64;
        }

        match first_offset {
            Some(first_offset) => Ok(Extent {
                len,
                pages,
                first_offset,
            }),
            None => Err(Error::InvalidArgs),
        }
    }

    /// Returns the physical-extent producer of the buffer.
    pub(crate) fn chunks(&self) -> PageChunks<'a> {
        PageChunks {
            object: *self,
            next_segment: 0,
            cursor: None,
        }
    }
}

impl IoVector<'_> {
    fn page_offset(&self) -> usize {
        match self.backing {
            Backing::Virt { vaddr, .. } => vaddr.wrapping_add(self.offset) % PAGE_SIZE,
            Backing::PageArray(_) | Backing::PageList(_) => self.offset % PAGE_SIZE,
        }
    }
}

/// A piece of a buffer that lies within one physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageChunk {
    /// The page-aligned physical address of the page.
    pub frame: Paddr,
    /// The offset of the piece into the page.
    pub offset: usize,
    /// The length of the piece.
    pub len: usize,
}

/// Produces the physical pages of a buffer in order.
pub(crate) struct PageChunks<'a> {
    object: DmaObject<'a>,
    next_segment: usize,
    cursor: Option<SegmentCursor<'a>>,
}

struct SegmentCursor<'a> {
    frames: FrameSource<'a>,
    in_page: usize,
    remaining: usize,
}

enum FrameSource<'a> {
    Virt {
        next_vaddr: Vaddr,
        mmu: &'a dyn PhysTranslator,
    },
    Array {
        pages: &'a [Paddr],
        index: usize,
    },
    List {
        node: Option<&'a PageNode<'a>>,
    },
}

impl FrameSource<'_> {
    fn next_frame(&mut self) -> Result<Paddr> {
        let paddr = match self {
            FrameSource::Virt { next_vaddr, mmu } => {
                let paddr = mmu.virt_to_phys(*next_vaddr).ok_or(Error::InvalidArgs)?;
                *next_vaddr = next_vaddr.wrapping_add(PAGE_SIZE);
                paddr
            }
            FrameSource::Array { pages, index } => {
                let paddr = *pages.get(*index).ok_or(Error::InvalidArgs)?;
                *index += 1;
                paddr
            }
            FrameSource::List { node } => {
                let current = node.ok_or(Error::InvalidArgs)?;
                *node = current.next;
                current.paddr
            }
        };
        Ok(paddr.align_down(PAGE_SIZE as u64))
    }
}

impl<'a> SegmentCursor<'a> {
    fn new(segment: IoVector<'a>) -> Self {
        let skipped_pages = segment.offset / PAGE_SIZE;
        let frames = match segment.backing {
            Backing::Virt { vaddr, mmu } => FrameSource::Virt {
                next_vaddr: vaddr.wrapping_add(segment.offset).align_down(PAGE_SIZE),
                mmu,
            },
            Backing::PageArray(pages) => FrameSource::Array {
                pages,
                index: skipped_pages,
            },
            Backing::PageList(head) => {
                let mut node = Some(head);
                for _ in 0..skipped_pages {
                    node = node.and_then(|n| n.next);
                }
                FrameSource::List { node }
            }
        };
        Self {
            frames,
            in_page: segment.page_offset(),
            remaining: segment.len,
        }
    }

    fn next_chunk(&mut self) -> Option<Result<PageChunk>> {
        if self.remaining == 0 {
            return None;
        }
        let frame = match self.frames.next_frame() {
            Ok(frame) => frame,
            Err(err) => {
                self.remaining = 0;
                return Some(Err(err));
            }
        };
        let len = self.remaining.min(PAGE_SIZE - self.in_page);
        let chunk = PageChunk {
            frame,
            offset: self.in_page,
            len,
        };
        self.remaining -= len;
        self.in_page = 0;
        Some(Ok(chunk))
    }
}

impl Iterator for PageChunks<'_> {
    type Item = Result<PageChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.cursor.as_mut().and_then(SegmentCursor::next_chunk) {
                return Some(chunk);
            }
            let segment = self.object.segment(self.next_segment)?;
            self.next_segment += 1;
            self.cursor = Some(SegmentCursor::new(segment));
        }
    }
}
