//! Address-ordered set of free page ranges.
//!
//! This is the bottom tier of the allocator. Every free range stores its own
//! [`RangeNode`] in its first bytes, so the set needs no memory of its own.
//!
//! # Algorithm
//!
//! - **Free list**: singly-linked list of free ranges sorted by address
//! - **Allocation**: first-fit; the allocation is carved from the *high* end of
//!   the first range that is large enough, so the node at the low end stays
//!   where it is and only its size shrinks
//! - **Deallocation**: the freed range is inserted in address order and merged
//!   with both neighbors, so no two ranges in the list are ever adjacent
//!
//! ```text
//!   head
//!    │
//!    ▼
//! ┌──────────────┬──────────┐        ┌──────────────┬──────────────────┐
//! │ size │ next ─┼──────────┼──...──►│ size │ next  │                  │
//! └──────────────┴──────────┘        └──────────────┴──────────────────┘
//!  free range (low address)           free range (higher address)
//! ```
//!
//! All sizes and addresses are multiples of [`PAGE_SIZE`].

use core::ptr::NonNull;

use spin::{Mutex, MutexGuard};

use crate::{
    PAGE_SIZE,
    addr::{self, Align as _},
    error::fatal,
    platform::Platform,
};

/// Header of a free range, stored at the start of the range.
#[repr(C)]
#[derive(Debug)]
struct RangeNode {
    /// Length of the range in bytes, including this header.
    size: usize,
    next: Option<NonNull<Self>>,
}
const _: () = assert!(size_of::<RangeNode>() <= PAGE_SIZE);

impl RangeNode {
    /// Writes a node describing `start..start + size`.
    ///
    /// # Safety
    ///
    /// The range must be free, writable and page aligned.
    unsafe fn init(start: NonNull<u8>, size: usize, next: Option<NonNull<Self>>) -> NonNull<Self> {
        assert!(start.addr().get().is_page_aligned() && size.is_page_aligned() && size > 0);
        let node = start.cast::<Self>();
        unsafe {
            node.write(Self { size, next });
        }
        node
    }

    fn start(node: NonNull<Self>) -> usize {
        node.addr().get()
    }

    fn end(node: NonNull<Self>) -> usize {
        Self::start(node) + unsafe { node.as_ref().size }
    }
}

/// The global free page ranges.
///
/// Not synchronized; the allocator keeps it behind a spin lock.
#[derive(Debug)]
pub(crate) struct PageSource {
    head: Option<NonNull<RangeNode>>,
    free_bytes: usize,
    total_bytes: usize,
}

unsafe impl Send for PageSource {}

impl PageSource {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            free_bytes: 0,
            total_bytes: 0,
        }
    }

    /// Bytes currently in the free list.
    pub(crate) fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Bytes ever donated.
    pub(crate) fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Iterates the free ranges as `(start, size)` in address order.
    pub(crate) fn ranges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let node = cursor?;
            let size = unsafe { node.as_ref().size };
            cursor = unsafe { node.as_ref().next };
            Some((RangeNode::start(node), size))
        })
    }

    /// Adds `start..start + size` to the free list, counting it as new memory.
    ///
    /// The range is shrunk to page boundaries and loses its first page if it
    /// starts at address zero; a range holding no whole page is ignored.
    /// Returns the number of bytes actually added.
    ///
    /// # Safety
    ///
    /// The range must be writable memory that nothing else uses, now or later.
    pub(crate) unsafe fn donate(&mut self, mut start: *mut u8, mut size: usize) -> usize {
        if start.is_null() {
            // page zero stays unmapped
            if size <= PAGE_SIZE {
                return 0;
            }
            start = start.wrapping_add(PAGE_SIZE);
            size -= PAGE_SIZE;
        }
        let end = start.addr().saturating_add(size);
        let range = addr::shrink_to_page_boundaries(start.addr()..end);
        if range.is_empty() {
            return 0;
        }
        let Some(start) = NonNull::new(start.with_addr(range.start)) else {
            return 0;
        };
        let size = range.len();
        self.total_bytes += size;
        unsafe {
            self.free_range(start, size);
        }
        log::info!(
            "donated {size:#x} bytes at {:#x}..{:#x}",
            range.start,
            range.end
        );
        size
    }

    /// Returns a previously allocated range to the free list.
    ///
    /// # Panics
    ///
    /// Panics if the range overlaps a free range, which means it was freed
    /// twice.
    ///
    /// # Safety
    ///
    /// The range must have been handed out by this source and be unused.
    pub(crate) unsafe fn free_range(&mut self, start: NonNull<u8>, size: usize) {
        let start_addr = start.addr().get();
        assert!(start_addr.is_page_aligned() && size.is_page_aligned() && size > 0);
        let end_addr = start_addr + size;

        let mut prev: Option<NonNull<RangeNode>> = None;
        let mut next = self.head;
        while let Some(node) = next {
            if RangeNode::start(node) > start_addr {
                break;
            }
            prev = Some(node);
            next = unsafe { node.as_ref().next };
        }

        if prev.is_some_and(|prev| RangeNode::end(prev) > start_addr)
            || next.is_some_and(|next| RangeNode::start(next) < end_addr)
        {
            fatal!("double free of page range {start_addr:#x}..{end_addr:#x}");
        }

        unsafe {
            let node = match prev {
                Some(mut prev) if RangeNode::end(prev) == start_addr => {
                    prev.as_mut().size += size;
                    prev
                }
                _ => {
                    let node = RangeNode::init(start, size, next);
                    match prev {
                        Some(mut prev) => prev.as_mut().next = Some(node),
                        None => self.head = Some(node),
                    }
                    node
                }
            };
            Self::merge_with_next(node);
        }
        self.free_bytes += size;
    }

    /// Takes `size` bytes from the first range that holds them.
    pub(crate) fn alloc_range(&mut self, size: usize) -> Option<NonNull<u8>> {
        assert!(size.is_page_aligned() && size > 0);
        let mut prev: Option<NonNull<RangeNode>> = None;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            let node_size = unsafe { node.as_ref().size };
            if node_size >= size {
                let ptr = unsafe { self.carve_high(prev, node, size) };
                return Some(ptr);
            }
            prev = Some(node);
            cursor = unsafe { node.as_ref().next };
        }
        None
    }

    /// Moves up to `max_pages` single pages into `sink`, starting from the
    /// lowest ranges. Returns the number of pages moved.
    pub(crate) fn claim_pages(
        &mut self,
        max_pages: usize,
        mut sink: impl FnMut(NonNull<u8>),
    ) -> usize {
        let mut claimed = 0;
        while claimed < max_pages {
            let Some(head) = self.head else {
                break;
            };
            let available = unsafe { head.as_ref().size } / PAGE_SIZE;
            let count = usize::min(available, max_pages - claimed);
            let block = unsafe { self.carve_high(None, head, count * PAGE_SIZE) };
            for i in 0..count {
                sink(unsafe { block.byte_add(i * PAGE_SIZE) });
            }
            claimed += count;
        }
        claimed
    }

    /// Takes a `size`-byte window aligned to `align` from the first range that
    /// contains one.
    ///
    /// Within that range the highest aligned window is used. The part of the
    /// range below the window stays in place; the part above it becomes a new
    /// free range.
    pub(crate) fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(size.is_page_aligned() && size > 0);
        assert!(align.is_power_of_two() && align >= PAGE_SIZE);

        let mut prev: Option<NonNull<RangeNode>> = None;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            let start = RangeNode::start(node);
            let end = RangeNode::end(node);
            let next = unsafe { node.as_ref().next };
            let window = end
                .checked_sub(size)
                .map(|top| top.align_down(align))
                .filter(|&window| window >= start);
            let Some(window) = window else {
                prev = Some(node);
                cursor = next;
                continue;
            };

            let below = window - start;
            let above = end - (window + size);
            let base = node.cast::<u8>();
            unsafe {
                let mut link_after = if below > 0 {
                    let mut node = node;
                    node.as_mut().size = below;
                    Some(node)
                } else {
                    self.unlink(prev, node);
                    prev
                };
                if above > 0 {
                    let tail = RangeNode::init(base.byte_add(window - start + size), above, next);
                    match link_after.as_mut() {
                        Some(node) => node.as_mut().next = Some(tail),
                        None => self.head = Some(tail),
                    }
                }
            }
            self.free_bytes -= size;
            return Some(unsafe { base.byte_add(below) });
        }
        None
    }

    /// Removes `size` bytes from the top of `node`, unlinking it if emptied.
    ///
    /// # Safety
    ///
    /// `node` must be in the list, directly after `prev` (or the head when
    /// `prev` is `None`), and hold at least `size` bytes.
    unsafe fn carve_high(
        &mut self,
        prev: Option<NonNull<RangeNode>>,
        mut node: NonNull<RangeNode>,
        size: usize,
    ) -> NonNull<u8> {
        let node_size = unsafe { node.as_ref().size };
        assert!(node_size >= size);
        let remaining = node_size - size;
        if remaining == 0 {
            unsafe { self.unlink(prev, node) };
        } else {
            unsafe { node.as_mut().size = remaining };
        }
        self.free_bytes -= size;
        unsafe { node.cast::<u8>().byte_add(remaining) }
    }

    unsafe fn unlink(&mut self, prev: Option<NonNull<RangeNode>>, node: NonNull<RangeNode>) {
        let next = unsafe { node.as_ref().next };
        match prev {
            Some(mut prev) => unsafe { prev.as_mut().next = next },
            None => self.head = next,
        }
    }

    unsafe fn merge_with_next(mut node: NonNull<RangeNode>) {
        unsafe {
            let Some(next) = node.as_ref().next else {
                return;
            };
            if RangeNode::end(node) == RangeNode::start(next) {
                node.as_mut().size += next.as_ref().size;
                node.as_mut().next = next.as_ref().next;
            }
        }
    }
}

/// The page source behind the allocator-wide spin lock.
///
/// The lock is only ever taken with preemption enabled. Per-CPU tiers that
/// need both lock the source first and pin afterwards.
#[derive(Debug)]
pub(crate) struct SharedPageSource {
    inner: Mutex<PageSource>,
}

impl SharedPageSource {
    pub(crate) const fn new() -> Self {
        Self {
            inner: Mutex::new(PageSource::new()),
        }
    }

    /// Locks the page source.
    ///
    /// # Panics
    ///
    /// Panics if the calling task is pinned to its CPU.
    pub(crate) fn lock<P>(&self, platform: &P) -> MutexGuard<'_, PageSource>
    where
        P: Platform,
    {
        if !platform.is_preemptible() {
            fatal!("page source locked with preemption disabled");
        }
        self.inner.lock()
    }
}
