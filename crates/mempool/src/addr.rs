use core::{ops::Range, ptr::NonNull};

use crate::PAGE_SIZE;

pub(crate) trait Align: Sized {
    fn align_up(&self, align: usize) -> Self;
    fn align_down(&self, align: usize) -> Self;
    fn is_aligned(&self, align: usize) -> bool;

    fn page_align_up(&self) -> Self {
        self.align_up(PAGE_SIZE)
    }
    fn page_align_down(&self) -> Self {
        self.align_down(PAGE_SIZE)
    }

    fn is_page_aligned(&self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }
}

impl Align for usize {
    fn align_up(&self, align: usize) -> Self {
        self.next_multiple_of(align)
    }

    fn align_down(&self, align: usize) -> Self {
        self / align * align
    }

    fn is_aligned(&self, align: usize) -> bool {
        self.is_multiple_of(align)
    }
}

/// Largest page-aligned range contained in `range`.
///
/// Returns an empty range when `range` does not cover a whole page.
pub(crate) fn shrink_to_page_boundaries(range: Range<usize>) -> Range<usize> {
    let start = range.start.page_align_up();
    let end = range.end.page_align_down();
    if start >= end {
        return start..start;
    }
    start..end
}

/// Offset of `ptr` inside its page.
pub(crate) fn page_offset<T>(ptr: NonNull<T>) -> usize {
    ptr.addr().get() % PAGE_SIZE
}

/// Start of the page containing `ptr`.
///
/// # Safety
///
/// The page containing `ptr` must belong to the same allocation as `ptr`.
pub(crate) unsafe fn page_base(ptr: NonNull<u8>) -> NonNull<u8> {
    unsafe { ptr.byte_sub(page_offset(ptr)) }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(0_usize.page_align_up(), 0);
        assert_eq!(1_usize.page_align_up(), PAGE_SIZE);
        assert_eq!(PAGE_SIZE.page_align_up(), PAGE_SIZE);
        assert_eq!((PAGE_SIZE + 1).page_align_down(), PAGE_SIZE);
        assert!((3 * PAGE_SIZE).is_page_aligned());
        assert!(!(3 * PAGE_SIZE + 16).is_page_aligned());
        assert_eq!(100_usize.align_up(64), 128);
        assert_eq!(100_usize.align_down(64), 64);
    }

    #[test]
    fn test_shrink_to_page_boundaries() {
        assert_eq!(
            shrink_to_page_boundaries(1..3 * PAGE_SIZE + 5),
            PAGE_SIZE..3 * PAGE_SIZE
        );
        assert_eq!(
            shrink_to_page_boundaries(PAGE_SIZE..2 * PAGE_SIZE),
            PAGE_SIZE..2 * PAGE_SIZE
        );
        assert!(shrink_to_page_boundaries(PAGE_SIZE + 1..2 * PAGE_SIZE + 10).is_empty());
        assert!(shrink_to_page_boundaries(10..20).is_empty());
    }

    #[test]
    fn test_page_base() {
        let mut page = crate::testing::TestHeap::new(PAGE_SIZE, PAGE_SIZE);
        let base = page.start();
        let inner = unsafe { base.byte_add(48) };
        assert_eq!(page_offset(inner), 48);
        assert_eq!(unsafe { page_base(inner) }, base);
        assert_eq!(page_offset(base), 0);
        page.fill(0);
    }
}
