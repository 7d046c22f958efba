//! Page-granular objects served straight from the page source.
//!
//! A large object occupies whole pages preceded by one header page that
//! records the size of the window:
//!
//! ```text
//! ┌──────────────┬─────────────────────────────────┐
//! │ LargeHeader  │ payload (size rounded to pages) │
//! └──────────────┴─────────────────────────────────┘
//!                ▲
//!                returned pointer (page aligned)
//! ```
//!
//! Huge pages have no header: the caller frees them with their size.

use core::ptr::NonNull;

use snafu::ensure;

use crate::{
    PAGE_SIZE,
    addr::Align as _,
    error::{AllocError, alloc_error, fatal},
    page_source::PageSource,
};

const LARGE_MAGIC: u32 = 0x6c72_6765;

#[repr(C)]
#[derive(Debug)]
struct LargeHeader {
    /// Bytes in the window, header page included.
    window: usize,
    magic: u32,
}

impl LargeHeader {
    /// Header of the large object at `object`, checked for corruption.
    unsafe fn of(object: NonNull<u8>) -> NonNull<Self> {
        let header = unsafe { object.byte_sub(PAGE_SIZE) }.cast::<Self>();
        let magic = unsafe { (*header.as_ptr()).magic };
        if magic != LARGE_MAGIC {
            fatal!("corrupted large object header at {header:p} (magic {magic:#x})");
        }
        header
    }
}

/// Allocates `size` bytes, page aligned.
///
/// Returns the object and the bytes taken from `source`.
pub(crate) fn alloc_large(
    source: &mut PageSource,
    size: usize,
) -> Result<(NonNull<u8>, usize), AllocError> {
    let window = size
        .checked_next_multiple_of(PAGE_SIZE)
        .and_then(|pages| pages.checked_add(PAGE_SIZE))
        .ok_or_else(|| alloc_error::SizeOverflowSnafu { count: 1_usize, size }.build())?;
    let Some(base) = source.alloc_range(window) else {
        log::debug!("large allocation of {size} bytes failed");
        return alloc_error::OutOfMemorySnafu { size }.fail();
    };
    unsafe {
        base.cast::<LargeHeader>().write(LargeHeader {
            window,
            magic: LARGE_MAGIC,
        });
        Ok((base.byte_add(PAGE_SIZE), window))
    }
}

/// Returns the bytes given back to `source`.
///
/// # Safety
///
/// `object` must have come from [`alloc_large`] with the same source and must
/// not be used afterwards.
pub(crate) unsafe fn free_large(source: &mut PageSource, object: NonNull<u8>) -> usize {
    unsafe {
        let header = LargeHeader::of(object);
        let window = (*header.as_ptr()).window;
        (*header.as_ptr()).magic = 0;
        source.free_range(header.cast(), window);
        window
    }
}

/// Usable bytes of a large object.
///
/// # Safety
///
/// `object` must be a live object returned by [`alloc_large`].
pub(crate) unsafe fn large_object_size(object: NonNull<u8>) -> usize {
    unsafe { (*LargeHeader::of(object).as_ptr()).window - PAGE_SIZE }
}

fn check_huge_size(size: usize) -> Result<(), AllocError> {
    ensure!(
        size.is_power_of_two() && size >= PAGE_SIZE,
        alloc_error::InvalidHugeSizeSnafu { size }
    );
    Ok(())
}

/// Allocates `size` bytes aligned to `size`.
pub(crate) fn alloc_huge(source: &mut PageSource, size: usize) -> Result<NonNull<u8>, AllocError> {
    check_huge_size(size)?;
    let Some(page) = source.alloc_aligned(size, size) else {
        log::debug!("huge page allocation of {size:#x} bytes failed");
        return alloc_error::OutOfMemorySnafu { size }.fail();
    };
    Ok(page)
}

/// # Safety
///
/// `page` must have come from [`alloc_huge`] with the same `size` and must not
/// be used afterwards.
pub(crate) unsafe fn free_huge(
    source: &mut PageSource,
    page: NonNull<u8>,
    size: usize,
) -> Result<(), AllocError> {
    check_huge_size(size)?;
    let addr = page.addr().get();
    ensure!(addr.is_aligned(size), alloc_error::MisalignedAddressSnafu { addr });
    unsafe { source.free_range(page, size) };
    Ok(())
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestHeap};

    fn with_test_source<F>(pages: usize, align: usize, test_fn: F)
    where
        F: FnOnce(&mut PageSource),
    {
        let heap = TestHeap::new(pages * PAGE_SIZE, align);
        let mut source = PageSource::new();
        unsafe { source.donate(heap.start().as_ptr(), heap.size()) };
        test_fn(&mut source);
    }

    #[test]
    fn test_large_round_trip() {
        with_test_source(16, PAGE_SIZE, |source| {
            let (object, window) = alloc_large(source, 3 * PAGE_SIZE + 1).unwrap();
            assert_eq!(window, 5 * PAGE_SIZE);
            assert!(object.addr().get().is_page_aligned());
            assert_eq!(unsafe { large_object_size(object) }, 4 * PAGE_SIZE);
            assert_eq!(source.free_bytes(), 11 * PAGE_SIZE);

            testing::fill(object, 4 * PAGE_SIZE, 0x33);
            assert_eq!(unsafe { free_large(source, object) }, window);
            assert_eq!(source.free_bytes(), 16 * PAGE_SIZE);
            assert_eq!(source.ranges().count(), 1);
        });
    }

    #[test]
    fn test_large_out_of_memory() {
        with_test_source(4, PAGE_SIZE, |source| {
            let err = alloc_large(source, 4 * PAGE_SIZE).unwrap_err();
            assert!(matches!(err, AllocError::OutOfMemory { .. }));
            let err = alloc_large(source, usize::MAX - 10).unwrap_err();
            assert!(matches!(err, AllocError::SizeOverflow { .. }));
            assert_eq!(source.free_bytes(), 4 * PAGE_SIZE);
        });
    }

    #[test]
    #[should_panic(expected = "corrupted large object header")]
    fn test_large_header_corruption_panics() {
        with_test_source(4, PAGE_SIZE, |source| {
            let (object, _) = alloc_large(source, PAGE_SIZE).unwrap();
            unsafe { object.byte_sub(PAGE_SIZE).write_bytes(0, PAGE_SIZE) };
            unsafe { free_large(source, object) };
        });
    }

    #[test]
    fn test_huge_pages_are_naturally_aligned() {
        const HEAP: usize = 2 << 20;
        with_test_source(HEAP / PAGE_SIZE, HEAP, |source| {
            let mut size = PAGE_SIZE;
            while size <= 1 << 20 {
                let page = alloc_huge(source, size).unwrap();
                assert!(page.addr().get().is_aligned(size), "{size:#x}");
                testing::fill(page, size, 0x5a);
                unsafe { free_huge(source, page, size).unwrap() };
                size *= 2;
            }
            assert_eq!(source.free_bytes(), HEAP);
            assert_eq!(source.ranges().count(), 1);
        });
    }

    #[test]
    fn test_huge_errors() {
        with_test_source(8, PAGE_SIZE, |source| {
            assert!(matches!(
                alloc_huge(source, 3 * PAGE_SIZE),
                Err(AllocError::InvalidHugeSize { size, .. }) if size == 3 * PAGE_SIZE
            ));
            assert!(matches!(
                alloc_huge(source, PAGE_SIZE / 2),
                Err(AllocError::InvalidHugeSize { .. })
            ));
            assert!(matches!(
                alloc_huge(source, 64 * PAGE_SIZE),
                Err(AllocError::OutOfMemory { .. })
            ));

            let page = alloc_huge(source, PAGE_SIZE).unwrap();
            let misaligned = unsafe { page.byte_add(16) };
            assert!(matches!(
                unsafe { free_huge(source, misaligned, PAGE_SIZE) },
                Err(AllocError::MisalignedAddress { .. })
            ));
            unsafe { free_huge(source, page, PAGE_SIZE).unwrap() };
        });
    }
}
