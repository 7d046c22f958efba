//! The allocator as seen by the rest of the kernel.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use snafu::ensure;
use spin::MutexGuard;

use crate::{
    EARLY_OBJECT_OFFSET, PAGE_SIZE,
    addr::{self, Align as _},
    error::{AllocError, alloc_error, fatal},
    large,
    page_cache::PageCache,
    page_source::{PageSource, SharedPageSource},
    platform::{CpuContext, CpuId, Platform},
    pool::{
        CLASS_COUNT, PAGE_MAGIC, PageHeader, PageSupply, PageTag, PoolUsage, SizeClass,
        SizeClassPool,
    },
    remote_free::RemoteFreeChannel,
    shrinker::ShrinkerRegistry,
};

/// Source of allocator identities. Zero means "not assigned yet".
static NEXT_IDENTITY: AtomicU32 = AtomicU32::new(1);

/// Point-in-time view of the page source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    /// Bytes donated over the allocator's lifetime.
    pub total_bytes: usize,
    /// Bytes in the page source.
    pub free_bytes: usize,
    /// Number of free ranges.
    pub free_ranges: usize,
    /// Size of the largest free range.
    pub largest_range: usize,
}

/// Per-CPU pooled memory allocator for `CPUS` logical CPUs.
///
/// Construct it in a `static` with [`Mempool::new`], hand it memory with
/// [`Mempool::donate`], and call [`Mempool::enable_smp`] once the scheduler
/// can report CPU ids. Until then every request is served as if on CPU 0,
/// with sub-page objects taking a whole page each.
#[derive(Debug)]
pub struct Mempool<P, const CPUS: usize> {
    cpus: CpuContext<P, CPUS>,
    identity: AtomicU32,
    source: SharedPageSource,
    page_cache: PageCache<CPUS>,
    pools: [SizeClassPool<CPUS>; CLASS_COUNT],
    remote: RemoteFreeChannel<CPUS>,
    shrinkers: ShrinkerRegistry,
    /// Pages handed out whole: [`Mempool::alloc_page`] and early objects.
    direct_pages: AtomicUsize,
    /// Bytes in large-object windows and huge pages.
    large_bytes: AtomicUsize,
}

impl<P, const CPUS: usize> Mempool<P, CPUS>
where
    P: Platform,
{
    pub const fn new(platform: P) -> Self {
        let mut pools = [const { SizeClassPool::new(SizeClass::from_index(0)) }; CLASS_COUNT];
        let mut index = 1;
        while index < CLASS_COUNT {
            pools[index] = SizeClassPool::new(SizeClass::from_index(index));
            index += 1;
        }
        Self {
            cpus: CpuContext::new(platform),
            identity: AtomicU32::new(0),
            source: SharedPageSource::new(),
            page_cache: PageCache::new(),
            pools,
            remote: RemoteFreeChannel::new(),
            shrinkers: ShrinkerRegistry::new(),
            direct_pages: AtomicUsize::new(0),
            large_bytes: AtomicUsize::new(0),
        }
    }

    fn lock_source(&self) -> MutexGuard<'_, PageSource> {
        self.source.lock(self.cpus.platform())
    }

    pub fn platform(&self) -> &P {
        self.cpus.platform()
    }

    /// Hands `start..start + size` to the allocator for good.
    ///
    /// The range is trimmed to whole pages, and loses its first page if it
    /// starts at address zero. Returns the number of bytes taken.
    ///
    /// # Safety
    ///
    /// The range must be writable memory that nothing else uses, now or
    /// later.
    pub unsafe fn donate(&self, start: *mut u8, size: usize) -> usize {
        unsafe { self.lock_source().donate(start, size) }
    }

    /// Switches from early boot mode to the per-CPU tiers.
    ///
    /// Objects allocated before the switch stay valid and may be freed at any
    /// time.
    pub fn enable_smp(&self) {
        self.cpus.enable_smp();
        log::info!("per-cpu memory pools enabled for {CPUS} cpus");
    }

    #[must_use]
    pub fn is_smp(&self) -> bool {
        self.cpus.is_smp()
    }

    /// Identity recorded in every pool page, assigned on first use.
    fn identity(&self) -> u32 {
        let current = self.identity.load(Ordering::Acquire);
        if current != 0 {
            return current;
        }
        let candidate = loop {
            let candidate = NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed);
            if candidate != 0 {
                break candidate;
            }
        };
        match self
            .identity
            .compare_exchange(0, candidate, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => candidate,
            Err(installed) => installed,
        }
    }

    /// Allocates `size` bytes.
    ///
    /// Small requests never fail short of total exhaustion, which panics.
    /// Large requests fail with [`AllocError::OutOfMemory`].
    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        ensure!(
            isize::try_from(size).is_ok(),
            alloc_error::SizeOverflowSnafu { count: 1_usize, size }
        );
        let Some(class) = SizeClass::for_size(size) else {
            return self.alloc_large(size);
        };
        if !self.cpus.is_smp() {
            let page = self.take_page();
            return Ok(unsafe { page.byte_add(EARLY_OBJECT_OFFSET) });
        }
        Ok(self.pools[class.index()].alloc(&self.cpus, self, self.identity()))
    }

    /// Frees an object returned by any allocation function of this allocator
    /// except the huge-page ones. A null pointer is ignored.
    ///
    /// The object may be freed on any CPU.
    ///
    /// # Panics
    ///
    /// Panics if the object's header is corrupted or belongs to another
    /// allocator.
    ///
    /// # Safety
    ///
    /// `object` must be null or a live object of this allocator.
    pub unsafe fn free(&self, object: *mut u8) {
        let Some(object) = NonNull::new(object) else {
            return;
        };
        match addr::page_offset(object) {
            0 => {
                let window = unsafe { large::free_large(&mut self.lock_source(), object) };
                self.large_bytes.fetch_sub(window, Ordering::Relaxed);
            }
            EARLY_OBJECT_OFFSET => unsafe { self.return_page(addr::page_base(object)) },
            _ => unsafe { self.free_small(object) },
        }
    }

    unsafe fn free_small(&self, object: NonNull<u8>) {
        let tag = unsafe { self.check_pool_object(object) };
        let pin = self.cpus.pin();
        if tag.cpu == pin.cpu() {
            let spare = unsafe { self.pools[tag.class.index()].free_local(&pin, object) };
            drop(pin);
            if let Some(page) = spare {
                unsafe { self.release_pool_page(page) };
            }
        } else {
            log::trace!("object {object:p} freed on cpu {}, owner {}", pin.cpu(), tag.cpu);
            self.remote.free_remote(&self.cpus, pin, tag.cpu, object);
        }
    }

    /// Gives a pool page detached by [`SizeClassPool::free_local`] back to the
    /// page cache. Must be called unpinned.
    unsafe fn release_pool_page(&self, page: NonNull<u8>) {
        unsafe { self.page_cache.free_page(&self.cpus, &self.source, page) };
    }

    fn alloc_large(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let (object, window) = large::alloc_large(&mut self.lock_source(), size)?;
        self.large_bytes.fetch_add(window, Ordering::Relaxed);
        Ok(object)
    }

    /// Takes a page the caller owns whole.
    fn take_page(&self) -> NonNull<u8> {
        let page = self.page_cache.alloc_page(&self.cpus, &self.source);
        self.direct_pages.fetch_add(1, Ordering::Relaxed);
        page
    }

    unsafe fn return_page(&self, page: NonNull<u8>) {
        self.direct_pages.fetch_sub(1, Ordering::Relaxed);
        unsafe { self.page_cache.free_page(&self.cpus, &self.source, page) };
    }

    /// Reads the header of the pool page holding `object` and checks that
    /// the page is one of ours.
    unsafe fn check_pool_object(&self, object: NonNull<u8>) -> PageTag {
        let tag = unsafe { PageHeader::inspect(object) };
        if tag.magic != PAGE_MAGIC
            || tag.owner != self.identity()
            || !tag.class.is_valid()
            || tag.cpu.index() >= CPUS
        {
            fatal!("{object:p} is not an object of this allocator (page header {tag:?})");
        }
        tag
    }

    /// Allocates zeroed memory for `count` objects of `size` bytes.
    pub fn calloc(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = count
            .checked_mul(size)
            .ok_or_else(|| alloc_error::SizeOverflowSnafu { count, size }.build())?;
        let object = self.malloc(total)?;
        unsafe { object.write_bytes(0, total) };
        Ok(object)
    }

    /// Resizes `object`, moving it.
    ///
    /// A null `object` makes this a [`malloc`](Self::malloc). A zero `size`
    /// frees `object` and returns `None`. On failure `object` is left as is.
    ///
    /// # Safety
    ///
    /// `object` must be null or a live object of this allocator.
    pub unsafe fn realloc(
        &self,
        object: *mut u8,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(old) = NonNull::new(object) else {
            return self.malloc(size).map(Some);
        };
        if size == 0 {
            unsafe { self.free(old.as_ptr()) };
            return Ok(None);
        }
        let new = self.malloc(size)?;
        unsafe {
            let copy = self.usable_size(old).min(size);
            new.copy_from_nonoverlapping(old, copy);
            self.free(old.as_ptr());
        }
        Ok(Some(new))
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// `size` must be a multiple of `align`, and `align` a power of two no
    /// larger than a page.
    pub fn posix_memalign(&self, align: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        ensure!(align.is_power_of_two(), alloc_error::InvalidAlignmentSnafu { align });
        ensure!(
            size.is_aligned(align),
            alloc_error::MisalignedSizeSnafu { size, align }
        );
        self.alloc_aligned(size, align)
    }

    /// C11 spelling of [`posix_memalign`](Self::posix_memalign).
    pub fn aligned_alloc(&self, align: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.posix_memalign(align, size)
    }

    fn alloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        ensure!(align.is_power_of_two(), alloc_error::InvalidAlignmentSnafu { align });
        ensure!(align <= PAGE_SIZE, alloc_error::UnsupportedAlignmentSnafu { align });

        // pool objects are aligned to their class size
        let size = size.max(align);
        let object = if !self.cpus.is_smp() && align > EARLY_OBJECT_OFFSET {
            self.alloc_large(size)?
        } else {
            self.malloc(size)?
        };
        if !object.addr().get().is_aligned(align) {
            unsafe { self.free(object.as_ptr()) };
            return alloc_error::UnsupportedAlignmentSnafu { align }.fail();
        }
        Ok(object)
    }

    /// Number of bytes usable at `object`.
    ///
    /// # Safety
    ///
    /// `object` must be a live object of this allocator, not a huge page.
    pub unsafe fn usable_size(&self, object: NonNull<u8>) -> usize {
        match addr::page_offset(object) {
            0 => unsafe { large::large_object_size(object) },
            EARLY_OBJECT_OFFSET => PAGE_SIZE - EARLY_OBJECT_OFFSET,
            _ => unsafe { self.check_pool_object(object) }.class.size(),
        }
    }

    /// Allocates one page.
    ///
    /// # Panics
    ///
    /// Panics when no page is left.
    pub fn alloc_page(&self) -> NonNull<u8> {
        self.take_page()
    }

    /// # Safety
    ///
    /// `page` must come from [`alloc_page`](Self::alloc_page) and not be used
    /// afterwards.
    pub unsafe fn free_page(&self, page: NonNull<u8>) -> Result<(), AllocError> {
        let addr = page.addr().get();
        ensure!(addr.is_page_aligned(), alloc_error::MisalignedAddressSnafu { addr });
        unsafe { self.return_page(page) };
        Ok(())
    }

    /// Allocates `size` bytes aligned to `size`, which must be a power of two
    /// of at least a page.
    ///
    /// The region carries no header: free it with
    /// [`free_huge_page`](Self::free_huge_page) and the same size.
    pub fn alloc_huge_page(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let page = large::alloc_huge(&mut self.lock_source(), size)?;
        self.large_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(page)
    }

    /// # Safety
    ///
    /// `page` must come from [`alloc_huge_page`](Self::alloc_huge_page) with
    /// the same `size` and not be used afterwards.
    pub unsafe fn free_huge_page(&self, page: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        unsafe { large::free_huge(&mut self.lock_source(), page, size)? };
        self.large_bytes.fetch_sub(size, Ordering::Relaxed);
        Ok(())
    }

    /// Allocates physically contiguous memory of at least a page, aligned to
    /// `align` (at most a page).
    pub fn alloc_phys_contiguous_aligned(
        &self,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        ensure!(align.is_power_of_two(), alloc_error::InvalidAlignmentSnafu { align });
        ensure!(align <= PAGE_SIZE, alloc_error::UnsupportedAlignmentSnafu { align });
        self.alloc_large(size.max(PAGE_SIZE))
    }

    /// # Safety
    ///
    /// `object` must come from
    /// [`alloc_phys_contiguous_aligned`](Self::alloc_phys_contiguous_aligned)
    /// and not be used afterwards.
    pub unsafe fn free_phys_contiguous_aligned(&self, object: NonNull<u8>) {
        unsafe { self.free(object.as_ptr()) };
    }

    /// Returns objects other CPUs freed to their owner, the current CPU.
    ///
    /// This is the body of the per-CPU worker task that
    /// [`Platform::signal_worker`] wakes. Returns the number of objects
    /// recycled.
    pub fn drain_remote_frees(&self) -> usize {
        let mut drained = 0;
        loop {
            let pin = self.cpus.pin();
            let Some(object) = self.remote.pop(&pin) else {
                break;
            };
            let spare = unsafe {
                let tag = self.check_pool_object(object);
                self.pools[tag.class.index()].free_local(&pin, object)
            };
            drop(pin);
            if let Some(page) = spare {
                unsafe { self.release_pool_page(page) };
            }
            drained += 1;
        }
        if drained > 0 {
            log::trace!("drained {drained} remotely freed objects");
        }
        drained
    }

    /// Objects freed on other CPUs and waiting for the worker of `owner`.
    #[must_use]
    pub fn pending_remote_frees(&self, owner: CpuId) -> usize {
        self.remote.pending(owner)
    }

    /// Bytes in the page source.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.lock_source().free_bytes()
    }

    /// Bytes ever donated.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.lock_source().total_bytes()
    }

    /// Donated bytes outside the page source.
    ///
    /// Counts pool pages, pages cached per CPU, pages handed out whole and
    /// large and huge windows. Exact only while no CPU allocates or frees.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        let pool_pages: usize = self.pools.iter().map(|pool| pool.usage().pages).sum();
        let pages =
            pool_pages + self.page_cache.cached_pages() + self.direct_pages.load(Ordering::Relaxed);
        pages * PAGE_SIZE + self.large_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn summary(&self) -> PoolSummary {
        let source = self.lock_source();
        let mut summary = PoolSummary {
            total_bytes: source.total_bytes(),
            free_bytes: source.free_bytes(),
            ..PoolSummary::default()
        };
        for (_start, size) in source.ranges() {
            summary.free_ranges += 1;
            summary.largest_range = summary.largest_range.max(size);
        }
        summary
    }

    /// Usage of the size-class pool serving `size`-byte requests.
    #[must_use]
    pub fn pool_usage(&self, size: usize) -> Option<PoolUsage> {
        SizeClass::for_size(size).map(|class| self.pools[class.index()].usage())
    }

    pub fn shrinkers(&self) -> &ShrinkerRegistry {
        &self.shrinkers
    }
}

impl<P, const CPUS: usize> PageSupply for Mempool<P, CPUS>
where
    P: Platform,
{
    fn supply_page(&self) -> NonNull<u8> {
        self.page_cache.alloc_page(&self.cpus, &self.source)
    }
}

unsafe impl<P, const CPUS: usize> GlobalAlloc for Mempool<P, CPUS>
where
    P: Platform,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc_aligned(layout.size(), layout.align())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.free(ptr) };
    }
}
