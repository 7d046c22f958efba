//! Per-CPU stacks of spare pages in front of the page source.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use arrayvec::ArrayVec;

use crate::{
    PAGE_CACHE_CAPACITY, PAGE_SIZE,
    cpu_local::{ConstInit, PerCpu},
    error::fatal,
    page_source::SharedPageSource,
    platform::{CpuContext, Platform},
};

/// Number of pages a refill brings the cache up to.
const REFILL_LEVEL: usize = PAGE_CACHE_CAPACITY.div_ceil(2);
/// Number of pages an unfill leaves in the cache.
const UNFILL_LEVEL: usize = PAGE_CACHE_CAPACITY / 2;

#[derive(Debug)]
struct CpuPageCache {
    pages: ArrayVec<NonNull<u8>, PAGE_CACHE_CAPACITY>,
}

unsafe impl Send for CpuPageCache {}

impl ConstInit for CpuPageCache {
    const INIT: Self = Self {
        pages: ArrayVec::new_const(),
    };
}

#[derive(Debug)]
pub(crate) struct PageCache<const CPUS: usize> {
    caches: PerCpu<CpuPageCache, CPUS>,
    /// Pages held by all CPUs.
    cached: AtomicUsize,
}

impl<const CPUS: usize> PageCache<CPUS> {
    pub(crate) const fn new() -> Self {
        Self {
            caches: PerCpu::new(),
            cached: AtomicUsize::new(0),
        }
    }

    /// Number of pages sitting in the caches of all CPUs.
    pub(crate) fn cached_pages(&self) -> usize {
        self.cached.load(Ordering::Relaxed)
    }

    /// Takes one page, refilling the cache of the current CPU when empty.
    ///
    /// Before SMP is enabled pages come straight from the source.
    ///
    /// # Panics
    ///
    /// Panics when the page source has no page left.
    pub(crate) fn alloc_page<P>(
        &self,
        cpus: &CpuContext<P, CPUS>,
        source: &SharedPageSource,
    ) -> NonNull<u8>
    where
        P: Platform,
    {
        if !cpus.is_smp() {
            let page = source.lock(cpus.platform()).alloc_range(PAGE_SIZE);
            let Some(page) = page else {
                fatal!("out of memory: no page left for early allocation");
            };
            log::trace!("early page {page:p}");
            return page;
        }

        loop {
            {
                let pin = cpus.pin();
                if let Some(page) = self.caches.get(&pin).pages.pop() {
                    self.cached.fetch_sub(1, Ordering::Relaxed);
                    return page;
                }
            }
            self.refill(cpus, source);
        }
    }

    /// Returns one page, draining half of the cache when full.
    ///
    /// Must be called unpinned.
    ///
    /// # Safety
    ///
    /// `page` must be an unused page that came from `source`.
    pub(crate) unsafe fn free_page<P>(
        &self,
        cpus: &CpuContext<P, CPUS>,
        source: &SharedPageSource,
        page: NonNull<u8>,
    ) where
        P: Platform,
    {
        if !cpus.is_smp() {
            log::trace!("early page {page:p} freed");
            unsafe { source.lock(cpus.platform()).free_range(page, PAGE_SIZE) };
            return;
        }

        loop {
            {
                let pin = cpus.pin();
                let mut cache = self.caches.get(&pin);
                if cache.pages.try_push(page).is_ok() {
                    self.cached.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            self.unfill(cpus, source);
        }
    }

    fn refill<P>(&self, cpus: &CpuContext<P, CPUS>, source: &SharedPageSource)
    where
        P: Platform,
    {
        let mut source = source.lock(cpus.platform());
        let pin = cpus.pin();
        let mut cache = self.caches.get(&pin);
        let wanted = REFILL_LEVEL.saturating_sub(cache.pages.len());
        let claimed = source.claim_pages(wanted, |page| cache.pages.push(page));
        if cache.pages.is_empty() {
            fatal!("out of memory: page source is empty");
        }
        self.cached.fetch_add(claimed, Ordering::Relaxed);
        log::debug!(
            "cpu {} refilled {claimed} pages, {} bytes left in page source",
            pin.cpu(),
            source.free_bytes()
        );
    }

    fn unfill<P>(&self, cpus: &CpuContext<P, CPUS>, source: &SharedPageSource)
    where
        P: Platform,
    {
        let mut source = source.lock(cpus.platform());
        let pin = cpus.pin();
        let mut cache = self.caches.get(&pin);
        let mut released = 0_usize;
        while cache.pages.len() > UNFILL_LEVEL {
            let Some(page) = cache.pages.pop() else {
                break;
            };
            unsafe { source.free_range(page, PAGE_SIZE) };
            released += 1;
        }
        self.cached.fetch_sub(released, Ordering::Relaxed);
        log::debug!("cpu {} returned {released} pages to page source", pin.cpu());
    }
}
