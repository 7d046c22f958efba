//! Per-CPU size-class pools of small objects.
//!
//! A pool page is a whole page owned by one CPU and one size class:
//!
//! ```text
//! page start                                                  page end
//! ┌──────────────┬─────────┬──────────┬──────────┬─────┬──────────┐
//! │ PageHeader   │ (pad)   │ object 0 │ object 1 │ ... │ object n │
//! └──────────────┴─────────┴──────────┴──────────┴─────┴──────────┘
//! ```
//!
//! Objects are packed against the end of the page, so every object offset is a
//! non-zero multiple of the object size. That makes objects naturally aligned
//! to their size and lets the header of any object be found by rounding its
//! address down to the page boundary.
//!
//! Each CPU keeps, per pool, a list of its pages that still have free slots.
//! Pages with live objects go to the front and fully free pages to the back,
//! so a fully free page at the back is a spare that makes any other page that
//! becomes free redundant.

use core::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    MAX_OBJECT_SIZE, MIN_OBJECT_SIZE, PAGE_SIZE,
    addr,
    cpu_local::{CacheAligned, ConstInit, PerCpu},
    error::fatal,
    platform::{CpuContext, CpuId, CpuPin, Platform},
};

/// Number of size classes.
pub(crate) const CLASS_COUNT: usize =
    (MAX_OBJECT_SIZE / MIN_OBJECT_SIZE).trailing_zeros() as usize + 1;

/// Marks a page as a live pool page.
pub(crate) const PAGE_MAGIC: u32 = 0x6d70_6f6c;

const NO_SLOT: u16 = u16::MAX;

/// A power-of-two object size between [`MIN_OBJECT_SIZE`] and
/// [`MAX_OBJECT_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub(crate) struct SizeClass(u8);

impl SizeClass {
    /// Smallest class holding `size` bytes, if any.
    pub(crate) fn for_size(size: usize) -> Option<Self> {
        if size > MAX_OBJECT_SIZE {
            return None;
        }
        let size = size.max(MIN_OBJECT_SIZE).next_power_of_two();
        let index = (size / MIN_OBJECT_SIZE).trailing_zeros();
        Some(Self(u8::try_from(index).ok()?))
    }

    #[expect(clippy::cast_possible_truncation)]
    pub(crate) const fn from_index(index: usize) -> Self {
        assert!(index < CLASS_COUNT);
        Self(index as u8)
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.0)
    }

    pub(crate) fn is_valid(self) -> bool {
        self.index() < CLASS_COUNT
    }

    pub(crate) fn size(self) -> usize {
        MIN_OBJECT_SIZE << self.0
    }

    pub(crate) fn objects_per_page(self) -> usize {
        (PAGE_SIZE - size_of::<PageHeader>()) / self.size()
    }

    fn first_offset(self) -> usize {
        PAGE_SIZE - self.objects_per_page() * self.size()
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-byte", self.size())
    }
}

/// Header at the start of every pool page.
///
/// `magic`, `owner`, `cpu` and `class` never change while the page is live and
/// may be read from any CPU. The other fields belong to the owning CPU.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct PageHeader {
    prev: Option<NonNull<Self>>,
    next: Option<NonNull<Self>>,
    magic: u32,
    owner: u32,
    cpu: CpuId,
    class: SizeClass,
    nalloc: u16,
    free_head: u16,
}
const _: () = assert!(size_of::<PageHeader>() <= MIN_OBJECT_SIZE * 4);
const _: () = assert!(PAGE_SIZE / MIN_OBJECT_SIZE < NO_SLOT as usize);

/// The immutable part of a page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageTag {
    pub(crate) magic: u32,
    pub(crate) owner: u32,
    pub(crate) cpu: CpuId,
    pub(crate) class: SizeClass,
}

impl PageHeader {
    /// Header of the page containing `object`.
    ///
    /// # Safety
    ///
    /// `object` must point into a page handed out by the page source.
    pub(crate) unsafe fn of(object: NonNull<u8>) -> NonNull<Self> {
        unsafe { addr::page_base(object) }.cast()
    }

    /// Reads the immutable part of the header of the page containing `object`.
    ///
    /// # Safety
    ///
    /// `object` must point into a page handed out by the page source.
    pub(crate) unsafe fn inspect(object: NonNull<u8>) -> PageTag {
        unsafe {
            let header = Self::of(object).as_ptr();
            PageTag {
                magic: (*header).magic,
                owner: (*header).owner,
                cpu: (*header).cpu,
                class: (*header).class,
            }
        }
    }

    /// Turns a fresh page into an empty pool page.
    unsafe fn format(
        page: NonNull<u8>,
        class: SizeClass,
        cpu: CpuId,
        owner: u32,
    ) -> NonNull<Self> {
        let header = page.cast::<Self>();
        let count = class.objects_per_page();
        unsafe {
            header.write(Self {
                prev: None,
                next: None,
                magic: PAGE_MAGIC,
                owner,
                cpu,
                class,
                nalloc: 0,
                free_head: 0,
            });
            for index in 0..count {
                let next = if index + 1 < count {
                    slot_index(index + 1)
                } else {
                    NO_SLOT
                };
                Self::slot(header, class, index).cast::<u16>().write(next);
            }
        }
        header
    }

    unsafe fn slot(header: NonNull<Self>, class: SizeClass, index: usize) -> NonNull<u8> {
        unsafe {
            header
                .cast::<u8>()
                .byte_add(class.first_offset() + index * class.size())
        }
    }

    unsafe fn nalloc(header: NonNull<Self>) -> u16 {
        unsafe { (*header.as_ptr()).nalloc }
    }

    unsafe fn has_free_slot(header: NonNull<Self>) -> bool {
        unsafe { (*header.as_ptr()).free_head != NO_SLOT }
    }

    unsafe fn pop_free(header: NonNull<Self>, class: SizeClass) -> NonNull<u8> {
        unsafe {
            let raw = header.as_ptr();
            let index = (*raw).free_head;
            assert_ne!(index, NO_SLOT);
            let object = Self::slot(header, class, usize::from(index));
            (*raw).free_head = object.cast::<u16>().read();
            (*raw).nalloc += 1;
            object
        }
    }

    unsafe fn push_free(header: NonNull<Self>, class: SizeClass, object: NonNull<u8>) {
        unsafe {
            let raw = header.as_ptr();
            let offset = addr::page_offset(object) - class.first_offset();
            let index = slot_index(offset / class.size());
            object.cast::<u16>().write((*raw).free_head);
            (*raw).free_head = index;
            (*raw).nalloc -= 1;
        }
    }
}

/// Converts a slot number into a free list link.
fn slot_index(slot: usize) -> u16 {
    match u16::try_from(slot) {
        Ok(index) if index != NO_SLOT => index,
        _ => fatal!("slot {slot} does not fit the in-page free list"),
    }
}

/// Pages of one pool and one CPU that have at least one free slot.
#[derive(Debug)]
pub(crate) struct PageList {
    head: Option<NonNull<PageHeader>>,
    tail: Option<NonNull<PageHeader>>,
}

unsafe impl Send for PageList {}

impl ConstInit for PageList {
    const INIT: Self = Self {
        head: None,
        tail: None,
    };
}

impl PageList {
    fn front(&self) -> Option<NonNull<PageHeader>> {
        self.head
    }

    fn back(&self) -> Option<NonNull<PageHeader>> {
        self.tail
    }

    unsafe fn push_front(&mut self, page: NonNull<PageHeader>) {
        unsafe {
            let raw = page.as_ptr();
            (*raw).prev = None;
            (*raw).next = self.head;
            match self.head {
                Some(head) => (*head.as_ptr()).prev = Some(page),
                None => self.tail = Some(page),
            }
        }
        self.head = Some(page);
    }

    unsafe fn push_back(&mut self, page: NonNull<PageHeader>) {
        unsafe {
            let raw = page.as_ptr();
            (*raw).next = None;
            (*raw).prev = self.tail;
            match self.tail {
                Some(tail) => (*tail.as_ptr()).next = Some(page),
                None => self.head = Some(page),
            }
        }
        self.tail = Some(page);
    }

    unsafe fn remove(&mut self, page: NonNull<PageHeader>) {
        unsafe {
            let raw = page.as_ptr();
            let (prev, next) = ((*raw).prev, (*raw).next);
            match prev {
                Some(prev) => (*prev.as_ptr()).next = next,
                None => self.head = next,
            }
            match next {
                Some(next) => (*next.as_ptr()).prev = prev,
                None => self.tail = prev,
            }
            (*raw).prev = None;
            (*raw).next = None;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let mut len = 0;
        let mut cursor = self.head;
        while let Some(page) = cursor {
            len += 1;
            cursor = unsafe { (*page.as_ptr()).next };
        }
        len
    }
}

/// Where pool pages come from.
///
/// Called unpinned.
pub(crate) trait PageSupply {
    fn supply_page(&self) -> NonNull<u8>;
}

/// Snapshot of the state of one size-class pool across all CPUs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolUsage {
    /// Object size of the pool.
    pub object_size: usize,
    /// Pages currently owned by the pool.
    pub pages: usize,
    /// Objects handed out and not yet returned to their owning CPU.
    pub live_objects: usize,
}

#[derive(Debug)]
struct PoolCounters {
    pages: AtomicUsize,
    live: AtomicUsize,
}

impl PoolCounters {
    const fn new() -> Self {
        Self {
            pages: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        }
    }
}

/// One size class, with a page list per CPU.
#[derive(Debug)]
pub(crate) struct SizeClassPool<const CPUS: usize> {
    class: SizeClass,
    free_pages: PerCpu<PageList, CPUS>,
    // written by the owning CPU only
    counters: [CacheAligned<PoolCounters>; CPUS],
}

impl<const CPUS: usize> SizeClassPool<CPUS> {
    pub(crate) const fn new(class: SizeClass) -> Self {
        Self {
            class,
            free_pages: PerCpu::new(),
            counters: [const { CacheAligned(PoolCounters::new()) }; CPUS],
        }
    }

    #[cfg(test)]
    fn class(&self) -> SizeClass {
        self.class
    }

    /// Hands out one object owned by the current CPU.
    pub(crate) fn alloc<P, S>(
        &self,
        cpus: &CpuContext<P, CPUS>,
        supply: &S,
        owner: u32,
    ) -> NonNull<u8>
    where
        P: Platform,
        S: PageSupply,
    {
        loop {
            {
                let pin = cpus.pin();
                let mut pages = self.free_pages.get(&pin);
                if let Some(page) = pages.front() {
                    unsafe {
                        let object = PageHeader::pop_free(page, self.class);
                        if !PageHeader::has_free_slot(page) {
                            pages.remove(page);
                        }
                        self.counters[pin.cpu().index()]
                            .live
                            .fetch_add(1, Ordering::Relaxed);
                        return object;
                    }
                }
            }
            // the page supply may take locks, so get the page unpinned
            self.add_page(cpus, supply, owner);
        }
    }

    fn add_page<P, S>(&self, cpus: &CpuContext<P, CPUS>, supply: &S, owner: u32)
    where
        P: Platform,
        S: PageSupply,
    {
        let page = supply.supply_page();
        let pin = cpus.pin();
        let cpu = pin.cpu();
        unsafe {
            let header = PageHeader::format(page, self.class, cpu, owner);
            self.free_pages.get(&pin).push_back(header);
        }
        self.counters[cpu.index()]
            .pages
            .fetch_add(1, Ordering::Relaxed);
        log::trace!("{} pool: cpu {cpu} added page {page:p}", self.class);
    }

    /// Returns `object` to its page, which the pinned CPU must own.
    ///
    /// A page left with no live object is detached and returned if another
    /// fully free page is already held as a spare. The caller gives it back
    /// to the page supply after unpinning.
    ///
    /// # Safety
    ///
    /// `object` must be a live object of this pool owned by `pin.cpu()`.
    #[must_use]
    pub(crate) unsafe fn free_local<P>(
        &self,
        pin: &CpuPin<'_, P>,
        object: NonNull<u8>,
    ) -> Option<NonNull<u8>>
    where
        P: Platform,
    {
        let cpu = pin.cpu();
        let counters = &self.counters[cpu.index()];
        counters.live.fetch_sub(1, Ordering::Relaxed);

        let mut pages = self.free_pages.get(pin);
        unsafe {
            let page = PageHeader::of(object);
            debug_assert_eq!((*page.as_ptr()).cpu, cpu);
            let was_full = !PageHeader::has_free_slot(page);
            if PageHeader::nalloc(page) == 1 {
                let spare = pages
                    .back()
                    .filter(|&back| back != page && PageHeader::nalloc(back) == 0);
                if spare.is_some() {
                    if !was_full {
                        pages.remove(page);
                    }
                    (*page.as_ptr()).magic = 0;
                    counters.pages.fetch_sub(1, Ordering::Relaxed);
                    log::trace!("{} pool: cpu {cpu} released page {page:p}", self.class);
                    return Some(page.cast());
                }
            }

            PageHeader::push_free(page, self.class, object);
            if was_full {
                if PageHeader::nalloc(page) > 0 {
                    pages.push_front(page);
                } else {
                    pages.push_back(page);
                }
            }
        }
        None
    }

    pub(crate) fn usage(&self) -> PoolUsage {
        let mut usage = PoolUsage {
            object_size: self.class.size(),
            ..PoolUsage::default()
        };
        for counters in &self.counters {
            usage.pages += counters.pages.load(Ordering::Relaxed);
            usage.live_objects += counters.live.load(Ordering::Relaxed);
        }
        usage
    }
}
