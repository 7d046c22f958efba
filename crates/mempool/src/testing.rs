//! Test doubles shared by the unit tests.

use std::{
    alloc::{self, Layout},
    cell::{Cell, RefCell},
    ops::Deref,
    ptr::NonNull,
    sync::Mutex,
};

use crate::{CpuId, Mempool, PAGE_SIZE, Platform};

thread_local! {
    static CURRENT_CPU: Cell<u32> = const { Cell::new(0) };
    static PREEMPT_DEPTH: Cell<usize> = const { Cell::new(0) };
    static PREEMPTIBLE_CHECKS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Makes the calling thread report `cpu` as its current CPU.
pub(crate) fn set_current_cpu(cpu: u32) {
    CURRENT_CPU.with(|c| c.set(cpu));
}

/// Preemption nesting depth of the calling thread.
pub(crate) fn preempt_depth() -> usize {
    PREEMPT_DEPTH.with(Cell::get)
}

/// Preemption depths seen by [`Platform::is_preemptible`] on the calling
/// thread since the last call.
pub(crate) fn take_preemptible_checks() -> Vec<usize> {
    PREEMPTIBLE_CHECKS.with(|checks| checks.take())
}

/// Platform where every thread is a CPU of its choosing.
#[derive(Debug)]
pub(crate) struct TestPlatform {
    signals: Mutex<Vec<CpuId>>,
}

impl TestPlatform {
    pub(crate) const fn new() -> Self {
        Self {
            signals: Mutex::new(Vec::new()),
        }
    }

    /// Takes the list of CPUs signalled so far.
    pub(crate) fn take_signals(&self) -> Vec<CpuId> {
        core::mem::take(&mut *self.signals.lock().unwrap())
    }
}

impl Platform for TestPlatform {
    fn current_cpu(&self) -> CpuId {
        CpuId::new(CURRENT_CPU.with(Cell::get))
    }

    fn disable_preemption(&self) {
        PREEMPT_DEPTH.with(|d| d.set(d.get() + 1));
    }

    fn enable_preemption(&self) {
        PREEMPT_DEPTH.with(|d| {
            assert!(d.get() > 0, "unbalanced enable_preemption");
            d.set(d.get() - 1);
        });
    }

    fn signal_worker(&self, cpu: CpuId) {
        assert_eq!(preempt_depth(), 0, "worker signalled with preemption off");
        self.signals.lock().unwrap().push(cpu);
    }

    fn relax(&self) {
        std::thread::yield_now();
    }

    fn is_preemptible(&self) -> bool {
        let depth = preempt_depth();
        PREEMPTIBLE_CHECKS.with(|checks| checks.borrow_mut().push(depth));
        depth == 0
    }
}

/// Heap memory borrowed from the host allocator.
#[derive(Debug)]
pub(crate) struct TestHeap {
    start: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for TestHeap {}
unsafe impl Sync for TestHeap {}

impl TestHeap {
    pub(crate) fn new(size: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(size, align).unwrap();
        let start = NonNull::new(unsafe { alloc::alloc(layout) }).unwrap();
        Self { start, layout }
    }

    pub(crate) fn start(&self) -> NonNull<u8> {
        self.start
    }

    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn fill(&mut self, byte: u8) {
        unsafe {
            self.start.write_bytes(byte, self.layout.size());
        }
    }
}

impl Drop for TestHeap {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.start.as_ptr(), self.layout) };
    }
}

/// A [`Mempool`] that owns the memory donated to it.
pub(crate) struct TestMempool<const CPUS: usize> {
    // dropped before the heap it points into
    pool: Box<Mempool<TestPlatform, CPUS>>,
    heap: TestHeap,
}

impl<const CPUS: usize> TestMempool<CPUS> {
    /// Pool with `pages` pages donated, in early (single CPU) mode.
    pub(crate) fn early(pages: usize) -> Self {
        Self::with_alignment(pages, PAGE_SIZE)
    }

    /// Pool with `pages` pages donated and SMP enabled.
    pub(crate) fn smp(pages: usize) -> Self {
        let pool = Self::early(pages);
        pool.enable_smp();
        pool
    }

    pub(crate) fn with_alignment(pages: usize, align: usize) -> Self {
        set_current_cpu(0);
        let mut heap = TestHeap::new(pages * PAGE_SIZE, align);
        heap.fill(0x11);
        let pool = Box::new(Mempool::new(TestPlatform::new()));
        unsafe {
            pool.donate(heap.start().as_ptr(), heap.size());
        }
        Self { pool, heap }
    }

    pub(crate) fn heap_start(&self) -> NonNull<u8> {
        self.heap.start()
    }
}

impl<const CPUS: usize> Deref for TestMempool<CPUS> {
    type Target = Mempool<TestPlatform, CPUS>;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

/// Fills `size` bytes at `ptr` with `byte`.
pub(crate) fn fill(ptr: NonNull<u8>, size: usize, byte: u8) {
    unsafe { ptr.write_bytes(byte, size) };
}

/// Asserts that `size` bytes at `ptr` all equal `byte`.
pub(crate) fn check(ptr: NonNull<u8>, size: usize, byte: u8) {
    for i in 0..size {
        let value = unsafe { ptr.byte_add(i).read() };
        assert_eq!(value, byte, "byte {i} of object at {ptr:p} was overwritten");
    }
}
