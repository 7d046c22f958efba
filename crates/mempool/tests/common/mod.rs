use std::{
    alloc::{self, Layout},
    cell::Cell,
    sync::atomic::{AtomicBool, Ordering},
};

use mempool::{CpuId, Mempool, Platform};

pub const CPUS: usize = 2;

thread_local! {
    static CURRENT_CPU: Cell<u32> = const { Cell::new(0) };
}

/// Makes the calling thread act as `cpu`.
pub fn run_as_cpu(cpu: u32) {
    CURRENT_CPU.with(|c| c.set(cpu));
}

/// Each test thread plays one CPU; nothing preempts it.
#[derive(Debug)]
pub struct ThreadPlatform {
    signalled: [AtomicBool; CPUS],
}

impl ThreadPlatform {
    pub const fn new() -> Self {
        Self {
            signalled: [const { AtomicBool::new(false) }; CPUS],
        }
    }

    pub fn take_signal(&self, cpu: u32) -> bool {
        self.signalled[usize::try_from(cpu).unwrap()].swap(false, Ordering::AcqRel)
    }
}

impl Platform for ThreadPlatform {
    fn current_cpu(&self) -> CpuId {
        CpuId::new(CURRENT_CPU.with(Cell::get))
    }

    fn disable_preemption(&self) {}

    fn enable_preemption(&self) {}

    fn signal_worker(&self, cpu: CpuId) {
        self.signalled[cpu.index()].store(true, Ordering::Release);
    }

    fn relax(&self) {
        std::thread::yield_now();
    }
}

pub type TestPool = Mempool<ThreadPlatform, CPUS>;

/// Builds an SMP allocator over a leaked heap of `size` bytes.
pub fn leaked_pool(size: usize) -> &'static TestPool {
    let _ = env_logger::builder().is_test(true).try_init();
    let layout = Layout::from_size_align(size, mempool::PAGE_SIZE).unwrap();
    let heap = unsafe { alloc::alloc(layout) };
    assert!(!heap.is_null());
    let pool: &'static TestPool = Box::leak(Box::new(Mempool::new(ThreadPlatform::new())));
    run_as_cpu(0);
    let donated = unsafe { pool.donate(heap, size) };
    assert_eq!(donated, size);
    pool.enable_smp();
    pool
}
