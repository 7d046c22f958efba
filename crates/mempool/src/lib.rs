//! General-purpose kernel memory allocator with per-CPU pools.
//!
//! This crate provides the dynamic memory allocator of a single-address-space
//! kernel running on many logical CPUs. It serves two very different
//! allocation patterns without taking a global lock on the common path:
//!
//! - frequent small allocations (up to half a page), served from per-CPU
//!   size-class pools, and
//! - page-granular allocations, including large objects and naturally aligned
//!   huge regions, carved from one address-ordered set of free page ranges.
//!
//! The allocator deduces the size of an object from its address alone, so
//! [`Mempool::free`] takes no size argument, and any CPU may free any object.
//!
//! # Tiers
//!
//! ## Page source
//!
//! Every byte handed to the allocator with [`Mempool::donate`] lands in an
//! address-ordered list of free page ranges kept inside the free memory
//! itself. Allocation is first-fit and carves from the high end of a range;
//! freeing coalesces with both neighbors immediately, so two free ranges are
//! never adjacent. The page source is the only globally locked structure.
//!
//! ## Per-CPU page cache
//!
//! Each CPU keeps up to [`PAGE_CACHE_CAPACITY`] spare pages. Single-page
//! allocations and frees hit the cache; the page source lock is taken only to
//! refill or drain half of the cache at once.
//!
//! ## Size-class pools
//!
//! One pool per power of two from [`MIN_OBJECT_SIZE`] to [`MAX_OBJECT_SIZE`].
//! A pool page starts with a header naming its pool, its owning CPU and its
//! number of live objects; the rest of the page is sliced into objects. The
//! header of any object is found by rounding the object address down to the
//! page boundary, which works because pool objects are never page aligned.
//!
//! ## Cross-CPU free channel
//!
//! Freeing an object on a CPU other than its owner pushes it onto a lock-free
//! single-producer/single-consumer ring dedicated to that pair of CPUs. The
//! owner's worker task ([`Mempool::drain_remote_frees`]) later returns the
//! objects to the pool. When a ring is full, one object per owner may be
//! parked in a mutex-guarded overflow slot.
//!
//! ## Large and huge objects
//!
//! Requests above [`MAX_OBJECT_SIZE`] get whole pages plus a header page that
//! records the size. Huge pages are naturally aligned, header-less windows
//! that the caller frees with their size.
//!
//! # Collaborators
//!
//! The embedding kernel implements [`Platform`]: it reports the current CPU,
//! disables and enables preemption, and runs the per-CPU worker task when
//! asked to. Memory-pressure clients register through [`ShrinkerRegistry`].
//!
//! # Failure model
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | small or page allocation, page source empty | panic (fatal) |
//! | large or huge allocation, no range fits | [`AllocError::OutOfMemory`] |
//! | bad alignment, size overflow, misaligned page free | [`AllocError`] |
//! | corrupted header, double free of a range | panic (fatal) |
//!
//! # Usage
//!
//! ```rust,ignore
//! use mempool::{CpuId, Mempool, Platform};
//!
//! struct Kernel;
//!
//! impl Platform for Kernel {
//!     fn current_cpu(&self) -> CpuId { /* read the per-CPU register */ }
//!     fn disable_preemption(&self) { /* bump the preempt counter */ }
//!     fn enable_preemption(&self) { /* drop the preempt counter */ }
//!     fn signal_worker(&self, cpu: CpuId) { /* wake the drain task of `cpu` */ }
//! }
//!
//! #[global_allocator]
//! static HEAP: Mempool<Kernel, 8> = Mempool::new(Kernel);
//!
//! unsafe { HEAP.donate(ram_start, ram_size) };
//! HEAP.enable_smp();
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use self::{
    error::AllocError,
    frontend::{Mempool, PoolSummary},
    platform::{CpuId, Platform},
    pool::PoolUsage,
    shrinker::{Shrinker, ShrinkerId, ShrinkerRegistry},
};

mod addr;
mod cpu_local;
mod error;
mod frontend;
mod large;
mod page_cache;
mod page_source;
mod platform;
mod pool;
mod remote_free;
mod shrinker;
#[cfg(test)]
mod testing;

/// Size of a page, the granularity of the page source.
pub const PAGE_SIZE: usize = 4096;
/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: usize = 12;
const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);

/// Smallest size class.
pub const MIN_OBJECT_SIZE: usize = 16;
/// Largest size class; bigger requests take the large-object path.
pub const MAX_OBJECT_SIZE: usize = PAGE_SIZE / 2;
const _: () = assert!(MIN_OBJECT_SIZE.is_power_of_two() && MAX_OBJECT_SIZE.is_power_of_two());

/// Number of spare pages each CPU may hold.
pub const PAGE_CACHE_CAPACITY: usize = 512;

/// Entries in each cross-CPU free ring.
pub const FREE_RING_CAPACITY: usize = 256;
const _: () = assert!(FREE_RING_CAPACITY.is_power_of_two());

/// Offset of sub-page objects handed out before [`Mempool::enable_smp`].
///
/// Pool objects sit at multiples of their class size, so this offset never
/// collides with one.
pub const EARLY_OBJECT_OFFSET: usize = 8;
const _: () = assert!(EARLY_OBJECT_OFFSET < MIN_OBJECT_SIZE);

/// Capacity of a [`ShrinkerRegistry`].
pub const MAX_SHRINKERS: usize = 16;
