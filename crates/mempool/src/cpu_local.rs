//! Per-CPU storage reachable only through a [`CpuPin`].

use core::{
    cell::{RefCell, RefMut},
    ops::{Deref, DerefMut},
};

use crate::{
    error::fatal,
    platform::{CpuPin, Platform},
};

/// Types with a constant initial value, usable in `static` per-CPU arrays.
pub(crate) trait ConstInit {
    const INIT: Self;
}

/// Keeps `T` on its own cache line.
#[derive(Debug, Default)]
#[repr(align(64))]
pub(crate) struct CacheAligned<T>(pub(crate) T);

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// One `T` per CPU.
///
/// The slot of a CPU is only touched by tasks pinned to that CPU, so the
/// `RefCell` only ever sees one thread. A second borrow of the same slot means
/// the allocator was re-entered from inside itself (an interrupt handler that
/// allocates, for instance), which is reported as a fatal error.
#[derive(Debug)]
pub(crate) struct PerCpu<T, const CPUS: usize> {
    slots: [CacheAligned<RefCell<T>>; CPUS],
}

unsafe impl<T, const CPUS: usize> Sync for PerCpu<T, CPUS> where T: Send {}

impl<T, const CPUS: usize> PerCpu<T, CPUS>
where
    T: ConstInit,
{
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { CacheAligned(RefCell::new(T::INIT)) }; CPUS],
        }
    }
}

impl<T, const CPUS: usize> PerCpu<T, CPUS> {
    /// Borrows the slot of the pinned CPU.
    pub(crate) fn get<'a, P>(&'a self, pin: &'a CpuPin<'_, P>) -> RefMut<'a, T>
    where
        P: Platform,
    {
        let cpu = pin.cpu();
        let Ok(slot) = self.slots[cpu.index()].try_borrow_mut() else {
            fatal!("re-entrant access to per-cpu state of cpu {cpu}");
        };
        slot
    }
}
