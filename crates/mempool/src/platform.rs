//! Kernel services the allocator depends on.

use core::{
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
};

use platform_cast::CastFrom as _;

use crate::error::fatal;

/// Identifier of a logical CPU, dense from zero.
#[derive(
    Debug,
    derive_more::Display,
    derive_more::From,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// The CPU that runs the kernel before secondary CPUs start.
    pub const BOOT: Self = Self(0);

    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn index(self) -> usize {
        usize::cast_from(self.0)
    }
}

/// Services the embedding kernel provides.
///
/// Preemption control nests: every [`disable_preemption`] is paired with one
/// [`enable_preemption`], and the task must stay on its CPU in between.
///
/// [`disable_preemption`]: Platform::disable_preemption
/// [`enable_preemption`]: Platform::enable_preemption
pub trait Platform: Sync {
    /// CPU the calling task currently runs on.
    fn current_cpu(&self) -> CpuId;

    fn disable_preemption(&self);

    fn enable_preemption(&self);

    /// Asks the worker task of `cpu` to run [`Mempool::drain_remote_frees`].
    ///
    /// Must not block. Called with preemption enabled.
    ///
    /// [`Mempool::drain_remote_frees`]: crate::Mempool::drain_remote_frees
    fn signal_worker(&self, cpu: CpuId);

    /// Busy-wait hint used while waiting for another CPU.
    fn relax(&self) {
        core::hint::spin_loop();
    }

    /// Returns `false` while preemption is disabled.
    ///
    /// Checked before taking the page source lock, which must never be
    /// acquired by a pinned task.
    fn is_preemptible(&self) -> bool {
        true
    }
}

/// CPU bookkeeping shared by all allocator tiers.
#[derive(Debug)]
pub(crate) struct CpuContext<P, const CPUS: usize> {
    platform: P,
    smp: AtomicBool,
}

impl<P, const CPUS: usize> CpuContext<P, CPUS>
where
    P: Platform,
{
    pub(crate) const fn new(platform: P) -> Self {
        const { assert!(CPUS > 0 && CPUS <= u32::MAX as usize) };
        Self {
            platform,
            smp: AtomicBool::new(false),
        }
    }

    pub(crate) fn platform(&self) -> &P {
        &self.platform
    }

    /// Returns `true` once the per-CPU tiers are active.
    pub(crate) fn is_smp(&self) -> bool {
        self.smp.load(Ordering::Acquire)
    }

    pub(crate) fn enable_smp(&self) {
        self.smp.store(true, Ordering::Release);
    }

    /// Pins the calling task to its CPU until the returned guard drops.
    ///
    /// Before SMP is enabled everything runs as the boot CPU.
    pub(crate) fn pin(&self) -> CpuPin<'_, P> {
        self.platform.disable_preemption();
        let cpu = if self.is_smp() {
            self.platform.current_cpu()
        } else {
            CpuId::BOOT
        };
        let pin = CpuPin {
            platform: &self.platform,
            cpu,
            _not_send: PhantomData,
        };
        if cpu.index() >= CPUS {
            fatal!("cpu {cpu} out of range (max {CPUS})");
        }
        pin
    }
}

/// Proof that preemption is disabled on [`CpuPin::cpu`].
///
/// Per-CPU state is only reachable through a pin, and a pin cannot leave the
/// task that created it.
#[derive(Debug)]
pub(crate) struct CpuPin<'a, P>
where
    P: Platform,
{
    platform: &'a P,
    cpu: CpuId,
    _not_send: PhantomData<*mut ()>,
}

impl<P> CpuPin<'_, P>
where
    P: Platform,
{
    pub(crate) fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl<P> Drop for CpuPin<'_, P>
where
    P: Platform,
{
    fn drop(&mut self) {
        self.platform.enable_preemption();
    }
}
