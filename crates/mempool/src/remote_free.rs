//! Returning objects to the CPU that owns them.
//!
//! For every ordered pair of CPUs there is one single-producer,
//! single-consumer ring: CPU `source` pushes objects owned by CPU `owner`, and
//! the worker of `owner` pops them. Being pinned is what makes a CPU the only
//! producer (or consumer) of its rings.
//!
//! When a ring is full the object is parked in the overflow slot of the owner
//! instead. That slot holds one object; a CPU finding it occupied kicks the
//! owner's worker and waits until the slot is drained.

use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU32, Ordering},
};

use platform_cast::CastFrom as _;
use spin::Mutex;

use crate::{
    FREE_RING_CAPACITY,
    cpu_local::CacheAligned,
    platform::{CpuContext, CpuId, CpuPin, Platform},
};

/// Bounded lock-free SPSC ring of object pointers.
#[derive(Debug)]
pub(crate) struct FreeRing {
    /// Next position to pop. Written by the consumer.
    head: CacheAligned<AtomicU32>,
    /// Next position to push. Written by the producer.
    tail: CacheAligned<AtomicU32>,
    slots: [AtomicPtr<u8>; FREE_RING_CAPACITY],
}

const RING_CAPACITY: u32 = {
    assert!(FREE_RING_CAPACITY < u32::MAX as usize);
    #[expect(clippy::cast_possible_truncation)]
    let capacity = FREE_RING_CAPACITY as u32;
    capacity
};

impl FreeRing {
    pub(crate) const fn new() -> Self {
        Self {
            head: CacheAligned(AtomicU32::new(0)),
            tail: CacheAligned(AtomicU32::new(0)),
            slots: [const { AtomicPtr::new(ptr::null_mut()) }; FREE_RING_CAPACITY],
        }
    }

    fn slot(&self, position: u32) -> &AtomicPtr<u8> {
        &self.slots[usize::cast_from(position % RING_CAPACITY)]
    }

    /// Pushes `object`; returns `false` if the ring is full.
    ///
    /// Must only be called by the producer.
    pub(crate) fn push(&self, object: NonNull<u8>) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) == RING_CAPACITY {
            return false;
        }
        self.slot(tail).store(object.as_ptr(), Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Must only be called by the consumer.
    pub(crate) fn pop(&self) -> Option<NonNull<u8>> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let object = self.slot(head).load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        NonNull::new(object)
    }

    /// Number of queued objects. Exact only when called by the producer or
    /// the consumer.
    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        usize::cast_from(tail.wrapping_sub(head))
    }
}

#[derive(Debug)]
struct ParkedObject(NonNull<u8>);

unsafe impl Send for ParkedObject {}

/// All free rings and overflow slots of an allocator.
#[derive(Debug)]
pub(crate) struct RemoteFreeChannel<const CPUS: usize> {
    /// Indexed `[owner][source]`.
    rings: [[FreeRing; CPUS]; CPUS],
    overflow: [CacheAligned<Mutex<Option<ParkedObject>>>; CPUS],
}

impl<const CPUS: usize> RemoteFreeChannel<CPUS> {
    pub(crate) const fn new() -> Self {
        Self {
            rings: [const { [const { FreeRing::new() }; CPUS] }; CPUS],
            overflow: [const { CacheAligned(Mutex::new(None)) }; CPUS],
        }
    }

    /// Queues `object` for its owner and consumes the pin.
    ///
    /// The worker of `owner` is signalled once the ring is more than half
    /// full. If the ring is full this waits, unpinned, for the overflow slot
    /// of `owner`.
    pub(crate) fn free_remote<P>(
        &self,
        cpus: &CpuContext<P, CPUS>,
        pin: CpuPin<'_, P>,
        owner: CpuId,
        object: NonNull<u8>,
    ) where
        P: Platform,
    {
        let ring = &self.rings[owner.index()][pin.cpu().index()];
        if ring.push(object) {
            let len = ring.len();
            drop(pin);
            if len > FREE_RING_CAPACITY / 2 {
                cpus.platform().signal_worker(owner);
            }
            return;
        }
        drop(pin);
        self.free_overflow(cpus, owner, object);
    }

    fn free_overflow<P>(&self, cpus: &CpuContext<P, CPUS>, owner: CpuId, object: NonNull<u8>)
    where
        P: Platform,
    {
        log::trace!("free ring to cpu {owner} is full, waiting for overflow slot");
        let platform = cpus.platform();
        loop {
            {
                let pin = cpus.pin();
                let mut slot = self.overflow[owner.index()].lock();
                if slot.is_none() {
                    // the task may have moved while unpinned
                    let ring = &self.rings[owner.index()][pin.cpu().index()];
                    if !ring.push(object) {
                        *slot = Some(ParkedObject(object));
                    }
                    break;
                }
            }
            platform.signal_worker(owner);
            platform.relax();
        }
        platform.signal_worker(owner);
    }

    /// Takes one object queued for the pinned CPU, rings first, then the
    /// overflow slot.
    pub(crate) fn pop<P>(&self, pin: &CpuPin<'_, P>) -> Option<NonNull<u8>>
    where
        P: Platform,
    {
        let owner = pin.cpu().index();
        if let Some(object) = self.rings[owner].iter().find_map(FreeRing::pop) {
            return Some(object);
        }
        let parked = self.overflow[owner].lock().take();
        parked.map(|ParkedObject(object)| object)
    }

    /// Objects queued for `owner` and not yet drained.
    pub(crate) fn pending(&self, owner: CpuId) -> usize {
        let queued: usize = self.rings[owner.index()].iter().map(FreeRing::len).sum();
        queued + usize::from(self.overflow[owner.index()].lock().is_some())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::testing::{self, TestPlatform};

    fn drain<const CPUS: usize>(
        channel: &RemoteFreeChannel<CPUS>,
        cpus: &CpuContext<TestPlatform, CPUS>,
    ) -> Vec<NonNull<u8>> {
        let mut drained = vec![];
        loop {
            let pin = cpus.pin();
            let Some(object) = channel.pop(&pin) else {
                break;
            };
            drained.push(object);
        }
        drained
    }

    fn fake(n: usize) -> NonNull<u8> {
        NonNull::new(ptr::without_provenance_mut((n + 1) * 16)).unwrap()
    }

    #[test]
    fn test_ring_fifo_and_capacity() {
        let ring = FreeRing::new();
        assert!(ring.pop().is_none());
        for round in 0..3 {
            for i in 0..FREE_RING_CAPACITY {
                assert!(ring.push(fake(round * 1000 + i)));
            }
            assert!(!ring.push(fake(9999)));
            assert_eq!(ring.len(), FREE_RING_CAPACITY);
            for i in 0..FREE_RING_CAPACITY {
                assert_eq!(ring.pop(), Some(fake(round * 1000 + i)));
            }
            assert_eq!(ring.len(), 0);
        }
    }

    #[test]
    fn test_ring_across_threads() {
        const COUNT: usize = 100_000;
        let ring = Arc::new(FreeRing::new());

        let producer = thread::spawn({
            let ring = Arc::clone(&ring);
            move || {
                for i in 0..COUNT {
                    while !ring.push(fake(i)) {
                        thread::yield_now();
                    }
                }
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            match ring.pop() {
                Some(object) => {
                    assert_eq!(object, fake(expected));
                    expected += 1;
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(ring.pop().is_none());
    }

    #[test]
    fn test_remote_free_signals_past_half() {
        let cpus = CpuContext::<TestPlatform, 2>::new(TestPlatform::new());
        cpus.enable_smp();
        let channel = Box::new(RemoteFreeChannel::<2>::new());
        let owner = CpuId::new(0);

        testing::set_current_cpu(1);
        for i in 0..=FREE_RING_CAPACITY / 2 {
            channel.free_remote(&cpus, cpus.pin(), owner, fake(i));
        }
        assert_eq!(cpus.platform().take_signals(), [owner]);
        assert_eq!(channel.pending(owner), FREE_RING_CAPACITY / 2 + 1);
        assert_eq!(testing::preempt_depth(), 0);

        testing::set_current_cpu(0);
        let drained = drain(&channel, &cpus);
        assert_eq!(drained.len(), FREE_RING_CAPACITY / 2 + 1);
        assert_eq!(drained[0], fake(0));
        assert_eq!(channel.pending(owner), 0);
    }

    #[test]
    fn test_full_ring_parks_in_overflow_slot() {
        let cpus = CpuContext::<TestPlatform, 2>::new(TestPlatform::new());
        cpus.enable_smp();
        let channel = Box::new(RemoteFreeChannel::<2>::new());
        let owner = CpuId::new(1);

        testing::set_current_cpu(0);
        for i in 0..=FREE_RING_CAPACITY {
            channel.free_remote(&cpus, cpus.pin(), owner, fake(i));
        }
        assert_eq!(channel.pending(owner), FREE_RING_CAPACITY + 1);
        assert!(cpus.platform().take_signals().contains(&owner));

        testing::set_current_cpu(1);
        let drained = drain(&channel, &cpus);
        assert_eq!(drained.len(), FREE_RING_CAPACITY + 1);
        assert_eq!(drained.last(), Some(&fake(FREE_RING_CAPACITY)));
    }

    #[test]
    fn test_overflow_waits_for_drain() {
        let cpus = Arc::new(CpuContext::<TestPlatform, 2>::new(TestPlatform::new()));
        cpus.enable_smp();
        let channel = Arc::new(RemoteFreeChannel::<2>::new());
        let owner = CpuId::new(0);
        const TOTAL: usize = FREE_RING_CAPACITY * 3;

        let producer = thread::spawn({
            let cpus = Arc::clone(&cpus);
            let channel = Arc::clone(&channel);
            move || {
                testing::set_current_cpu(1);
                for i in 0..TOTAL {
                    channel.free_remote(&cpus, cpus.pin(), owner, fake(i));
                }
            }
        });

        testing::set_current_cpu(0);
        let mut drained = vec![];
        while drained.len() < TOTAL {
            drained.extend(drain(&channel, &cpus));
            thread::yield_now();
        }
        producer.join().unwrap();

        drained.sort_unstable();
        let expected: Vec<_> = (0..TOTAL).map(fake).collect();
        assert_eq!(drained, expected);
    }
}
