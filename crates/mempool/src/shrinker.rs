//! Registry of caches that can give memory back under pressure.

use arrayvec::ArrayVec;
use snafu::ensure;
use spin::Mutex;

use crate::{
    MAX_SHRINKERS,
    error::{AllocError, alloc_error},
};

/// A memory consumer that can shrink or grow on request.
pub trait Shrinker: Sync {
    fn name(&self) -> &str;

    /// Frees up to `target` bytes and returns the number of bytes freed.
    fn release_memory(&self, target: usize) -> usize;

    /// Offers the consumer `target` bytes of headroom. Returns the number of
    /// bytes it took.
    fn request_memory(&self, target: usize) -> usize;
}

/// Handle returned by [`ShrinkerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("shrinker#{_0}")]
pub struct ShrinkerId(usize);

#[derive(Clone, Copy)]
struct Entry {
    shrinker: &'static dyn Shrinker,
    active: bool,
}

/// Fixed-capacity list of registered shrinkers.
///
/// Callbacks run without the registry lock held, so a shrinker may call back
/// into the registry.
pub struct ShrinkerRegistry {
    entries: Mutex<ArrayVec<Entry, MAX_SHRINKERS>>,
}

impl core::fmt::Debug for ShrinkerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let entries = self.entries.lock();
        f.debug_list()
            .entries(
                entries
                    .iter()
                    .map(|entry| (entry.shrinker.name(), entry.active)),
            )
            .finish()
    }
}

impl Default for ShrinkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ShrinkerRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(ArrayVec::new_const()),
        }
    }

    /// Adds `shrinker`, initially active.
    pub fn register(&self, shrinker: &'static dyn Shrinker) -> Result<ShrinkerId, AllocError> {
        let mut entries = self.entries.lock();
        ensure!(!entries.is_full(), alloc_error::RegistryFullSnafu);
        let id = ShrinkerId(entries.len());
        entries.push(Entry {
            shrinker,
            active: true,
        });
        log::debug!("registered {id} ({})", shrinker.name());
        Ok(id)
    }

    pub fn activate(&self, id: ShrinkerId) {
        self.set_active(id, true);
    }

    /// Excludes `id` from [`release`](Self::release) and
    /// [`request`](Self::request) until it is activated again.
    pub fn deactivate(&self, id: ShrinkerId) {
        self.set_active(id, false);
    }

    fn set_active(&self, id: ShrinkerId, active: bool) {
        if let Some(entry) = self.entries.lock().get_mut(id.0) {
            entry.active = active;
        }
    }

    #[must_use]
    pub fn is_active(&self, id: ShrinkerId) -> bool {
        self.entries
            .lock()
            .get(id.0)
            .is_some_and(|entry| entry.active)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Asks active shrinkers, in registration order, to free memory until
    /// `target` bytes are freed. Returns the bytes freed.
    pub fn release(&self, target: usize) -> usize {
        let freed = self.walk(target, |shrinker, remaining| shrinker.release_memory(remaining));
        log::debug!("shrinkers released {freed} of {target} bytes");
        freed
    }

    /// Offers `target` bytes to active shrinkers in registration order.
    /// Returns the bytes taken.
    pub fn request(&self, target: usize) -> usize {
        self.walk(target, |shrinker, remaining| shrinker.request_memory(remaining))
    }

    fn walk(&self, target: usize, mut call: impl FnMut(&dyn Shrinker, usize) -> usize) -> usize {
        let entries = self.entries.lock().clone();
        let mut done = 0;
        for entry in entries.iter().filter(|entry| entry.active) {
            if done >= target {
                break;
            }
            done += call(entry.shrinker, target - done);
        }
        done
    }
}
