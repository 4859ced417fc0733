//! C3: the I/O Descriptor Registry.
//!
//! A fixed-capacity slab of slots, each tagged with a generation counter,
//! mapping a stable `(slot, generation)` handle to an I/O object
//! (listener, connection, client channel, timer). [`Descriptor`] is the
//! *only* cross-thread reference to the object (§3); raw access to the
//! slot contents stays with the owning reactor.
//!
//! [`Descriptor::is_live`]-style checks (via [`DescriptorRegistry::is_live`])
//! are lock-free: the generation table is a plain atomic array, so Lookup
//! is safe against concurrent Allocate/Release without taking the slot
//! lock (§4.3 invariant).

use crate::error::RuntimeError;
use parking_lot::Mutex;
use slab::Slab;
use std::sync::atomic::{AtomicU32, Ordering};

/// Stable handle to an I/O object. Two descriptors are equal only if both
/// the slot and the generation match; a reused slot with a bumped
/// generation compares unequal to the original.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor {
    slot: u32,
    generation: u32,
}

impl Descriptor {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// A descriptor not backed by any registry slot, for logging/keying
    /// purposes only (e.g. a coroutine timer that has no I/O object of
    /// its own). Never compares equal to a registry-allocated descriptor
    /// with the same slot, since those start at generation 0.
    pub fn synthetic(slot: u32) -> Self {
        Descriptor { slot, generation: u32::MAX }
    }
}

/// A fixed-capacity registry of `T` (listener/connection/client
/// channel/timer objects), keyed by [`Descriptor`].
///
/// Storage is a `slab::Slab`, which reuses the smallest free key on
/// insert; the generation table is indexed by that same key and never
/// shrinks, so a stale `Descriptor` is detected even after its slot is
/// handed to a new object.
pub struct DescriptorRegistry<T> {
    slab: Mutex<Slab<T>>,
    capacity: usize,
    generations: Box<[AtomicU32]>,
}

impl<T> DescriptorRegistry<T> {
    pub fn new(capacity: usize) -> Self {
        DescriptorRegistry {
            slab: Mutex::new(Slab::with_capacity(capacity)),
            capacity,
            generations: (0..capacity).map(|_| AtomicU32::new(0)).collect::<Vec<_>>().into_boxed_slice(),
        }
    }

    /// Allocate a slot for `object`, returning its stable descriptor. The
    /// descriptor's generation is whatever the slot is currently at — it
    /// only advances on [`release`](Self::release), per §4.3.
    /// Fails with [`RuntimeError::Fatal`] when the registry is exhausted
    /// (no free slot).
    pub fn allocate(&self, object: T) -> Result<Descriptor, RuntimeError> {
        let mut slab = self.slab.lock();
        if slab.len() >= self.capacity {
            return Err(RuntimeError::fatal("descriptor registry exhausted"));
        }
        let slot = slab.insert(object) as u32;
        let generation = self.generations[slot as usize].load(Ordering::Acquire);
        Ok(Descriptor { slot, generation })
    }

    /// Release the object behind `descriptor`, returning it if the
    /// descriptor was still live. A stale descriptor (already released,
    /// or reused under a newer generation) returns `None`. Bumps the
    /// slot's generation so the released descriptor reads as "gone"
    /// immediately, even before the slot is reallocated.
    pub fn release(&self, descriptor: Descriptor) -> Option<T> {
        let mut slab = self.slab.lock();
        if !self.is_live(descriptor) {
            return None;
        }
        let object = slab.remove(descriptor.slot as usize);
        let next_generation = descriptor
            .generation
            .checked_add(1)
            .unwrap_or_else(|| panic!("descriptor generation counter wrapped for slot {}", descriptor.slot));
        self.generations[descriptor.slot as usize].store(next_generation, Ordering::Release);
        Some(object)
    }

    /// Lock-free liveness check: `true` iff `descriptor`'s generation
    /// still matches the slot's current generation.
    pub fn is_live(&self, descriptor: Descriptor) -> bool {
        match self.generations.get(descriptor.slot as usize) {
            Some(generation) => generation.load(Ordering::Acquire) == descriptor.generation,
            None => false,
        }
    }

    /// Reconstruct the current live descriptor for a bare slot index, as
    /// recovered from an event source (e.g. `mio::Token`) that only
    /// carries the slot. Returns `None` if the slot is currently free.
    pub fn current(&self, slot: u32) -> Option<Descriptor> {
        let slab = self.slab.lock();
        if slab.contains(slot as usize) {
            Some(Descriptor {
                slot,
                generation: self.generations[slot as usize].load(Ordering::Acquire),
            })
        } else {
            None
        }
    }

    /// Run `f` against the live object behind `descriptor`. Returns `None`
    /// ("gone") if the descriptor is stale.
    pub fn with<R>(&self, descriptor: Descriptor, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slab = self.slab.lock();
        if !self.is_live(descriptor) {
            return None;
        }
        slab.get(descriptor.slot as usize).map(f)
    }

    pub fn with_mut<R>(&self, descriptor: Descriptor, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slab = self.slab.lock();
        if !self.is_live(descriptor) {
            return None;
        }
        slab.get_mut(descriptor.slot as usize).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_release_makes_the_descriptor_gone() {
        let registry: DescriptorRegistry<&'static str> = DescriptorRegistry::new(4);
        let d = registry.allocate("conn").unwrap();
        assert!(registry.is_live(d));
        assert_eq!(registry.release(d), Some("conn"));
        assert!(!registry.is_live(d));
        assert_eq!(registry.release(d), None);
    }

    #[test]
    fn reused_slot_gets_a_fresh_generation() {
        let registry: DescriptorRegistry<u32> = DescriptorRegistry::new(1);
        let first = registry.allocate(1).unwrap();
        registry.release(first);
        let second = registry.allocate(2).unwrap();
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first.generation(), second.generation());
        assert!(!registry.is_live(first));
        assert!(registry.is_live(second));
    }

    #[test]
    fn exhausted_registry_is_fatal() {
        let registry: DescriptorRegistry<u32> = DescriptorRegistry::new(1);
        registry.allocate(1).unwrap();
        let err = registry.allocate(2).unwrap_err();
        assert_eq!(err.kind(), crate::error::RuntimeErrorKind::Fatal);
    }
}
