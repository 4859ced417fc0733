//! Producer/consumer cursor flavours for [`RingQueue`](super::ring_queue::RingQueue).
//!
//! Single-producer and single-consumer queues never contend on their own
//! cursor, so advancing it is a plain store. Multi-producer and
//! multi-consumer queues share the cursor across threads and must advance it
//! with a compare-and-swap loop. The two are distinct types rather than one
//! type with a runtime flag so the choice is resolved at compile time and
//! the single-threaded fast path never pays for a CAS it doesn't need.

use crate::queue::sequence::Sequence;

/// A cursor tracks one side (producer or consumer) of a ring queue.
pub trait Cursor: Default + Send + Sync {
    /// Current published value.
    fn get(&self) -> i64;

    /// Attempt to move the cursor from `current` to `current + 1`.
    /// Returns `false` if another thread already claimed this step
    /// (only possible for the multi-* flavour; single-* always succeeds).
    fn advance(&self, current: i64) -> bool;
}

/// Single-producer or single-consumer cursor: owned by exactly one thread,
/// so advancing it is an unconditional store.
#[derive(Default)]
pub struct PlainCursor(Sequence);

impl Cursor for PlainCursor {
    #[inline(always)]
    fn get(&self) -> i64 {
        self.0.get_relaxed()
    }

    #[inline(always)]
    fn advance(&self, current: i64) -> bool {
        self.0.set_relaxed(current + 1);
        true
    }
}

/// Multi-producer or multi-consumer cursor: contended across threads,
/// advanced with a CAS retry loop at the call site (`advance` performs a
/// single attempt; callers re-read and retry on failure).
#[derive(Default)]
pub struct CasCursor(Sequence);

impl Cursor for CasCursor {
    #[inline(always)]
    fn get(&self) -> i64 {
        self.0.get_relaxed()
    }

    #[inline(always)]
    fn advance(&self, current: i64) -> bool {
        self.0.compare_and_exchange_weak_volatile(current, current + 1)
    }
}
