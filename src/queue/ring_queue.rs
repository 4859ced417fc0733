//! The bounded ring-buffer queue that backs every cross-thread handoff in
//! the runtime: reactor notifier mailboxes, stage normal/priority queues,
//! and per-worker resume channels are all a [`RingQueue`] instantiated with
//! a different producer/consumer [`Cursor`] pair.
//!
//! Producer and consumer cardinality is a compile-time choice (per DESIGN
//! NOTES §9: template-parameterised queue flavours, not runtime
//! polymorphism) so the single-producer/single-consumer fast path never
//! pays for a CAS it doesn't need. [`SpscQueue`], [`MpscQueue`],
//! [`SpmcQueue`] and [`MpmcQueue`] are the four flavours; callers pick one
//! at construction time based on `share_queue`/`share_handler` (see
//! [`crate::stage`]).

use crate::queue::cursor::{CasCursor, Cursor, PlainCursor};
use crate::queue::utils::{assert_buffer_size_pow_of_2, wrap_index};
use crate::queue::wait_strategy::WaitStrategy;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

const EMPTY: u8 = 0;
const OCCUPIED: u8 = 1;

struct Slot<T> {
    flag: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot {
            flag: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// A bounded, power-of-two-sized ring queue parameterised by producer and
/// consumer [`Cursor`] flavour.
///
/// `P = PlainCursor` means single-producer; `P = CasCursor` means
/// multi-producer. Symmetrically for the consumer side `C`.
pub struct RingQueue<T, P: Cursor, C: Cursor> {
    slots: Box<[Slot<T>]>,
    mask: i64,
    producer: P,
    consumer: C,
    wait_strategy: WaitStrategy,
}

/// Single-producer, single-consumer.
pub type SpscQueue<T> = RingQueue<T, PlainCursor, PlainCursor>;
/// Multi-producer, single-consumer.
pub type MpscQueue<T> = RingQueue<T, CasCursor, PlainCursor>;
/// Single-producer, multi-consumer.
pub type SpmcQueue<T> = RingQueue<T, PlainCursor, CasCursor>;
/// Multi-producer, multi-consumer.
pub type MpmcQueue<T> = RingQueue<T, CasCursor, CasCursor>;

impl<T, P: Cursor, C: Cursor> RingQueue<T, P, C> {
    pub fn new(size: usize, wait_strategy: WaitStrategy) -> Self {
        let size = assert_buffer_size_pow_of_2(size);
        RingQueue {
            slots: (0..size).map(|_| Slot::default()).collect::<Vec<_>>().into_boxed_slice(),
            mask: (size - 1) as i64,
            producer: P::default(),
            consumer: C::default(),
            wait_strategy,
        }
    }

    /// Push `value` into the queue. Never blocks: on a full queue `value`
    /// is handed back via `Err` so a caller that must not lose it (e.g.
    /// [`crate::reactor::mailbox::NotifierMailbox`]) can spin and retry
    /// without a throwaway placeholder. Callers that only need the
    /// spec's `Push(value) -> bool` signature use `.is_ok()`.
    pub fn push(&self, value: T) -> Result<(), T> {
        loop {
            let current = self.producer.get();
            let next = current + 1;
            let index = wrap_index(next, self.mask);
            let slot = &self.slots[index];
            if slot.flag.load(Ordering::Acquire) == OCCUPIED {
                return Err(value);
            }
            if !self.producer.advance(current) {
                continue;
            }
            unsafe { (*slot.value.get()).write(value) };
            slot.flag.store(OCCUPIED, Ordering::Release);
            self.wait_strategy.notify();
            return Ok(());
        }
    }

    /// Pop the next value, waiting according to `timeout` per the queue's
    /// [`WaitStrategy`]. `timeout = None` waits forever (if the strategy
    /// supports it); `Some(Duration::ZERO)` is a non-blocking poll.
    pub fn pop_timeout(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            let current = self.consumer.get();
            let next = current + 1;
            let index = wrap_index(next, self.mask);
            let slot = &self.slots[index];
            if slot.flag.load(Ordering::Acquire) != OCCUPIED {
                if timeout == Some(Duration::ZERO) {
                    return None;
                }
                if !self.wait_strategy.wait(deadline) {
                    return None;
                }
                continue;
            }
            if !self.consumer.advance(current) {
                continue;
            }
            let value = unsafe { (*slot.value.get()).assume_init_read() };
            slot.flag.store(EMPTY, Ordering::Release);
            return Some(value);
        }
    }

    /// Non-blocking pop: equivalent to `pop_timeout(Some(Duration::ZERO))`.
    pub fn try_pop(&self) -> Option<T> {
        self.pop_timeout(Some(Duration::ZERO))
    }

    /// Best-effort snapshot of occupied slots. Not a synchronisation point
    /// (§4.1): the two halves may be read mid-update, and the result
    /// saturates to `0` rather than wrapping negative.
    pub fn len(&self) -> usize {
        let produced = self.producer.get();
        let consumed = self.consumer.get();
        (produced - consumed).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }
}

unsafe impl<T: Send, P: Cursor, C: Cursor> Send for RingQueue<T, P, C> {}
unsafe impl<T: Send, P: Cursor, C: Cursor> Sync for RingQueue<T, P, C> {}

/// Object-safe face of [`RingQueue`], so a stage can hold "some ring queue
/// flavour" (MPSC per worker, or MPMC shared, per §4.4) behind one
/// `Arc<dyn Queue<Message>>` without naming the cursor type parameters at
/// every call site.
pub trait Queue<T>: Send + Sync {
    fn push(&self, value: T) -> Result<(), T>;
    fn try_pop(&self) -> Option<T>;
    fn pop_timeout(&self, timeout: Duration) -> Option<T>;
    fn len(&self) -> usize;
}

impl<T: Send, P: Cursor, C: Cursor> Queue<T> for RingQueue<T, P, C> {
    fn push(&self, value: T) -> Result<(), T> {
        RingQueue::push(self, value)
    }

    fn try_pop(&self) -> Option<T> {
        RingQueue::try_pop(self)
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        RingQueue::pop_timeout(self, Some(timeout))
    }

    fn len(&self) -> usize {
        RingQueue::len(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::wait_strategy::WaitStrategy;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn spsc_push_pop_round_trips() {
        let q: SpscQueue<u32> = RingQueue::new(4, WaitStrategy::None);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn push_fails_when_full() {
        let q: SpscQueue<u32> = RingQueue::new(2, WaitStrategy::None);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.try_pop(), Some(1));
        assert!(q.push(3).is_ok());
    }

    #[test]
    fn size_one_queue_is_a_rendezvous() {
        let q: SpscQueue<u32> = RingQueue::new(1, WaitStrategy::None);
        assert!(q.push(7).is_ok());
        assert_eq!(q.push(8), Err(8));
        assert_eq!(q.try_pop(), Some(7));
        assert!(q.push(8).is_ok());
        assert_eq!(q.try_pop(), Some(8));
    }

    #[test]
    fn mpmc_conserves_every_item_across_producers_and_consumers() {
        let q: Arc<MpmcQueue<u64>> = Arc::new(RingQueue::new(64, WaitStrategy::block()));
        let total = Arc::new(AtomicUsize::new(0));
        thread::scope(|scope| {
            for p in 0..4u64 {
                let q = q.clone();
                scope.spawn(move || {
                    for i in 0..1000u64 {
                        let mut item = p * 1000 + i;
                        while let Err(back) = q.push(item) {
                            item = back;
                            std::hint::spin_loop();
                        }
                    }
                });
            }
            for _ in 0..4 {
                let q = q.clone();
                let total = total.clone();
                scope.spawn(move || {
                    let mut count = 0;
                    while count < 1000 {
                        if q.pop_timeout(Some(Duration::from_millis(50))).is_some() {
                            count += 1;
                        }
                    }
                    total.fetch_add(count, Ordering::Relaxed);
                });
            }
        });
        assert_eq!(total.load(Ordering::Relaxed), 4000);
        assert!(q.is_empty());
    }

    #[test]
    fn priority_precedence_is_caller_responsibility_at_the_stage_level() {
        // The ring queue itself has no concept of priority; §8 property 4
        // (priority precedence) is a Stage-level invariant (crate::stage),
        // exercised there. Here we only confirm two independent queues
        // don't interact.
        let normal: SpscQueue<u32> = RingQueue::new(4, WaitStrategy::None);
        let priority: SpscQueue<u32> = RingQueue::new(4, WaitStrategy::None);
        assert!(normal.push(1).is_ok());
        assert!(priority.push(2).is_ok());
        assert_eq!(priority.try_pop(), Some(2));
        assert_eq!(normal.try_pop(), Some(1));
    }
}
