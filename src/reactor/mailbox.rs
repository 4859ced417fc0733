//! The per-reactor cross-thread notifier mailbox (§4.2).
//!
//! Any thread may call [`NotifierMailbox::post`] to schedule a closure to
//! run on the owning reactor thread — this is the sole primitive behind
//! `RegisterRead`/`RegisterWrite`/`Unregister`/`Close`/`Post` (§6): each is
//! sugar over "run this against the reactor on its own thread". The
//! mailbox is an MPSC ring queue (C1) paired with a [`mio::Waker`] so the
//! owning reactor's poll wakes up even when no descriptor is ready.
//! Writers that find the ring full fall back to a spin-and-retry slow
//! path rather than lose the intent (§4.2 "must never lose the intent").

use crate::queue::{MpscQueue, RingQueue, WaitStrategy};
use crate::reactor::reactor::Reactor;
use mio::Waker;
use std::sync::Arc;

/// A unit of work queued for the owning reactor thread.
pub type Intent = Box<dyn FnOnce(&mut Reactor) + Send>;

/// MPSC ring + waker: the sole path by which other threads schedule work
/// on a reactor.
pub struct NotifierMailbox {
    queue: MpscQueue<Intent>,
    waker: Arc<Waker>,
}

impl NotifierMailbox {
    pub fn new(capacity: usize, waker: Arc<Waker>) -> Self {
        NotifierMailbox {
            queue: RingQueue::new(capacity, WaitStrategy::None),
            waker,
        }
    }

    /// Enqueue `intent` and wake the reactor. Never drops the intent: on a
    /// full ring it spins, retrying the push, before waking (§4.2 "must
    /// never lose the intent").
    pub fn post(&self, intent: Intent) {
        let mut intent = intent;
        while let Err(rejected) = self.queue.push(intent) {
            intent = rejected;
            std::hint::spin_loop();
        }
        let _ = self.waker.wake();
    }

    /// Drain every pending intent, applying each to `reactor`. Called once
    /// per loop iteration, to empty (§4.2: "drained to empty per loop
    /// iteration, so a post is observed within one wake latency").
    pub fn drain(&self, reactor: &mut Reactor) {
        while let Some(intent) = self.queue.try_pop() {
            intent(reactor);
        }
    }
}
