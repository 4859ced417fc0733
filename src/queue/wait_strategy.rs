//! Pluggable wait strategies for [`RingQueue::pop`](super::ring_queue::RingQueue::pop).
//!
//! Push never blocks regardless of strategy (see §4.1 of the runtime spec);
//! the strategy only governs how a consumer waits for a slot to become
//! occupied, and is notified by every successful push.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct BlockState {
    mutex: Mutex<()>,
    condvar: Condvar,
}

/// How a [`RingQueue`](super::ring_queue::RingQueue) consumer waits when it
/// finds no occupied slot.
#[derive(Clone)]
pub enum WaitStrategy {
    /// Fail immediately; never parks the calling thread.
    None,
    /// Busy-spin until the deadline (or forever, if there is none).
    Spin,
    /// Park on a condition variable, woken by every push.
    Block(Arc<BlockState>),
}

impl WaitStrategy {
    pub fn block() -> Self {
        WaitStrategy::Block(Arc::new(BlockState::default()))
    }

    pub(crate) fn notify(&self) {
        if let WaitStrategy::Block(state) = self {
            let _guard = state.mutex.lock();
            state.condvar.notify_all();
        }
    }

    /// Wait for a push notification, honouring `deadline` if set.
    /// Returns `false` when the strategy gives up (None, or Block/Spin past
    /// their deadline) and the caller should stop polling.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> bool {
        match self {
            WaitStrategy::None => false,
            WaitStrategy::Spin => {
                std::hint::spin_loop();
                match deadline {
                    None => true,
                    Some(dl) => Instant::now() < dl,
                }
            }
            WaitStrategy::Block(state) => {
                let mut guard = state.mutex.lock();
                match deadline {
                    None => {
                        state.condvar.wait(&mut guard);
                        true
                    }
                    Some(dl) => {
                        let now = Instant::now();
                        if now >= dl {
                            return false;
                        }
                        let timed_out = state.condvar.wait_for(&mut guard, dl - now).timed_out();
                        !timed_out
                    }
                }
            }
        }
    }
}
