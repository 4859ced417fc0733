//! Per-reactor timer wheel: a min-heap keyed by deadline, drained once per
//! loop iteration after ready descriptors are serviced (§4.2 step 4).
//!
//! Used for two things: the coroutine scheduler's `coro::StartTimer`
//! yield point, and client channel reconnect back-off (§4.5).

use crate::registry::Descriptor;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

pub struct TimerEntry {
    pub deadline: Instant,
    pub descriptor: Descriptor,
    pub callback: Box<dyn FnOnce() + Send>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the nearest deadline.
        other.deadline.cmp(&self.deadline)
    }
}

/// A min-heap of pending timers for one reactor.
#[derive(Default)]
pub struct TimerWheel {
    entries: BinaryHeap<TimerEntry>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, descriptor: Descriptor, delay: Duration, callback: Box<dyn FnOnce() + Send>) {
        self.entries.push(TimerEntry {
            deadline: Instant::now() + delay,
            descriptor,
            callback,
        });
    }

    /// The timeout the reactor's poll should use: the delay until the
    /// nearest pending timer, or `None` if there are no timers (poll
    /// blocks indefinitely, or up to a caller-supplied cap).
    pub fn next_timeout(&self) -> Option<Duration> {
        self.entries.peek().map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
    }

    /// Pop and run every timer whose deadline has passed.
    pub fn fire_expired(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.entries.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.entries.pop().unwrap();
            (entry.callback)();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn descriptor_stub() -> Descriptor {
        let registry: crate::registry::DescriptorRegistry<()> = crate::registry::DescriptorRegistry::new(1);
        registry.allocate(()).unwrap()
    }

    #[test]
    fn fires_entries_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let o1 = order.clone();
        wheel.schedule(descriptor_stub(), Duration::from_millis(20), Box::new(move || o1.lock().push(2)));
        let o2 = order.clone();
        wheel.schedule(descriptor_stub(), Duration::from_millis(5), Box::new(move || o2.lock().push(1)));

        std::thread::sleep(Duration::from_millis(30));
        wheel.fire_expired();

        assert_eq!(*order.lock(), vec![1, 2]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn next_timeout_reflects_the_nearest_deadline() {
        let mut wheel = TimerWheel::new();
        assert_eq!(wheel.next_timeout(), None);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        wheel.schedule(descriptor_stub(), Duration::from_millis(50), Box::new(move || { c.fetch_add(1, Ordering::Relaxed); }));
        assert!(wheel.next_timeout().unwrap() <= Duration::from_millis(50));
    }
}
