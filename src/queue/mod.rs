//! C1: the Ring-Buffer Sequencer.
//!
//! Bounded lock-free queues parameterised by producer/consumer cardinality
//! and wait strategy (§4.1). Every cross-thread handoff elsewhere in the
//! runtime (reactor notifier mailboxes, stage dispatch, coroutine resume
//! channels) is one of the four flavours defined in [`ring_queue`].

pub mod constants;
pub mod cursor;
pub mod ring_queue;
pub mod sequence;
pub mod utils;
pub mod wait_strategy;

pub use cursor::{CasCursor, Cursor, PlainCursor};
pub use ring_queue::{MpmcQueue, MpscQueue, Queue, RingQueue, SpmcQueue, SpscQueue};
pub use wait_strategy::WaitStrategy;
