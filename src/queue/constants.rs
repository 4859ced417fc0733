use std::time::Duration;

/// Typical CPU cache line size in bytes, used to size the `#[repr(align)]`
/// padding on hot cursors so producer and consumer sequences never share a
/// cache line.
pub const CACHE_LINE_SIZE: usize = 64;

/// Default timed wait a stage worker applies to its normal-priority queue
/// after the priority queue has come up empty. Tunable per stage via
/// [`crate::config::StageConfig::normal_queue_timeout`].
pub const DEFAULT_NORMAL_QUEUE_TIMEOUT: Duration = Duration::from_millis(50);
