//! C4: the Stage Pipeline — worker pools consuming (normal, priority)
//! queues and invoking a handler inside a coroutine (§4.4, §4.5).

use crate::config::StageConfig;
use crate::coroutine::{CoroContext, CoroutineScheduler};
use crate::message::Message;
use crate::queue::{MpmcQueue, MpscQueue, Queue};
use crate::reactor::ReactorHandle;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// The handler a stage invokes for every dispatched message, running
/// inside the coroutine the worker acquired for that message.
pub type ServiceHandler = dyn Fn(Message, &CoroContext) + Send + Sync;

/// How a stage's handler is constructed per §4.4's deployment matrix.
pub enum HandlerFactory {
    /// `share_handler = true`: one instance, cloned (by `Arc`) to every
    /// worker.
    Shared(Arc<ServiceHandler>),
    /// `share_handler = false`: each worker gets its own instance, built
    /// once at worker start-up so handler state never crosses threads.
    PerWorker(Arc<dyn Fn() -> Arc<ServiceHandler> + Send + Sync>),
}

type QueuePair = (Arc<dyn Queue<Message>>, Arc<dyn Queue<Message>>);

enum Topology {
    /// `share_queue = false`: one (normal, priority) pair per worker,
    /// chosen by `StageConfig::hash_fn`.
    PerWorker(Vec<QueuePair>),
    /// `share_queue = true`: one (normal, priority) pair shared by every
    /// worker; whichever worker pops a message wins it.
    Shared(QueuePair),
}

/// A named worker pool (§3 "Stage"). `Stage::send`/`send_priority` are the
/// producer side; `Stage::start` launches the consumer-side worker
/// threads.
pub struct Stage {
    name: String,
    topology: Topology,
    worker_count: usize,
    hash_fn: Arc<dyn Fn(u64, usize) -> usize + Send + Sync>,
    normal_queue_timeout: std::time::Duration,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Stage {
    /// Build a stage's queues per §4.4's table. Worker threads aren't
    /// started until [`Stage::start`].
    pub fn new(config: StageConfig) -> Self {
        let topology = if config.share_queue {
            let normal: Arc<dyn Queue<Message>> = Arc::new(MpmcQueue::<Message>::new(config.queue_size, config.wait_strategy.clone()));
            let priority: Arc<dyn Queue<Message>> = Arc::new(MpmcQueue::<Message>::new(config.queue_size, config.wait_strategy.clone()));
            Topology::Shared((normal, priority))
        } else {
            let pairs = (0..config.worker_count)
                .map(|_| {
                    let normal: Arc<dyn Queue<Message>> = Arc::new(MpscQueue::<Message>::new(config.queue_size, config.wait_strategy.clone()));
                    let priority: Arc<dyn Queue<Message>> = Arc::new(MpscQueue::<Message>::new(config.queue_size, config.wait_strategy.clone()));
                    (normal, priority)
                })
                .collect();
            Topology::PerWorker(pairs)
        };

        Stage {
            name: config.name,
            topology,
            worker_count: config.worker_count,
            hash_fn: Arc::from(config.hash_fn),
            normal_queue_timeout: config.normal_queue_timeout,
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn pair_for(&self, key: u64) -> &QueuePair {
        match &self.topology {
            Topology::Shared(pair) => pair,
            Topology::PerWorker(pairs) => {
                let index = (self.hash_fn)(key, self.worker_count);
                &pairs[index]
            }
        }
    }

    /// Enqueue on the normal stream. `key` selects the worker when
    /// `share_queue = false` (ignored otherwise, per §4.4's table).
    /// Returns `false` when the target queue is full (§4.4 back-pressure).
    pub fn send(&self, key: u64, message: Message) -> bool {
        self.pair_for(key).0.push(message).is_ok()
    }

    /// As [`Stage::send`], but on the priority stream, drained ahead of
    /// the normal stream at every dispatch decision (§3 Stage invariant).
    pub fn send_priority(&self, key: u64, message: Message) -> bool {
        self.pair_for(key).1.push(message).is_ok()
    }

    /// Launch `worker_count` worker threads (§4.4 worker loop). Every
    /// worker gets the full reactor list — its own assigned reactor is
    /// `reactors[worker_id % reactors.len()]`, same as before, but a
    /// handler's reply/write needs to reach whichever reactor actually
    /// owns the target descriptor, which isn't always that one (§4.2).
    pub fn start(&self, handler: HandlerFactory, reactors: &[ReactorHandle]) {
        self.running.store(true, Ordering::Release);
        let handler = Arc::new(handler);
        let reactors: Arc<[ReactorHandle]> = Arc::from(reactors);

        for worker_id in 0..self.worker_count {
            let (normal, priority) = match &self.topology {
                Topology::Shared(pair) => pair.clone(),
                Topology::PerWorker(pairs) => pairs[worker_id].clone(),
            };
            let handler_instance = match handler.as_ref() {
                HandlerFactory::Shared(h) => h.clone(),
                HandlerFactory::PerWorker(factory) => factory(),
            };
            let running = self.running.clone();
            let stage_name = self.name.clone();
            let reactors = reactors.clone();
            let normal_queue_timeout = self.normal_queue_timeout;

            let thread = std::thread::Builder::new()
                .name(format!("stage-{stage_name}-{worker_id}"))
                .spawn(move || worker_loop(stage_name, worker_id, handler_instance, normal, priority, normal_queue_timeout, reactors, running))
                .expect("failed to spawn stage worker thread");
            self.threads.lock().push(thread);
        }
    }

    /// Flip the running flag; workers observe it at the top of their loop
    /// (§4.4 shutdown). Does not drain queued messages.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Join every worker thread. Handlers already in flight run to
    /// completion first; nothing still queued is delivered.
    pub fn wait(&self) {
        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker_loop(
    stage_name: String,
    worker_id: usize,
    handler: Arc<ServiceHandler>,
    normal: Arc<dyn Queue<Message>>,
    priority: Arc<dyn Queue<Message>>,
    normal_queue_timeout: std::time::Duration,
    reactors: Arc<[ReactorHandle]>,
    running: Arc<AtomicBool>,
) {
    tracing::debug!(stage = %stage_name, worker_id, "stage worker starting");
    let mut scheduler = CoroutineScheduler::new(worker_id, reactors);

    while running.load(Ordering::Acquire) {
        // Resumptions from client responses/timeouts/cancellations make
        // progress before any new message is accepted (§4.5).
        scheduler.drain_resumes();

        if let Some(message) = priority.try_pop() {
            tracing::trace!(stage = %stage_name, worker_id, "dispatching priority message");
            let _ = scheduler.dispatch(handler.clone(), message);
            continue;
        }

        if let Some(message) = normal.pop_timeout(normal_queue_timeout) {
            tracing::trace!(stage = %stage_name, worker_id, "dispatching normal message");
            let _ = scheduler.dispatch(handler.clone(), message);
        }
    }
    tracing::debug!(stage = %stage_name, worker_id, "stage worker stopped");
}
