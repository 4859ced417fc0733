//! The stackful coroutine scheduler that runs inside one stage worker
//! thread (§4.5). Each worker owns exactly one [`CoroutineScheduler`]; a
//! [`Task`] never migrates off the worker that created it.
//!
//! Handler code written against [`CoroContext`] never sees a raw
//! [`corosensei::Yielder`] — `yield_now`/`send_receive`/`start_timer` stash
//! it in a thread-local for the duration of one coroutine resumption and
//! read it back, the same shape a green-thread runtime uses to let
//! blocking-style code run in a cooperative scheduler without threading a
//! continuation through every call.

use crate::error::RuntimeError;
use crate::message::Message;
use crate::queue::{MpscQueue, RingQueue, WaitStrategy};
use crate::reactor::io_object::IoObject;
use crate::reactor::ReactorHandle;
use crate::registry::Descriptor;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default stack size for a pooled coroutine stack. Generous enough for
/// handler code that calls into a codec and a couple of library layers
/// without risking a guard-page fault.
const STACK_SIZE: usize = 256 * 1024;

/// Capacity of a worker's resume queue: how many outstanding suspended
/// tasks can have a resume intent in flight at once.
const RESUME_QUEUE_CAPACITY: usize = 1024;

/// What a coroutine receives when it is resumed.
pub enum Resume {
    /// The very first resumption, carrying the inbound message a stage
    /// worker dispatched.
    Start(Message),
    /// Every subsequent resumption: the outcome of whatever the task was
    /// suspended awaiting.
    Response(ResumeValue),
}

/// The outcome attached to a task before it is rescheduled (§4.5
/// "resumption protocol").
#[derive(Clone)]
pub enum ResumeValue {
    /// `coro::Yield()` was resumed with no payload.
    None,
    /// A client response matched this task's correlation key.
    Response(Message),
    /// The request's deadline elapsed before a response arrived.
    Timeout,
    /// The client channel's connection was lost.
    Transport,
    /// The task was cancelled before this suspension resolved.
    Cancelled,
}

/// What a coroutine yields with, telling the scheduler why it suspended.
pub enum Yielded {
    Explicit,
    AwaitingClient,
    AwaitingTimer,
}

type TaskCoroutine = Coroutine<Resume, Yielded, (), DefaultStack>;

thread_local! {
    /// Valid only while the coroutine that installed it is running on
    /// this thread, between its resumption and its next yield/return.
    static CURRENT_YIELDER: Cell<*const ()> = const { Cell::new(std::ptr::null()) };
}

struct YielderGuard;

impl YielderGuard {
    fn install(yielder: &Yielder<Resume, Yielded>) -> Self {
        CURRENT_YIELDER.with(|cell| cell.set(yielder as *const Yielder<Resume, Yielded> as *const ()));
        YielderGuard
    }
}

impl Drop for YielderGuard {
    fn drop(&mut self) {
        CURRENT_YIELDER.with(|cell| cell.set(std::ptr::null()));
    }
}

fn suspend(value: Yielded) -> Resume {
    let ptr = CURRENT_YIELDER.with(|cell| cell.get());
    assert!(!ptr.is_null(), "yield point called outside a running coroutine");
    // SAFETY: `ptr` was installed by `YielderGuard::install` from the
    // `&Yielder` corosensei handed this coroutine's entry point, and is
    // cleared before that entry point's stack frame is torn down.
    let yielder = unsafe { &*(ptr as *const Yielder<Resume, Yielded>) };
    let resume = yielder.suspend(value);
    // The worker thread may have dispatched or resumed other coroutines
    // while this one was suspended, each overwriting this thread-local
    // with their own yielder. Restore it the moment this task is running
    // again, before any code of this task's handler can reach a second
    // yield point (§4.5: a task may suspend any number of times).
    CURRENT_YIELDER.with(|cell| cell.set(ptr));
    resume
}

/// Per-suspension race resolver (§4.5 "at-most-once resumption
/// invariant"): whichever of "response arrives" / "timeout fires" /
/// "cancelled" wins the compare-and-swap attaches its value; the loser's
/// attempt is silently dropped.
///
/// A task's slot is reused across every suspension it makes, so the word
/// also carries an epoch: the low bit is the resolved flag, the remaining
/// bits are the epoch that was current when the slot was last armed.
/// `try_resolve` is keyed by the epoch the caller was issued, so a
/// timeout scheduled for suspension N that fires after the task has moved
/// on to suspension N+1 targets a word this slot no longer holds and its
/// CAS simply fails, instead of spuriously resolving the wrong
/// suspension.
struct AwaitedSlot {
    word: AtomicU64,
    value: parking_lot::Mutex<Option<ResumeValue>>,
}

impl AwaitedSlot {
    fn new() -> Arc<Self> {
        Arc::new(AwaitedSlot {
            word: AtomicU64::new(0),
            value: parking_lot::Mutex::new(None),
        })
    }

    /// Arm a fresh suspension and return its epoch, for the caller to
    /// stamp onto whatever `TaskHandle` it hands to the external waker.
    fn rearm(&self) -> u64 {
        let epoch = (self.word.load(Ordering::Acquire) >> 1) + 1;
        self.word.store(epoch << 1, Ordering::Release);
        epoch
    }

    /// The epoch the slot is currently armed for (or was last resolved
    /// for). Used by `cancel`, which has no yield-point-issued epoch of
    /// its own to resolve whatever suspension is presently outstanding.
    fn current_epoch(&self) -> u64 {
        self.word.load(Ordering::Acquire) >> 1
    }

    /// Returns `true` iff this call resolved suspension `epoch` — i.e. the
    /// slot was still armed for exactly that epoch. A resolve attempt
    /// tagged with a superseded epoch, or one that arrives after the slot
    /// is already resolved, fails harmlessly.
    fn try_resolve(&self, epoch: u64, value: ResumeValue) -> bool {
        let armed = epoch << 1;
        let resolved = armed | 1;
        if self.word.compare_exchange(armed, resolved, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            *self.value.lock() = Some(value);
            true
        } else {
            false
        }
    }

    fn take(&self) -> ResumeValue {
        self.value.lock().take().unwrap_or(ResumeValue::None)
    }
}

/// A single outstanding resumption to apply on the owning worker thread.
#[derive(Copy, Clone)]
pub struct ResumeIntent {
    task_id: u64,
}

/// Cross-thread face of a suspended [`Task`]: the only thing a client
/// channel's in-flight table, or a timer callback, needs to wake it. The
/// epoch identifies exactly which suspension this handle was issued for.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: u64,
    epoch: u64,
    resume_queue: Arc<MpscQueue<ResumeIntent>>,
    awaited: Arc<AwaitedSlot>,
}

impl TaskHandle {
    /// Attach `value` to this task's current suspension and, if this call
    /// won the race, enqueue a resume intent for the owning worker. Never
    /// loses a won race to a full queue — spins and retries, mirroring
    /// [`crate::reactor::mailbox::NotifierMailbox::post`].
    pub fn resume_with(&self, value: ResumeValue) {
        if !self.awaited.try_resolve(self.epoch, value) {
            return;
        }
        let mut intent = ResumeIntent { task_id: self.task_id };
        while let Err(back) = self.resume_queue.push(intent) {
            intent = back;
            std::hint::spin_loop();
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }
}

/// The context handler code runs with; the only way into yield points
/// (§4.5: exactly three categories).
pub struct CoroContext {
    task_id: u64,
    resume_queue: Arc<MpscQueue<ResumeIntent>>,
    awaited: Arc<AwaitedSlot>,
    cancelled: Arc<AtomicBool>,
    /// This worker's own reactor, used for work with no descriptor of its
    /// own (a `coro::StartTimer` wakeup).
    reactor: ReactorHandle,
    /// Every reactor in the fleet, so a reply/write can be routed to
    /// whichever one actually owns its descriptor (§4.2), not necessarily
    /// this worker's own.
    reactors: Arc<[ReactorHandle]>,
}

/// What a yield point resolves to once resumed.
pub enum YieldOutcome {
    Resumed,
    Cancelled,
}

impl CoroContext {
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn handle(&self, epoch: u64) -> TaskHandle {
        TaskHandle {
            task_id: self.task_id,
            epoch,
            resume_queue: self.resume_queue.clone(),
            awaited: self.awaited.clone(),
        }
    }

    /// `coro::Yield()`: explicit deschedule, resumed by an external event
    /// that calls [`TaskHandle::resume_with`]. `register` runs with this
    /// task's handle before the coroutine actually suspends, so the
    /// caller can stash it wherever the external waker will find it (a
    /// registry, a callback closure, ...) — the handle must exist before
    /// the suspend, not after, or nothing could ever resume the task.
    pub fn yield_now(&self, register: impl FnOnce(TaskHandle)) -> YieldOutcome {
        let epoch = self.awaited.rearm();
        register(self.handle(epoch));
        let resume = suspend(Yielded::Explicit);
        self.interpret(resume)
    }

    /// `coro::StartTimer(ms)` followed by yield: registers a timer with
    /// the owning reactor, then suspends until it fires (or is cancelled
    /// first).
    pub fn start_timer(&self, delay: Duration) -> YieldOutcome {
        let epoch = self.awaited.rearm();
        let handle = self.handle(epoch);
        self.reactor.post(Box::new(move |reactor| {
            // A `coro::StartTimer` wakeup carries no I/O descriptor of its
            // own; a synthetic one keyed by task id gives the timer entry
            // something to log against.
            let descriptor = crate::registry::Descriptor::synthetic(handle.task_id as u32);
            reactor.timers().schedule(descriptor, delay, Box::new(move || handle.resume_with(ResumeValue::None)));
        }));
        let resume = suspend(Yielded::AwaitingTimer);
        self.interpret(resume)
    }

    fn interpret(&self, resume: Resume) -> YieldOutcome {
        match resume {
            Resume::Response(ResumeValue::Cancelled) => YieldOutcome::Cancelled,
            Resume::Response(_) | Resume::Start(_) => {
                if self.is_cancelled() {
                    YieldOutcome::Cancelled
                } else {
                    YieldOutcome::Resumed
                }
            }
        }
    }

    /// `client.SendReceive(request)` (§4.5): send, record the correlation
    /// binding, then suspend until a response, timeout, or transport
    /// failure resolves it.
    pub fn send_receive(&self, channel: &crate::client::ClientChannel, request: Message, timeout: Duration) -> Result<Message, RuntimeError> {
        let epoch = self.awaited.rearm();
        let handle = self.handle(epoch);
        channel.start_send_receive(handle, request, timeout)?;
        match suspend(Yielded::AwaitingClient) {
            Resume::Response(ResumeValue::Response(message)) => Ok(message),
            Resume::Response(ResumeValue::Timeout) => Err(RuntimeError::Timeout {
                correlation_key: self.task_id,
                elapsed_ms: timeout.as_millis() as u64,
            }),
            Resume::Response(ResumeValue::Transport) => Err(RuntimeError::transport(None, "client channel disconnected")),
            Resume::Response(ResumeValue::Cancelled) => Err(RuntimeError::Cancelled { task_id: self.task_id }),
            Resume::Response(ResumeValue::None) | Resume::Start(_) => {
                unreachable!("send_receive can only be resumed with a Response value")
            }
        }
    }

    /// Write `message` to `descriptor` through its owning reactor (§2: the
    /// handler "eventually sends a reply message back through a reactor
    /// for serialization and write"). The owning reactor is whichever one
    /// `accept_loop` actually registered the descriptor's `mio` interest
    /// with (`slot mod reactor_count`, §4.2) — not necessarily this
    /// worker's own, so the write intent is routed through
    /// [`crate::reactor::owner_of`] rather than `self.reactor`.
    /// Non-suspending: posts the write as an intent and returns
    /// immediately, the same shape as
    /// [`crate::client::ClientChannel::start_send_receive`]'s write half.
    pub fn send(&self, descriptor: Descriptor, message: Message) {
        let owner = crate::reactor::owner_of(&self.reactors, descriptor).clone();
        owner.post(Box::new(move |reactor| {
            let wrote = reactor
                .registry()
                .with_mut(descriptor, |object| match object {
                    IoObject::Connection(conn) => conn.enqueue_write(&message).is_ok(),
                    _ => false,
                })
                .unwrap_or(false);
            if wrote {
                reactor.registry().with_mut(descriptor, |object| {
                    if let IoObject::Connection(conn) = object {
                        let _ = reactor.reregister_interest(descriptor, &mut conn.stream, conn.writable_interest);
                    }
                });
            }
        }));
    }

    /// `send` addressed to `message.source`, the connection the inbound
    /// request this handler is reacting to arrived on. Fails if the
    /// message carries no source descriptor (it was never actually
    /// received off a connection).
    pub fn reply(&self, message: Message) -> Result<(), RuntimeError> {
        let descriptor = message.source.ok_or_else(|| RuntimeError::protocol(None, "reply requires a message with a source descriptor"))?;
        self.send(descriptor, message);
        Ok(())
    }
}

struct Task {
    coroutine: TaskCoroutine,
    awaited: Arc<AwaitedSlot>,
    cancelled: Arc<AtomicBool>,
}

/// Runs on exactly one stage worker thread, hosting every coroutine that
/// worker has dispatched and not yet finished (§4.5 execution model).
pub struct CoroutineScheduler {
    worker_id: usize,
    next_task_id: u64,
    tasks: HashMap<u64, Task>,
    stack_pool: Vec<DefaultStack>,
    resume_queue: Arc<MpscQueue<ResumeIntent>>,
    /// Every reactor in the fleet; this worker's own is
    /// `reactors[worker_id % reactors.len()]` (the same round-robin
    /// assignment `Stage::start` uses).
    reactors: Arc<[ReactorHandle]>,
}

impl CoroutineScheduler {
    pub fn new(worker_id: usize, reactors: Arc<[ReactorHandle]>) -> Self {
        CoroutineScheduler {
            worker_id,
            next_task_id: 0,
            tasks: HashMap::new(),
            stack_pool: Vec::new(),
            resume_queue: Arc::new(RingQueue::new(RESUME_QUEUE_CAPACITY, WaitStrategy::None)),
            reactors,
        }
    }

    fn own_reactor(&self) -> &ReactorHandle {
        &self.reactors[self.worker_id % self.reactors.len()]
    }

    fn take_stack(&mut self) -> Result<DefaultStack, RuntimeError> {
        match self.stack_pool.pop() {
            Some(stack) => Ok(stack),
            None => DefaultStack::new(STACK_SIZE).map_err(|e| RuntimeError::fatal(format!("failed to allocate coroutine stack: {e}"))),
        }
    }

    /// Acquire a fresh task, install `handler` as its entry point, and
    /// resume it immediately with `message` (§4.5: "the worker acquires a
    /// fresh coroutine task ... and resumes it").
    pub fn dispatch(&mut self, handler: Arc<dyn Fn(Message, &CoroContext) + Send + Sync>, message: Message) -> Result<(), RuntimeError> {
        let task_id = self.next_task_id;
        self.next_task_id += 1;

        let stack = self.take_stack()?;
        let awaited = AwaitedSlot::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        let ctx = CoroContext {
            task_id,
            resume_queue: self.resume_queue.clone(),
            awaited: awaited.clone(),
            cancelled: cancelled.clone(),
            reactor: self.own_reactor().clone(),
            reactors: self.reactors.clone(),
        };

        let mut coroutine = Coroutine::with_stack(stack, move |yielder, first: Resume| {
            let _guard = YielderGuard::install(yielder);
            let Resume::Start(message) = first else {
                panic!("task {task_id} started with a non-Start resume value")
            };
            handler(message, &ctx);
        });

        tracing::trace!(worker = self.worker_id, task_id, "coroutine dispatched");
        match coroutine.resume(Resume::Start(message)) {
            CoroutineResult::Yield(_yielded) => {
                self.tasks.insert(task_id, Task { coroutine, awaited, cancelled });
            }
            CoroutineResult::Return(()) => {
                self.reclaim(coroutine);
            }
        }
        Ok(())
    }

    fn reclaim(&mut self, coroutine: TaskCoroutine) {
        self.stack_pool.push(coroutine.into_stack());
    }

    /// Drain every pending resume intent, applying each to the task it
    /// names. Called once per worker loop iteration before new messages
    /// are popped, so an externally-resolved coroutine makes progress
    /// before the worker accepts more work.
    pub fn drain_resumes(&mut self) {
        while let Some(intent) = self.resume_queue.try_pop() {
            let Some(task) = self.tasks.get_mut(&intent.task_id) else {
                continue;
            };
            let value = task.awaited.take();
            tracing::trace!(worker = self.worker_id, task_id = intent.task_id, "coroutine resumed");
            match task.coroutine.resume(Resume::Response(value)) {
                CoroutineResult::Yield(_yielded) => {}
                CoroutineResult::Return(()) => {
                    let task = self.tasks.remove(&intent.task_id).expect("checked above");
                    self.reclaim(task.coroutine);
                }
            }
        }
    }

    /// Cancel a still-suspended task: sets its flag and forces a
    /// resumption carrying [`ResumeValue::Cancelled`] through the same
    /// at-most-once race as any other resume source.
    pub fn cancel(&self, task_id: u64) {
        if let Some(task) = self.tasks.get(&task_id) {
            task.cancelled.store(true, Ordering::Release);
            let handle = TaskHandle {
                task_id,
                epoch: task.awaited.current_epoch(),
                resume_queue: self.resume_queue.clone(),
                awaited: task.awaited.clone(),
            };
            handle.resume_with(ResumeValue::Cancelled);
        }
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_runs_a_non_yielding_handler_to_completion() {
        let registry: crate::registry::DescriptorRegistry<()> = crate::registry::DescriptorRegistry::new(1);
        let _ = registry.allocate(());
        // A handler that never yields should leave no active task behind.
        let running = Arc::new(AtomicBool::new(true));
        let reg = Arc::new(crate::registry::DescriptorRegistry::<crate::reactor::io_object::IoObject>::new(4));
        let (_reactor, handle) = crate::reactor::Reactor::new(0, reg, 16, running).unwrap();

        let mut scheduler = CoroutineScheduler::new(0, Arc::from(vec![handle]));
        let seen = Arc::new(parking_lot::Mutex::new(false));
        let seen2 = seen.clone();
        let handler: Arc<dyn Fn(Message, &CoroContext) + Send + Sync> = Arc::new(move |_msg, _ctx| {
            *seen2.lock() = true;
        });
        scheduler.dispatch(handler, Message::request(&b"hi"[..])).unwrap();
        assert!(*seen.lock());
        assert_eq!(scheduler.active_task_count(), 0);
    }

    fn scheduler_on_fresh_reactor() -> CoroutineScheduler {
        let running = Arc::new(AtomicBool::new(true));
        let reg = Arc::new(crate::registry::DescriptorRegistry::<crate::reactor::io_object::IoObject>::new(4));
        let (_reactor, handle) = crate::reactor::Reactor::new(0, reg, 16, running).unwrap();
        CoroutineScheduler::new(0, Arc::from(vec![handle]))
    }

    #[test]
    fn yield_now_suspends_then_resumes_via_resume_with() {
        let mut scheduler = scheduler_on_fresh_reactor();
        let stashed: Arc<parking_lot::Mutex<Option<TaskHandle>>> = Arc::new(parking_lot::Mutex::new(None));
        let stashed2 = stashed.clone();
        let completed = Arc::new(AtomicBool::new(false));
        let completed2 = completed.clone();

        let handler: Arc<dyn Fn(Message, &CoroContext) + Send + Sync> = Arc::new(move |_msg, ctx| {
            let outcome = ctx.yield_now(|handle| *stashed2.lock() = Some(handle));
            assert!(matches!(outcome, YieldOutcome::Resumed));
            completed2.store(true, Ordering::Release);
        });

        scheduler.dispatch(handler, Message::request(&b"hi"[..])).unwrap();
        // `register` ran before the coroutine suspended, so the handle is
        // already stashed even though the handler hasn't finished.
        assert_eq!(scheduler.active_task_count(), 1);
        assert!(!completed.load(Ordering::Acquire));

        let task_handle = stashed.lock().take().expect("register ran before suspend");
        task_handle.resume_with(ResumeValue::None);
        scheduler.drain_resumes();

        assert!(completed.load(Ordering::Acquire));
        assert_eq!(scheduler.active_task_count(), 0);
    }

    #[test]
    fn cancel_resumes_a_suspended_task_with_cancelled_outcome() {
        let mut scheduler = scheduler_on_fresh_reactor();
        let observed = Arc::new(parking_lot::Mutex::new(None));
        let observed2 = observed.clone();

        let handler: Arc<dyn Fn(Message, &CoroContext) + Send + Sync> = Arc::new(move |_msg, ctx| {
            let outcome = ctx.yield_now(|_handle| {});
            *observed2.lock() = Some(matches!(outcome, YieldOutcome::Cancelled));
        });

        scheduler.dispatch(handler, Message::request(&b"hi"[..])).unwrap();
        scheduler.cancel(0);
        scheduler.drain_resumes();

        assert_eq!(*observed.lock(), Some(true));
        assert_eq!(scheduler.active_task_count(), 0);
    }

    /// §8 property 3 "at-most-once resumption": a response and a timeout
    /// racing to resolve the same suspension must produce exactly one
    /// winner, regardless of which thread gets there first.
    #[test]
    fn awaited_slot_resolves_exactly_once_under_a_concurrent_race() {
        for _ in 0..200 {
            let slot = AwaitedSlot::new();
            let epoch = slot.rearm();
            let results: Vec<bool> = std::thread::scope(|scope| {
                let a = scope.spawn({
                    let slot = &slot;
                    move || slot.try_resolve(epoch, ResumeValue::Response(Message::one_way(&b"r"[..])))
                });
                let b = scope.spawn({
                    let slot = &slot;
                    move || slot.try_resolve(epoch, ResumeValue::Timeout)
                });
                vec![a.join().unwrap(), b.join().unwrap()]
            });
            assert_eq!(results.iter().filter(|won| **won).count(), 1);
        }
    }

    /// The stale-timeout bug this epoch scheme exists to close: a resolve
    /// attempt tagged with a suspension's epoch must not be able to
    /// resolve a later suspension that reused the same slot.
    #[test]
    fn try_resolve_with_a_superseded_epoch_is_dropped() {
        let slot = AwaitedSlot::new();
        let first_epoch = slot.rearm();
        // The handler's first suspension already resolved and it moved on
        // to a second one before the first suspension's timer fired.
        let second_epoch = slot.rearm();
        assert_ne!(first_epoch, second_epoch);

        assert!(!slot.try_resolve(first_epoch, ResumeValue::Timeout));
        assert!(slot.try_resolve(second_epoch, ResumeValue::Response(Message::one_way(&b"ok"[..]))));
        assert!(matches!(slot.take(), ResumeValue::Response(_)));
    }
}
