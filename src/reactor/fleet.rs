//! C2: the Event Loop Fleet — N reactor threads, routing, and lifecycle.

use crate::error::RuntimeError;
use crate::reactor::io_object::IoObject;
use crate::reactor::reactor::{Reactor, ReactorHandle};
use crate::registry::{Descriptor, DescriptorRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Default capacity of a reactor's cross-thread notifier mailbox.
const DEFAULT_MAILBOX_CAPACITY: usize = 4096;

/// The fixed-owner rule from §4.2: "route each descriptor to a fixed
/// reactor by descriptor_slot mod N". A free function so both
/// [`EventLoopFleet::owner_of`] and code that only holds a handle slice —
/// a reactor handing off a just-accepted connection, a coroutine routing
/// a reply — compute the same answer without needing the fleet itself.
pub fn owner_of(handles: &[ReactorHandle], descriptor: Descriptor) -> &ReactorHandle {
    &handles[descriptor.slot() as usize % handles.len()]
}

/// N reactor threads sharing one descriptor registry. A descriptor's
/// owning reactor is fixed at `slot mod reactor_count` (§4.2): once a
/// descriptor is allocated, every handler invocation for it runs on the
/// same thread for the descriptor's lifetime.
pub struct EventLoopFleet {
    handles: Vec<ReactorHandle>,
    threads: Vec<JoinHandle<Result<(), RuntimeError>>>,
    registry: Arc<DescriptorRegistry<IoObject>>,
    running: Arc<AtomicBool>,
}

impl EventLoopFleet {
    /// Launch `reactor_count` reactor threads sharing a registry sized
    /// for `descriptor_capacity` live descriptors. Every reactor is
    /// handed the full fleet-wide handle list before any thread starts,
    /// so `slot mod reactor_count` routing is available from the first
    /// accept.
    pub fn start(reactor_count: usize, descriptor_capacity: usize) -> Result<Self, RuntimeError> {
        if reactor_count == 0 {
            return Err(RuntimeError::fatal("reactor_count must be at least 1"));
        }
        let registry = Arc::new(DescriptorRegistry::new(descriptor_capacity));
        let running = Arc::new(AtomicBool::new(true));

        let mut reactors = Vec::with_capacity(reactor_count);
        let mut handles = Vec::with_capacity(reactor_count);
        for id in 0..reactor_count {
            let (reactor, handle) = Reactor::new(id, registry.clone(), DEFAULT_MAILBOX_CAPACITY, running.clone())?;
            handles.push(handle);
            reactors.push(reactor);
        }
        let handles: Arc<[ReactorHandle]> = Arc::from(handles);

        let mut threads = Vec::with_capacity(reactor_count);
        for mut reactor in reactors {
            reactor.install_handles(handles.clone());
            let id = reactor.id();
            let thread = std::thread::Builder::new()
                .name(format!("reactor-{id}"))
                .spawn(move || reactor.run())
                .map_err(|e| RuntimeError::fatal(format!("failed to spawn reactor {id}: {e}")))?;
            threads.push(thread);
        }

        Ok(EventLoopFleet {
            handles: handles.to_vec(),
            threads,
            registry,
            running,
        })
    }

    pub fn reactor_count(&self) -> usize {
        self.handles.len()
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry<IoObject>> {
        &self.registry
    }

    /// The reactor that owns `descriptor`, by `slot mod reactor_count`
    /// (§4.2).
    pub fn owner_of(&self, descriptor: Descriptor) -> &ReactorHandle {
        owner_of(&self.handles, descriptor)
    }

    pub fn handle(&self, id: usize) -> &ReactorHandle {
        &self.handles[id]
    }

    pub fn handles(&self) -> &[ReactorHandle] {
        &self.handles
    }

    /// Flip the running flag every reactor checks at the top of its loop.
    /// Reactors parked in `poll` wake within `MAX_POLL_INTERVAL`.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for handle in &self.handles {
            handle.post(Box::new(|_| {}));
        }
    }

    /// Join every reactor thread. Returns the first fatal error seen, if
    /// any (§6: "`Wait()` returns a non-zero status" on fatal reactor
    /// error).
    pub fn wait(self) -> Result<(), RuntimeError> {
        let mut first_err = None;
        for thread in self.threads {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(_) => {
                    if first_err.is_none() {
                        first_err = Some(RuntimeError::fatal("reactor thread panicked"));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
