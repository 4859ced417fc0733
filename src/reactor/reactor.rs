//! The reactor: one per event-loop thread (§3, §4.2).
//!
//! Owns a `mio::Poll`, the slab of descriptor slots it services, and the
//! [`NotifierMailbox`] other threads use to schedule work on it. The main
//! loop is the four-step sequence from §4.2: drain the mailbox, poll with
//! a timeout derived from the nearest timer, service ready descriptors
//! (read before write), then fire expired timers.

use crate::error::RuntimeError;
use crate::reactor::io_object::{Connection, IoObject};
use crate::reactor::mailbox::{Intent, NotifierMailbox};
use crate::reactor::timer::TimerWheel;
use crate::registry::{Descriptor, DescriptorRegistry};
use mio::{Events, Interest, Poll, Token, Waker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Reserved token for the mailbox's waker; never assigned to a descriptor.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// A cap on how long a single `poll` call blocks even with no pending
/// timer, so a stopped reactor notices `running` going false promptly.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Cross-thread handle to a running reactor: the only way other threads
/// reach it. Cheap to clone; every clone shares the same mailbox and
/// descriptor registry.
#[derive(Clone)]
pub struct ReactorHandle {
    id: usize,
    mailbox: Arc<NotifierMailbox>,
    registry: Arc<DescriptorRegistry<IoObject>>,
}

impl ReactorHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Schedule `intent` to run on the owning reactor thread (§4.2:
    /// "all take effect on the owning reactor").
    pub fn post(&self, intent: Intent) {
        self.mailbox.post(intent);
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry<IoObject>> {
        &self.registry
    }
}

/// One event-loop thread's state. Constructed and run entirely on its own
/// thread; [`ReactorHandle`] is the cross-thread face.
pub struct Reactor {
    id: usize,
    poll: Poll,
    events: Events,
    registry: Arc<DescriptorRegistry<IoObject>>,
    mailbox: Arc<NotifierMailbox>,
    timers: TimerWheel,
    running: Arc<AtomicBool>,
    /// Every reactor in the fleet, indexed by id — empty until
    /// [`Reactor::install_handles`] runs, which happens before this
    /// reactor's thread starts. Used by `accept_loop` to hand an accepted
    /// connection off to its fixed owner (§4.2 `slot mod reactor_count`).
    handles: Arc<[ReactorHandle]>,
}

impl Reactor {
    /// Build a reactor and the handle other threads use to reach it.
    pub fn new(
        id: usize,
        registry: Arc<DescriptorRegistry<IoObject>>,
        mailbox_capacity: usize,
        running: Arc<AtomicBool>,
    ) -> Result<(Self, ReactorHandle), RuntimeError> {
        let poll = Poll::new().map_err(|e| RuntimeError::fatal(format!("reactor {id}: mio::Poll::new failed: {e}")))?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER_TOKEN)
                .map_err(|e| RuntimeError::fatal(format!("reactor {id}: mio::Waker::new failed: {e}")))?,
        );
        let mailbox = Arc::new(NotifierMailbox::new(mailbox_capacity, waker));
        let handle = ReactorHandle {
            id,
            mailbox: mailbox.clone(),
            registry: registry.clone(),
        };
        let reactor = Reactor {
            id,
            poll,
            events: Events::with_capacity(1024),
            registry,
            mailbox,
            timers: TimerWheel::new(),
            running,
            handles: Arc::from(Vec::new()),
        };
        Ok((reactor, handle))
    }

    /// Install the fleet-wide handle list. Must run before [`Reactor::run`]
    /// — [`EventLoopFleet::start`](super::fleet::EventLoopFleet::start)
    /// calls it on every reactor once all of them are constructed, before
    /// spawning any of their threads.
    pub(crate) fn install_handles(&mut self, handles: Arc<[ReactorHandle]>) {
        self.handles = handles;
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry<IoObject>> {
        &self.registry
    }

    pub fn timers(&mut self) -> &mut TimerWheel {
        &mut self.timers
    }

    /// Register interest for `descriptor`'s socket with this reactor's
    /// poller. `mio::Registry::register` only needs `&self`, so this (and
    /// its siblings below) can be called from any thread that holds a
    /// [`ReactorHandle`]'s registry reference, not just the owning thread
    /// — the intent posted through the mailbox is what actually runs on
    /// the owning thread first, to install the object before registering.
    pub fn register_interest(&self, descriptor: Descriptor, source: &mut impl mio::event::Source, writable: bool) -> Result<(), RuntimeError> {
        let token = Token(descriptor.slot() as usize);
        let interest = if writable { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
        self.poll
            .registry()
            .register(source, token, interest)
            .map_err(|e| RuntimeError::transport(Some(descriptor), format!("register failed: {e}")))
    }

    pub fn reregister_interest(&self, descriptor: Descriptor, source: &mut impl mio::event::Source, writable: bool) -> Result<(), RuntimeError> {
        let token = Token(descriptor.slot() as usize);
        let interest = if writable { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
        self.poll
            .registry()
            .reregister(source, token, interest)
            .map_err(|e| RuntimeError::transport(Some(descriptor), format!("reregister failed: {e}")))
    }

    pub fn deregister_interest(&self, source: &mut impl mio::event::Source) {
        let _ = self.poll.registry().deregister(source);
    }

    /// The main loop (§4.2). Returns `Ok(())` on cooperative stop, `Err`
    /// on a fatal poller failure (the fleet stops every reactor on that).
    pub fn run(mut self) -> Result<(), RuntimeError> {
        tracing::debug!(reactor = self.id, "reactor loop starting");
        while self.running.load(Ordering::Acquire) {
            // Step 1: drain the notifier mailbox to empty.
            let mailbox = self.mailbox.clone();
            mailbox.drain(&mut self);

            // Step 2: poll with a timeout derived from the nearest timer.
            let timeout = match self.timers.next_timeout() {
                Some(d) => Some(d.min(MAX_POLL_INTERVAL)),
                None => Some(MAX_POLL_INTERVAL),
            };
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(reactor = self.id, error = %e, "poller failed, reactor stopping");
                    return Err(RuntimeError::fatal(format!("reactor {}: poll failed: {e}", self.id)));
                }
            }

            // Step 3: service ready descriptors, read-first.
            let events = std::mem::replace(&mut self.events, Events::with_capacity(0));
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.dispatch(event);
            }
            self.events = events;

            // Step 4: run expired timers.
            self.timers.fire_expired();
        }
        tracing::debug!(reactor = self.id, "reactor loop stopped");
        Ok(())
    }

    fn dispatch(&mut self, event: &mio::event::Event) {
        let slot = event.token().0 as u32;
        let Some(descriptor) = self.registry.current(slot) else {
            return;
        };

        if event.is_readable() {
            enum Readiness {
                Ok,
                Err(RuntimeError),
                IsListener,
            }
            let readiness = self
                .registry
                .with_mut(descriptor, |object| match object {
                    IoObject::Connection(conn) => match conn.on_readable(descriptor) {
                        Ok(()) => Readiness::Ok,
                        Err(e) => Readiness::Err(e),
                    },
                    IoObject::Listener(_) => Readiness::IsListener,
                    _ => Readiness::Ok,
                })
                .unwrap_or(Readiness::Ok);
            match readiness {
                Readiness::Err(err) => {
                    tracing::warn!(reactor = self.id, ?descriptor, error = %err, "closing connection after read error");
                    self.close(descriptor);
                    return;
                }
                Readiness::IsListener => self.accept_loop(descriptor),
                Readiness::Ok => {}
            }
        }

        if event.is_writable() {
            let result = self.registry.with_mut(descriptor, |object| match object {
                IoObject::Connection(conn) => Some(conn.on_writable(descriptor)),
                _ => None,
            });
            if let Some(Some(Err(err))) = result {
                tracing::warn!(reactor = self.id, ?descriptor, error = %err, "closing connection after write error");
                self.close(descriptor);
            }
        }
    }

    /// Accept every pending connection on a listener. A descriptor's
    /// `mio` interest must be registered against the `Poll` that will
    /// actually observe it, so the connection is registered on whichever
    /// reactor [`owner_of`](super::fleet::owner_of) computes for its
    /// freshly allocated descriptor — handing it off to that reactor's
    /// mailbox when it isn't this one (§4.2 `slot mod reactor_count`).
    fn accept_loop(&mut self, listener_descriptor: Descriptor) {
        loop {
            let accepted = self.registry.with_mut(listener_descriptor, |object| {
                let IoObject::Listener(state) = object else { return None };
                match state.listener.accept() {
                    Ok((stream, _addr)) => Some((stream, state.codec.clone(), state.sink.clone())),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                    Err(e) => {
                        tracing::warn!(reactor = self.id, error = %e, "accept failed");
                        None
                    }
                }
            });
            let Some(Some((stream, codec, sink))) = accepted else { break };

            let descriptor = match self.registry.allocate(IoObject::Pending) {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(reactor = self.id, error = %e, "descriptor registry exhausted, dropping accepted connection");
                    continue;
                }
            };

            let owner = super::fleet::owner_of(&self.handles, descriptor).clone();
            if owner.id() == self.id {
                let mut connection = Connection::new(stream, codec, sink);
                if let Err(e) = self.register_interest(descriptor, &mut connection.stream, false) {
                    tracing::warn!(reactor = self.id, error = %e, "failed to register accepted connection");
                    self.registry.release(descriptor);
                    continue;
                }
                self.registry.with_mut(descriptor, |object| {
                    *object = IoObject::Connection(connection);
                });
            } else {
                owner.post(Box::new(move |reactor| {
                    let mut connection = Connection::new(stream, codec, sink);
                    if let Err(e) = reactor.register_interest(descriptor, &mut connection.stream, false) {
                        tracing::warn!(reactor = reactor.id(), error = %e, "failed to register handed-off accepted connection");
                        reactor.registry().release(descriptor);
                        return;
                    }
                    reactor.registry().with_mut(descriptor, |object| {
                        *object = IoObject::Connection(connection);
                    });
                }));
            }
        }
    }

    /// Release and deregister `descriptor`.
    fn close(&mut self, descriptor: Descriptor) {
        if let Some(object) = self.registry.release(descriptor) {
            match object {
                IoObject::Connection(mut conn) => {
                    self.deregister_interest(&mut conn.stream);
                    if let Some(on_close) = conn.on_close.take() {
                        on_close();
                    }
                }
                IoObject::Listener(mut state) => self.deregister_interest(&mut state.listener),
                _ => {}
            }
        }
    }
}
