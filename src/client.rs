//! The client router and client channels (§3, §4.5): outbound connections
//! a handler's `SendReceive` yield point talks to, with correlation-key
//! matching and bounded-exponential-backoff reconnection.

use crate::config::{BackoffConfig, ClientPoolConfig};
use crate::coroutine::{ResumeValue, TaskHandle};
use crate::error::RuntimeError;
use crate::message::{Codec, Endpoint, Message};
use crate::reactor::io_object::{Connection, IoObject};
use crate::reactor::ReactorHandle;
use crate::registry::Descriptor;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One outbound connection to a named service, owned by one reactor.
/// `SendReceive` on any worker thread is safe to call concurrently; the
/// in-flight correlation table is only ever mutated by posting an intent
/// onto the owning reactor (§5 "single-writer: the owning channel's
/// reactor"), never by the calling thread directly.
pub struct ClientChannel {
    name: String,
    endpoint: Endpoint,
    codec: Arc<dyn Codec>,
    reactor: ReactorHandle,
    descriptor: Mutex<Option<Descriptor>>,
    connected: Arc<AtomicBool>,
    started: AtomicBool,
    next_key: AtomicU64,
    in_flight: Arc<Mutex<HashMap<u64, TaskHandle>>>,
    backoff: BackoffConfig,
    default_timeout: Duration,
    current_backoff: Mutex<Duration>,
    dropped_responses: Arc<AtomicU64>,
}

impl ClientChannel {
    fn new(name: String, endpoint: Endpoint, codec: Arc<dyn Codec>, reactor: ReactorHandle, backoff: BackoffConfig, default_timeout: Duration) -> Arc<Self> {
        Arc::new(ClientChannel {
            name,
            endpoint,
            codec,
            reactor,
            descriptor: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            next_key: AtomicU64::new(0),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            backoff,
            default_timeout,
            current_backoff: Mutex::new(backoff.initial),
            dropped_responses: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Responses that arrived for a correlation key with no matching
    /// in-flight task (already timed out, or cancelled) — §4.5 "dropped
    /// and counted".
    pub fn dropped_response_count(&self) -> u64 {
        self.dropped_responses.load(Ordering::Relaxed)
    }

    /// Required before any `send_receive` (§9 design note: do not
    /// replicate the source's ordering bug of calling `SendReceive`
    /// before `Start`).
    pub fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.connect();
        Ok(())
    }

    fn connect(self: &Arc<Self>) {
        let addr = match (self.endpoint.host.as_str(), self.endpoint.port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    tracing::warn!(client = %self.name, "endpoint resolved to no addresses");
                    self.schedule_reconnect();
                    return;
                }
            },
            Err(e) => {
                tracing::warn!(client = %self.name, error = %e, "failed to resolve endpoint");
                self.schedule_reconnect();
                return;
            }
        };

        let stream = match mio::net::TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(client = %self.name, error = %e, "connect failed");
                self.schedule_reconnect();
                return;
            }
        };

        let this = self.clone();
        let sink = make_response_sink(self.in_flight.clone(), self.dropped_responses.clone());
        let codec = self.codec.clone();
        self.reactor.post(Box::new(move |reactor| {
            let on_close_channel = this.clone();
            let mut connection = Connection::new(stream, codec, sink).with_on_close(Arc::new(move || on_close_channel.on_disconnected()));
            let descriptor = match reactor.registry().allocate(IoObject::Pending) {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(client = %this.name, error = %e, "descriptor registry exhausted for client connection");
                    this.schedule_reconnect();
                    return;
                }
            };
            // Non-blocking connect: wait for writable to learn whether it
            // succeeded, so register write interest up front.
            if let Err(e) = reactor.register_interest(descriptor, &mut connection.stream, true) {
                tracing::warn!(client = %this.name, error = %e, "failed to register client connection");
                reactor.registry().release(descriptor);
                this.schedule_reconnect();
                return;
            }
            reactor.registry().with_mut(descriptor, |object| *object = IoObject::Connection(connection));
            *this.descriptor.lock() = Some(descriptor);
            this.connected.store(true, Ordering::Release);
            *this.current_backoff.lock() = this.backoff.initial;
            tracing::debug!(client = %this.name, ?descriptor, "client channel connected");
        }));
    }

    fn on_disconnected(self: &Arc<Self>) {
        self.connected.store(false, Ordering::Release);
        *self.descriptor.lock() = None;
        let mut in_flight = self.in_flight.lock();
        for (_key, task) in in_flight.drain() {
            task.resume_with(ResumeValue::Transport);
        }
        drop(in_flight);
        tracing::warn!(client = %self.name, "client channel disconnected, resuming in-flight tasks with a transport error");
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut backoff = self.current_backoff.lock();
        let delay = *backoff;
        let jittered = jitter(delay);
        *backoff = Duration::from_secs_f64((backoff.as_secs_f64() * self.backoff.multiplier).min(self.backoff.max.as_secs_f64()));
        drop(backoff);

        let this = self.clone();
        self.reactor.post(Box::new(move |reactor| {
            let task = this.clone();
            reactor.timers().schedule(Descriptor::synthetic(0), jittered, Box::new(move || task.connect()));
        }));
    }

    /// Non-suspending half of `SendReceive` (§4.5): allocate a key, arm
    /// the in-flight binding, and enqueue the request through the owning
    /// reactor. Fails fast without allocating a key when disconnected.
    pub(crate) fn start_send_receive(&self, task: TaskHandle, mut request: Message, timeout: Duration) -> Result<(), RuntimeError> {
        let Some(descriptor) = *self.descriptor.lock() else {
            return Err(RuntimeError::transport(None, format!("client `{}` is disconnected", self.name)));
        };
        if !self.connected.load(Ordering::Acquire) {
            return Err(RuntimeError::transport(Some(descriptor), format!("client `{}` is disconnected", self.name)));
        }

        let key = self.next_key.fetch_add(1, Ordering::AcqRel);
        request.correlation_id = Some(key);
        self.in_flight.lock().insert(key, task.clone());

        let in_flight = self.in_flight.clone();
        let timeout_task = task.clone();
        self.reactor.post(Box::new(move |reactor| {
            let wrote = reactor
                .registry()
                .with_mut(descriptor, |object| match object {
                    IoObject::Connection(conn) => conn.enqueue_write(&request).is_ok(),
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
            reactor.timers().schedule(
                descriptor,
                timeout,
                Box::new(move || {
                    in_flight.lock().remove(&key);
                    timeout_task.resume_with(ResumeValue::Timeout);
                }),
            );
        }));
        Ok(())
    }

    /// The pool-configured timeout a caller may fall back to when it has
    /// no deadline of its own in mind.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

fn make_response_sink(in_flight: Arc<Mutex<HashMap<u64, TaskHandle>>>, dropped: Arc<AtomicU64>) -> crate::reactor::io_object::MessageSink {
    Arc::new(move |message: Message| {
        if let Some(key) = message.correlation_id {
            if let Some(task) = in_flight.lock().remove(&key) {
                task.resume_with(ResumeValue::Response(message));
                return;
            }
        }
        dropped.fetch_add(1, Ordering::Relaxed);
    })
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.001))
}

/// Maps a logical service name to a pool of [`ClientChannel`]s (§4.5).
pub struct ClientRouter {
    pools: HashMap<String, Vec<Arc<ClientChannel>>>,
    next: HashMap<String, AtomicU64>,
}

impl ClientRouter {
    pub fn new(configs: &[ClientPoolConfig], codecs: &crate::message::CodecRegistry, reactors: &[ReactorHandle]) -> Result<Self, RuntimeError> {
        let mut pools = HashMap::new();
        let mut next = HashMap::new();
        for config in configs {
            let endpoint = Endpoint::parse(&config.endpoint)?;
            let codec = codecs
                .get(&endpoint.scheme)
                .ok_or_else(|| RuntimeError::fatal(format!("no codec registered for scheme `{}`", endpoint.scheme)))?;
            let mut channels = Vec::with_capacity(config.pool_size);
            for i in 0..config.pool_size {
                let reactor = reactors[i % reactors.len()].clone();
                channels.push(ClientChannel::new(config.name.clone(), endpoint.clone(), codec.clone(), reactor, config.backoff, config.default_timeout));
            }
            pools.insert(config.name.clone(), channels);
            next.insert(config.name.clone(), AtomicU64::new(0));
        }
        Ok(ClientRouter { pools, next })
    }

    /// Round-robins across a named pool's channels.
    pub fn get(&self, name: &str) -> Option<Arc<ClientChannel>> {
        let channels = self.pools.get(name)?;
        if channels.is_empty() {
            return None;
        }
        let counter = self.next.get(name)?;
        let i = counter.fetch_add(1, Ordering::Relaxed) as usize % channels.len();
        Some(channels[i].clone())
    }

    pub fn start_all(&self) -> Result<(), RuntimeError> {
        for channels in self.pools.values() {
            for channel in channels {
                channel.start()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_the_expected_band() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let j = jitter(base);
            assert!(j >= Duration::from_millis(50) && j <= Duration::from_millis(150));
        }
    }

    #[test]
    fn router_round_robins_within_a_pool() {
        let running = Arc::new(AtomicBool::new(true));
        let registry = Arc::new(crate::registry::DescriptorRegistry::new(4));
        let (_reactor, handle) = crate::reactor::Reactor::new(0, registry, 16, running).unwrap();
        let reactors = vec![handle];

        struct NoopCodec;
        impl Codec for NoopCodec {
            fn encode(&self, _m: &Message, _w: &mut bytes::BytesMut) -> Result<(), RuntimeError> {
                Ok(())
            }
            fn decode(&self, _r: &mut bytes::BytesMut) -> Result<crate::message::DecodeOutcome, RuntimeError> {
                Ok(crate::message::DecodeOutcome::NeedMore)
            }
        }
        let mut codecs = crate::message::CodecRegistry::new();
        codecs.register("rapid", Arc::new(NoopCodec));

        let config = ClientPoolConfig::builder("rapid", "rapid://127.0.0.1:1").pool_size(2).build().unwrap();
        let router = ClientRouter::new(&[config], &codecs, &reactors).unwrap();
        let a = router.get("rapid").unwrap();
        let b = router.get("rapid").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        let c = router.get("rapid").unwrap();
        assert!(Arc::ptr_eq(&a, &c));
    }

    struct NoopCodec;
    impl Codec for NoopCodec {
        fn encode(&self, _m: &Message, _w: &mut bytes::BytesMut) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn decode(&self, _r: &mut bytes::BytesMut) -> Result<crate::message::DecodeOutcome, RuntimeError> {
            Ok(crate::message::DecodeOutcome::NeedMore)
        }
    }

    /// §8 S3 "Disconnect fan-out": 50 coroutines suspended on one client
    /// channel all resume with a transport error when the peer closes,
    /// and each resumes exactly once.
    #[test]
    fn on_disconnected_resumes_every_in_flight_task_with_transport_error() {
        use crate::coroutine::{CoroContext, CoroutineScheduler};
        use std::sync::atomic::AtomicUsize;

        let running = Arc::new(AtomicBool::new(true));
        let registry = Arc::new(crate::registry::DescriptorRegistry::new(4));
        let (_reactor, handle) = crate::reactor::Reactor::new(0, registry, 16, running).unwrap();

        let channel = ClientChannel::new(
            "rapid".to_string(),
            Endpoint::parse("rapid://127.0.0.1:1").unwrap(),
            Arc::new(NoopCodec),
            handle.clone(),
            BackoffConfig::default(),
            Duration::from_secs(5),
        );

        let mut scheduler = CoroutineScheduler::new(0, Arc::from(vec![handle]));
        let completed = Arc::new(AtomicUsize::new(0));
        const TASK_COUNT: usize = 50;

        for i in 0..TASK_COUNT {
            let completed = completed.clone();
            let channel = channel.clone();
            let handler: Arc<dyn Fn(Message, &CoroContext) + Send + Sync> = Arc::new(move |_msg, ctx| {
                let _outcome = ctx.yield_now(|handle| {
                    channel.in_flight.lock().insert(i as u64, handle);
                });
                completed.fetch_add(1, Ordering::Relaxed);
            });
            scheduler.dispatch(handler, Message::one_way(&b"req"[..])).unwrap();
        }

        assert_eq!(scheduler.active_task_count(), TASK_COUNT);
        assert_eq!(channel.in_flight.lock().len(), TASK_COUNT);

        channel.on_disconnected();
        assert!(channel.in_flight.lock().is_empty());

        scheduler.drain_resumes();
        assert_eq!(completed.load(Ordering::Relaxed), TASK_COUNT);
        assert_eq!(scheduler.active_task_count(), 0);
    }
}
