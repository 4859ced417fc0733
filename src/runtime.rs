//! The top-level orchestrator (§6): wires the event loop fleet, the
//! descriptor registry, the configured stages, and the client router
//! into one handle with the public surface a host application drives.

use crate::client::{ClientChannel, ClientRouter};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::message::{Codec, CodecRegistry, Endpoint, Message};
use crate::reactor::io_object::{IoObject, ListenerState};
use crate::reactor::EventLoopFleet;
use crate::stage::{HandlerFactory, ServiceHandler, Stage};
use std::collections::HashMap;
use std::sync::Arc;

type ServiceFactory = Arc<dyn Fn() -> Arc<ServiceHandler> + Send + Sync>;

/// Owns every component and is the sole entry point a host application
/// constructs. Registration (`register_service`, `register_codec`,
/// `listen`) happens before [`Runtime::start`]; `listen` may also be
/// called after start, since a reactor is always available by then.
pub struct Runtime {
    reactor_count: usize,
    descriptor_capacity: usize,
    client_pools: Vec<crate::config::ClientPoolConfig>,
    fleet: Option<EventLoopFleet>,
    stages: HashMap<String, Arc<Stage>>,
    share_handler_by_stage: HashMap<String, bool>,
    handler_factories: HashMap<String, ServiceFactory>,
    codecs: CodecRegistry,
    client_router: Option<ClientRouter>,
    next_listener_reactor: std::sync::atomic::AtomicUsize,
}

impl Runtime {
    /// Build every configured stage (not yet started) from `config`.
    pub fn new(config: RuntimeConfig) -> Self {
        let mut stages = HashMap::new();
        let mut share_handler_by_stage = HashMap::new();
        for stage_config in config.stages {
            share_handler_by_stage.insert(stage_config.name.clone(), stage_config.share_handler);
            stages.insert(stage_config.name.clone(), Arc::new(Stage::new(stage_config)));
        }

        Runtime {
            reactor_count: config.reactor_count,
            descriptor_capacity: config.descriptor_capacity,
            client_pools: config.client_pools,
            fleet: None,
            stages,
            share_handler_by_stage,
            handler_factories: HashMap::new(),
            codecs: CodecRegistry::new(),
            client_router: None,
            next_listener_reactor: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Wire a handler factory to the stage named `name` (§6
    /// `RegisterService`). `factory` is called once per worker when the
    /// stage's `share_handler = false`, or once total when `true` — the
    /// same shape as [`HandlerFactory`].
    pub fn register_service(&mut self, name: &str, factory: impl Fn() -> Arc<ServiceHandler> + Send + Sync + 'static) -> Result<(), RuntimeError> {
        if !self.stages.contains_key(name) {
            return Err(RuntimeError::fatal(format!("no stage configured named `{name}`")));
        }
        self.handler_factories.insert(name.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Register a codec for `scheme` (§6 `RegisterCodec`), used both for
    /// listeners accepted via [`Runtime::listen`] and for client pools
    /// configured with a matching endpoint scheme.
    pub fn register_codec(&mut self, scheme: impl Into<String>, codec: Arc<dyn Codec>) {
        self.codecs.register(scheme, codec);
    }

    /// Launch the reactor fleet, every configured stage, and the client
    /// router (§6 `Start`).
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        let fleet = EventLoopFleet::start(self.reactor_count, self.descriptor_capacity)?;

        for (name, stage) in &self.stages {
            let Some(factory) = self.handler_factories.get(name) else {
                return Err(RuntimeError::fatal(format!("stage `{name}` has no registered service handler")));
            };
            let share_handler = *self.share_handler_by_stage.get(name).expect("stage map and share_handler map built together");
            let handler = if share_handler {
                HandlerFactory::Shared(factory())
            } else {
                HandlerFactory::PerWorker(factory.clone())
            };
            stage.start(handler, fleet.handles());
        }

        let client_router = ClientRouter::new(&self.client_pools, &self.codecs, fleet.handles())?;
        client_router.start_all()?;

        self.fleet = Some(fleet);
        self.client_router = Some(client_router);
        Ok(())
    }

    /// Flip every stage's and reactor's running flag (§6 `Stop`).
    /// Non-blocking; call [`Runtime::wait`] to join.
    pub fn stop(&self) {
        for stage in self.stages.values() {
            stage.stop();
        }
        if let Some(fleet) = &self.fleet {
            fleet.stop();
        }
    }

    /// Join every stage worker and reactor thread (§6 `Wait`). Surfaces
    /// the first fatal reactor error, if any.
    pub fn wait(&mut self) -> Result<(), RuntimeError> {
        for stage in self.stages.values() {
            stage.wait();
        }
        match self.fleet.take() {
            Some(fleet) => fleet.wait(),
            None => Ok(()),
        }
    }

    /// Round-robin a named client pool's channel (§6 `GetClient`).
    pub fn get_client(&self, name: &str) -> Option<Arc<ClientChannel>> {
        self.client_router.as_ref()?.get(name)
    }

    /// Bind a listener on `endpoint` (`<scheme>://<host>:<port>`) whose
    /// decoded messages are routed into the stage named `stage_name`.
    /// Requires a codec already registered for the endpoint's scheme and
    /// the fleet already started. Messages are hashed to a worker by
    /// their source descriptor slot, so all traffic from one connection
    /// lands on the same worker. Returns the address actually bound,
    /// since a port of `0` asks the OS to choose one.
    pub fn listen(&self, endpoint: &str, stage_name: &str) -> Result<std::net::SocketAddr, RuntimeError> {
        let fleet = self.fleet.as_ref().ok_or_else(|| RuntimeError::fatal("listen called before start"))?;
        let stage = self.stages.get(stage_name).cloned().ok_or_else(|| RuntimeError::fatal(format!("no stage configured named `{stage_name}`")))?;
        let endpoint = Endpoint::parse(endpoint)?;
        let codec = self
            .codecs
            .get(&endpoint.scheme)
            .ok_or_else(|| RuntimeError::fatal(format!("no codec registered for scheme `{}`", endpoint.scheme)))?;

        let addr = format!("{}:{}", endpoint.host, endpoint.port)
            .parse()
            .map_err(|e| RuntimeError::fatal(format!("bad listen address `{}:{}`: {e}", endpoint.host, endpoint.port)))?;
        let listener = mio::net::TcpListener::bind(addr).map_err(|e| RuntimeError::fatal(format!("bind failed: {e}")))?;
        let bound_addr = listener.local_addr().map_err(|e| RuntimeError::fatal(format!("failed to read bound listener address: {e}")))?;

        let reactor_index = self.next_listener_reactor.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % fleet.handles().len();
        let handle = fleet.handle(reactor_index).clone();

        let sink = Arc::new(move |message: Message| {
            let key = message.source.map(|d| d.slot() as u64).unwrap_or(0);
            let _ = stage.send(key, message);
        });

        handle.post(Box::new(move |reactor| {
            let mut listener = listener;
            let descriptor = match reactor.registry().allocate(IoObject::Pending) {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(error = %e, "descriptor registry exhausted registering listener");
                    return;
                }
            };
            if let Err(e) = reactor.register_interest(descriptor, &mut listener, false) {
                tracing::error!(error = %e, "failed to register listener");
                reactor.registry().release(descriptor);
                return;
            }
            reactor.registry().with_mut(descriptor, |object| {
                *object = IoObject::Listener(ListenerState { listener, codec, sink });
            });
        }));
        Ok(bound_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::message::{DecodeOutcome, Direction};
    use bytes::{Buf, BufMut, BytesMut};

    struct NoopCodec;
    impl Codec for NoopCodec {
        fn encode(&self, _m: &Message, _w: &mut bytes::BytesMut) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn decode(&self, _r: &mut bytes::BytesMut) -> Result<crate::message::DecodeOutcome, RuntimeError> {
            Ok(crate::message::DecodeOutcome::NeedMore)
        }
    }

    /// A minimal length-prefixed framing, real enough to drive an actual
    /// TCP round trip in `echo_service_round_trips_a_request`: a 4-byte
    /// big-endian body length, then a 1-byte direction tag, an 8-byte
    /// signed correlation id (`-1` for none), then the payload.
    struct FramedCodec;

    impl Codec for FramedCodec {
        fn encode(&self, message: &Message, writer: &mut BytesMut) -> Result<(), RuntimeError> {
            let direction = match message.direction {
                Direction::Request => 0u8,
                Direction::Response => 1u8,
                Direction::OneWay => 2u8,
            };
            let correlation = message.correlation_id.map(|id| id as i64).unwrap_or(-1);
            let body_len = 1 + 8 + message.payload.len();
            writer.reserve(4 + body_len);
            writer.put_u32(body_len as u32);
            writer.put_u8(direction);
            writer.put_i64(correlation);
            writer.put_slice(&message.payload);
            Ok(())
        }

        fn decode(&self, reader: &mut BytesMut) -> Result<DecodeOutcome, RuntimeError> {
            if reader.len() < 4 {
                return Ok(DecodeOutcome::NeedMore);
            }
            let body_len = u32::from_be_bytes(reader[0..4].try_into().unwrap()) as usize;
            if reader.len() < 4 + body_len {
                return Ok(DecodeOutcome::NeedMore);
            }
            reader.advance(4);
            let mut frame = reader.split_to(body_len);
            let direction = match frame.get_u8() {
                0 => Direction::Request,
                1 => Direction::Response,
                _ => Direction::OneWay,
            };
            let correlation = frame.get_i64();
            let payload = frame.copy_to_bytes(frame.remaining());
            Ok(DecodeOutcome::Message(Message {
                direction,
                correlation_id: if correlation < 0 { None } else { Some(correlation as u64) },
                source: None,
                payload,
            }))
        }
    }

    #[test]
    fn start_fails_when_a_stage_has_no_registered_handler() {
        let config = RuntimeConfig::builder().stage(StageConfig::builder("echo").queue_size(4).build().unwrap()).build().unwrap();
        let mut runtime = Runtime::new(config);
        let err = runtime.start().unwrap_err();
        assert_eq!(err.kind(), crate::error::RuntimeErrorKind::Fatal);
    }

    #[test]
    fn register_service_rejects_unknown_stage() {
        let config = RuntimeConfig::builder().build().unwrap();
        let mut runtime = Runtime::new(config);
        let err = runtime.register_service("missing", || Arc::new(|_msg, _ctx: &crate::coroutine::CoroContext| {})).unwrap_err();
        assert_eq!(err.kind(), crate::error::RuntimeErrorKind::Fatal);
    }

    /// §8 scenario S1 "Echo": a real client writes `"hello"` through the
    /// listener and must read back `"hello"`, having actually crossed the
    /// reactor → stage → coroutine → reply path end to end.
    #[test]
    fn echo_service_round_trips_a_request() {
        let config = RuntimeConfig::builder()
            .reactor_count(1)
            .stage(StageConfig::builder("echo").queue_size(4).build().unwrap())
            .build()
            .unwrap();
        let mut runtime = Runtime::new(config);
        runtime.register_codec("rapid", Arc::new(FramedCodec));
        runtime
            .register_service("echo", || {
                Arc::new(|msg: Message, ctx: &crate::coroutine::CoroContext| {
                    let Some(source) = msg.source else { return };
                    let correlation_id = msg.correlation_id.unwrap_or(0);
                    let reply = Message::response(correlation_id, msg.payload.clone()).with_source(source);
                    let _ = ctx.reply(reply);
                })
            })
            .unwrap();
        runtime.start().unwrap();
        let addr = runtime.listen("rapid://127.0.0.1:0", "echo").unwrap();

        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();

        let request = Message::request(&b"hello"[..]);
        let mut out = BytesMut::new();
        FramedCodec.encode(&request, &mut out).unwrap();
        use std::io::{Read, Write};
        stream.write_all(&out).unwrap();

        let mut response = BytesMut::new();
        let decoded = loop {
            if let DecodeOutcome::Message(message) = FramedCodec.decode(&mut response).unwrap() {
                break message;
            }
            let mut scratch = [0u8; 256];
            let n = stream.read(&mut scratch).unwrap();
            assert!(n > 0, "peer closed before a full response arrived");
            response.extend_from_slice(&scratch[..n]);
        };
        assert_eq!(&decoded.payload[..], b"hello");

        drop(stream);
        runtime.stop();
        runtime.wait().unwrap();
    }
}
