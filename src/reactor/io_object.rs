//! The typed I/O objects stored in a reactor's [`DescriptorRegistry`](crate::registry::DescriptorRegistry).
//!
//! §4.3 names four kinds: listener, connection, client channel, timer.
//! Timers live in the reactor's own [`TimerWheel`](super::timer::TimerWheel)
//! rather than the registry (their descriptor exists only so cancellation
//! and logging can refer to them uniformly); client channel state lives in
//! [`crate::client`], with only a marker here so a descriptor handed out
//! for a channel round-trips through the same registry as everything else.
//!
//! A [`Connection`] doesn't store its own descriptor — it is only known
//! after the object has already been moved into the registry — so
//! `on_readable`/`on_writable` take it as a parameter from the reactor,
//! which always has it to hand (it came out of the poll event's token).

use crate::error::RuntimeError;
use crate::message::{Codec, DecodeOutcome, Message};
use crate::registry::Descriptor;
use bytes::BytesMut;
use mio::net::{TcpListener, TcpStream};
use std::sync::Arc;

/// Delivers a decoded inbound message to its stage. Installed by the
/// runtime when a listener is registered for a service.
pub type MessageSink = Arc<dyn Fn(Message) + Send + Sync>;

/// A listener together with the codec and sink new connections inherit.
pub struct ListenerState {
    pub listener: TcpListener,
    pub codec: Arc<dyn Codec>,
    pub sink: MessageSink,
}

pub struct Connection {
    pub stream: TcpStream,
    pub codec: Arc<dyn Codec>,
    pub sink: MessageSink,
    pub read_buffer: BytesMut,
    pub write_buffer: BytesMut,
    pub writable_interest: bool,
    /// Notified when the reactor releases this connection's descriptor
    /// (peer closed, read/write error). Client channels install this to
    /// learn about disconnects and drive reconnection (§4.5); inbound
    /// server connections leave it unset.
    pub on_close: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Connection {
    pub fn new(stream: TcpStream, codec: Arc<dyn Codec>, sink: MessageSink) -> Self {
        Connection {
            stream,
            codec,
            sink,
            read_buffer: BytesMut::with_capacity(8 * 1024),
            write_buffer: BytesMut::new(),
            writable_interest: false,
            on_close: None,
        }
    }

    pub fn with_on_close(mut self, on_close: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.on_close = Some(on_close);
        self
    }

    /// Read as much as is available, decode every complete frame, and
    /// hand each to this connection's sink tagged with `descriptor` (so a
    /// reply needs no reverse lookup, §3).
    pub fn on_readable(&mut self, descriptor: Descriptor) -> Result<(), RuntimeError> {
        use std::io::Read;
        let mut scratch = [0u8; 4096];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => {
                    return Err(RuntimeError::transport(Some(descriptor), "peer closed the connection"));
                }
                Ok(n) => self.read_buffer.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RuntimeError::transport(Some(descriptor), e.to_string())),
            }
        }

        loop {
            match self.codec.decode(&mut self.read_buffer)? {
                DecodeOutcome::Message(message) => {
                    (self.sink)(message.with_source(descriptor));
                }
                DecodeOutcome::NeedMore => break,
            }
        }
        Ok(())
    }

    /// Encode `message` into the outbound buffer; the reactor arms
    /// writable interest for this descriptor if the buffer was empty.
    pub fn enqueue_write(&mut self, message: &Message) -> Result<(), RuntimeError> {
        self.codec.encode(message, &mut self.write_buffer)?;
        self.writable_interest = !self.write_buffer.is_empty();
        Ok(())
    }

    /// Flush as much of the outbound buffer as the socket accepts.
    pub fn on_writable(&mut self, descriptor: Descriptor) -> Result<(), RuntimeError> {
        use std::io::Write;
        while !self.write_buffer.is_empty() {
            match self.stream.write(&self.write_buffer) {
                Ok(0) => return Err(RuntimeError::transport(Some(descriptor), "write returned zero")),
                Ok(n) => {
                    let _ = self.write_buffer.split_to(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RuntimeError::transport(Some(descriptor), e.to_string())),
            }
        }
        self.writable_interest = !self.write_buffer.is_empty();
        Ok(())
    }
}

/// The typed object behind a descriptor.
pub enum IoObject {
    Listener(ListenerState),
    Connection(Connection),
    /// A client channel's socket state lives in `crate::client`; this
    /// variant only reserves the descriptor slot so it is numbered from
    /// the same registry.
    ClientChannel,
    /// Likewise for timers, which live in the reactor's `TimerWheel`.
    Timer,
    /// A slot reserved so its descriptor can be handed to `mio` for
    /// registration before the real object (whose construction can fail,
    /// e.g. a pending accept) is known. Always overwritten before any
    /// handler runs against it.
    Pending,
}
