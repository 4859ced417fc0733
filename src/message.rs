//! Protocol messages and the pluggable codec interface (§3, §6).
//!
//! A [`Message`] is an opaque unit produced by a [`Codec`]: it carries
//! enough context (direction, correlation id, source descriptor) to be
//! routed back to the reactor that decoded it without a reverse lookup.
//! No wire format is mandated; codecs are registered per URI scheme
//! (`rapid://host:port`) against a [`CodecRegistry`].

use crate::error::RuntimeError;
use crate::registry::Descriptor;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a message flows in, out expecting a reply, or out with none.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
    OneWay,
}

/// A decoded (or to-be-encoded) protocol unit.
#[derive(Clone, Debug)]
pub struct Message {
    pub direction: Direction,
    /// Present on responses; echoes the request's correlation key.
    pub correlation_id: Option<u64>,
    /// The descriptor the message arrived on (inbound) or should be
    /// written to (outbound), so a reply needs no reverse lookup.
    pub source: Option<Descriptor>,
    pub payload: Bytes,
}

impl Message {
    pub fn request(payload: impl Into<Bytes>) -> Self {
        Message {
            direction: Direction::Request,
            correlation_id: None,
            source: None,
            payload: payload.into(),
        }
    }

    pub fn response(correlation_id: u64, payload: impl Into<Bytes>) -> Self {
        Message {
            direction: Direction::Response,
            correlation_id: Some(correlation_id),
            source: None,
            payload: payload.into(),
        }
    }

    pub fn one_way(payload: impl Into<Bytes>) -> Self {
        Message {
            direction: Direction::OneWay,
            correlation_id: None,
            source: None,
            payload: payload.into(),
        }
    }

    pub fn with_source(mut self, descriptor: Descriptor) -> Self {
        self.source = Some(descriptor);
        self
    }
}

/// Outcome of attempting to decode one frame from a byte stream.
pub enum DecodeOutcome {
    Message(Message),
    /// The buffer doesn't yet hold a complete frame; wait for more bytes.
    NeedMore,
}

/// A pluggable wire-format codec, registered against a URI scheme.
///
/// `encode` serialises a message into the outbound buffer; `decode`
/// attempts to consume a complete frame from the inbound buffer, advancing
/// it past whatever it consumed.
pub trait Codec: Send + Sync {
    fn encode(&self, message: &Message, writer: &mut BytesMut) -> Result<(), RuntimeError>;

    fn decode(&self, reader: &mut BytesMut) -> Result<DecodeOutcome, RuntimeError>;
}

/// Maps a URI scheme (the `rapid` in `rapid://host:port`) to its codec.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheme: impl Into<String>, codec: Arc<dyn Codec>) {
        self.codecs.insert(scheme.into(), codec);
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(scheme).cloned()
    }
}

/// `<scheme>://<host>:<port>` endpoint, as consumed by client pools and
/// (implicitly) the listener that accepts connections for a scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(uri: &str) -> Result<Self, RuntimeError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| RuntimeError::protocol(None, format!("malformed endpoint `{uri}`: missing scheme")))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| RuntimeError::protocol(None, format!("malformed endpoint `{uri}`: missing port")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| RuntimeError::protocol(None, format!("malformed endpoint `{uri}`: bad port `{port}`")))?;
        Ok(Endpoint {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parses_scheme_host_port() {
        let endpoint = Endpoint::parse("rapid://localhost:9000").unwrap();
        assert_eq!(endpoint.scheme, "rapid");
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 9000);
    }

    #[test]
    fn endpoint_rejects_missing_scheme() {
        assert!(Endpoint::parse("localhost:9000").is_err());
    }

    #[test]
    fn codec_registry_looks_up_by_scheme() {
        struct NoopCodec;
        impl Codec for NoopCodec {
            fn encode(&self, _message: &Message, _writer: &mut BytesMut) -> Result<(), RuntimeError> {
                Ok(())
            }
            fn decode(&self, _reader: &mut BytesMut) -> Result<DecodeOutcome, RuntimeError> {
                Ok(DecodeOutcome::NeedMore)
            }
        }

        let mut registry = CodecRegistry::new();
        registry.register("rapid", Arc::new(NoopCodec));
        assert!(registry.get("rapid").is_some());
        assert!(registry.get("other").is_none());
    }
}
