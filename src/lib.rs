//! A staged, coroutine-driven network service runtime.
//!
//! Bounded lock-free ring queues ([`queue`]) couple a fleet of readiness-
//! based reactor threads ([`reactor`]) to a pipeline of worker stages
//! ([`stage`]) that run handler code inside stackful coroutines
//! ([`coroutine`]), with a client router ([`client`]) for outbound
//! request/response traffic. [`Runtime`] wires the pieces together behind
//! the surface a host application drives.

pub mod client;
pub mod config;
pub mod coroutine;
pub mod error;
pub mod message;
pub mod queue;
pub mod reactor;
pub mod registry;
pub mod runtime;
pub mod stage;

pub use client::{ClientChannel, ClientRouter};
pub use config::{BackoffConfig, BootstrapConfig, ClientPoolConfig, RuntimeConfig, StageConfig};
pub use error::{RuntimeError, RuntimeErrorKind};
pub use message::{Codec, CodecRegistry, DecodeOutcome, Direction, Endpoint, Message};
pub use registry::{Descriptor, DescriptorRegistry};
pub use runtime::Runtime;
pub use stage::{HandlerFactory, ServiceHandler, Stage};
