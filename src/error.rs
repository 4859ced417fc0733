//! The runtime's single error taxonomy (§7).
//!
//! Every fallible public entry point returns `Result<_, RuntimeError>`.
//! Variants carry enough context (descriptor, stage name, correlation key)
//! to log usefully at the call site; [`RuntimeError::kind`] mirrors the
//! taxonomy as a plain enum for cheap programmatic matching without
//! cloning the full error.

use crate::registry::Descriptor;
use thiserror::Error;

/// Cheap, `Copy` discriminant for [`RuntimeError`], for callers that only
/// need to branch on error category (e.g. deciding whether to retry).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    Transport,
    Protocol,
    Timeout,
    Backpressure,
    Cancelled,
    Fatal,
}

/// The runtime-wide error enum (§7).
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Connect/read/write failed, or the peer closed the connection.
    #[error("transport error on {descriptor:?}: {message}")]
    Transport {
        descriptor: Option<Descriptor>,
        message: String,
    },

    /// A codec failed to decode a frame, or a response carried an
    /// unexpected correlation key.
    #[error("protocol error on {descriptor:?}: {message}")]
    Protocol {
        descriptor: Option<Descriptor>,
        message: String,
    },

    /// A `SendReceive` exceeded its deadline before a response arrived.
    #[error("request timed out after {elapsed_ms}ms (correlation key {correlation_key})")]
    Timeout {
        correlation_key: u64,
        elapsed_ms: u64,
    },

    /// `Send`/`SendPriority` found the target queue full.
    #[error("stage `{stage}` queue is full")]
    Backpressure { stage: String },

    /// A task was cancelled before it observed a result at its yield point.
    #[error("task {task_id} was cancelled")]
    Cancelled { task_id: u64 },

    /// Poller failure or descriptor registry exhaustion; the runtime
    /// initiates shutdown on this variant.
    #[error("fatal runtime error: {message}")]
    Fatal { message: String },
}

impl RuntimeError {
    pub fn kind(&self) -> RuntimeErrorKind {
        match self {
            RuntimeError::Transport { .. } => RuntimeErrorKind::Transport,
            RuntimeError::Protocol { .. } => RuntimeErrorKind::Protocol,
            RuntimeError::Timeout { .. } => RuntimeErrorKind::Timeout,
            RuntimeError::Backpressure { .. } => RuntimeErrorKind::Backpressure,
            RuntimeError::Cancelled { .. } => RuntimeErrorKind::Cancelled,
            RuntimeError::Fatal { .. } => RuntimeErrorKind::Fatal,
        }
    }

    pub fn transport(descriptor: Option<Descriptor>, message: impl Into<String>) -> Self {
        RuntimeError::Transport {
            descriptor,
            message: message.into(),
        }
    }

    pub fn protocol(descriptor: Option<Descriptor>, message: impl Into<String>) -> Self {
        RuntimeError::Protocol {
            descriptor,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        RuntimeError::Fatal { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mirrors_the_variant() {
        let err = RuntimeError::Backpressure { stage: "echo".into() };
        assert_eq!(err.kind(), RuntimeErrorKind::Backpressure);
    }
}
