//! # Bus Core Infrastructure
//!
//! Shared infrastructure for all broker adapters: route table and pattern
//! translation, the message-processing pipeline, RPC correlation, the
//! transport capability trait, and the `ServiceBus` facade that composes
//! them.
//!
//! ## Architecture Role
//!
//! ```text
//! Application ──on(route, handler)──▶ MessageRouter ◀──deliveries── Transport
//!      │                                   │                    (nats / amqp /
//!      └──execute / send──▶ ServiceBus ────┘                        memory)
//! ```
//!
//! Adapters implement [`Transport`]; the router implements [`Pipeline`].
//! Neither side knows the other's concrete type, so the same handler code
//! runs unchanged over a subject broker, a topic exchange, or the in-memory
//! loopback.

pub mod config;
pub mod correlation;
pub mod memory;
pub mod pipeline;
pub mod routing;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use config::*;
pub use correlation::*;
pub use memory::*;
pub use pipeline::*;
pub use routing::*;
pub use transport::*;
pub use types::*;

/// Bus-specific errors
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Broker unreachable or connection-level failure. Fatal at init/start;
    /// no retry beyond whatever the broker client does itself.
    #[error("Connection error: {0}")]
    Connection(String),

    /// RPC reply did not arrive within the configured window.
    #[error("RPC timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Publish failed; surfaced to the caller of `send`/`execute`.
    #[error("Publish error: {0}")]
    Publish(String),

    /// Application handler returned an error.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Failure while writing a dead-letter record. Logged by dispatchers,
    /// never allowed to block acknowledgment of the original message.
    #[error("Dead-letter error: {0}")]
    DeadLetter(String),

    /// Malformed payload. The message is skipped, not retried.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not valid in the current lifecycle state.
    #[error("State error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;
