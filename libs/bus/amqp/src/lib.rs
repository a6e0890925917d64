//! # Topic-Exchange Broker Adapter (AMQP)
//!
//! ## Purpose
//! Implements `bus_core::Transport` over a durable topic exchange. The
//! module queue is bound once per computed pattern (prefixes become
//! `prefix.#` binding keys), RPC is correlation-based over a per-instance
//! exclusive response queue, and handler failures are re-published to the
//! dead-letter queue before the original delivery is acknowledged.
//!
//! ## Capability Profile
//! - `supports_acknowledgment: true` — every delivery is acked exactly
//!   once, after its outcome (reply, skip, or dead-letter) is settled
//! - `native_rpc: false` — `execute` registers a pending correlation entry
//!   and awaits the reply on this instance's response queue

pub mod config;
pub mod transport;

pub use config::AmqpConfig;
pub use transport::AmqpTransport;
