//! # Subject-Based Broker Adapter (NATS)
//!
//! ## Purpose
//! Implements `bus_core::Transport` over hierarchical subjects. Prefixes
//! translate to `prefix.>` wildcard subscriptions, RPC rides the broker's
//! native request/reply inboxes, and — since the protocol has no
//! acknowledgment primitive — handler failures are published to a
//! dead-letter subject as a pure side-channel notification.
//!
//! ## Capability Profile
//! - `supports_acknowledgment: false` — delivery is complete on receipt;
//!   a failed message cannot be re-queued
//! - `native_rpc: true` — `execute` blocks inside `send` on a
//!   broker-managed reply inbox, bounded by the configured timeout

pub mod config;
pub mod transport;

pub use config::NatsConfig;
pub use transport::NatsTransport;
