//! # Bus Message Types
//!
//! ## Purpose
//! Normalized message shapes shared by every adapter. Brokers differ in how
//! they carry routing and reply metadata (AMQP properties vs. NATS reply
//! subjects); these types are the common denominator the pipeline works on.
//!
//! ## Integration Points
//! - **InboundEnvelope**: one per delivered message, consumed exactly once
//!   by the pipeline, never persisted
//! - **OutboundRequest**: produced by `ServiceBus::send`/`execute`, consumed
//!   by `Transport::send`
//! - **ReplyMessage**: handler return value addressed back to the requester
//! - **DeadLetterRecord**: written once to the dead-letter destination on
//!   handler failure, never read back by this crate

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Normalized inbound message metadata plus decoded text payload.
///
/// Created by an adapter's consumption loop from broker-specific delivery
/// fields. The lifecycle of a delivery is:
/// Delivered → Processing → {Succeeded | Failed → DeadLettered} →
/// Acknowledged, where acknowledgment only exists on brokers whose
/// [`TransportCapabilities::supports_acknowledgment`] is true.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    /// Route the publisher addressed (routing key or subject)
    pub route: String,

    /// Correlation id from message properties, if the broker carries one
    pub correlation_id: Option<String>,

    /// Decoded text payload (application-defined JSON)
    pub payload: String,

    /// Reply destination for RPC-style requests; absent for fire-and-forget
    pub reply_to: Option<String>,
}

/// Outbound publish request, one-way or RPC.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Destination route (routing key or subject)
    pub route: String,

    /// Text payload to publish
    pub payload: String,

    /// Correlation id attached to RPC requests
    pub correlation_id: String,

    /// When true the sender must arrange for a correlated reply
    pub is_rpc: bool,

    /// Per-call override of the configured RPC timeout
    pub timeout: Option<Duration>,
}

/// Reply addressed directly to a requester's reply destination.
///
/// Bypasses route-based addressing entirely; the pipeline only builds one
/// when the originating envelope carried a `reply_to`.
#[derive(Debug, Clone)]
pub struct ReplyMessage {
    /// Destination taken from the originating envelope
    pub reply_to: String,

    /// Correlation id preserved from the request, when present
    pub correlation_id: Option<String>,

    /// Text payload returned by the handler
    pub payload: String,
}

/// Normalized error description attached to dead-lettered messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error category (e.g. "handler", "decode")
    pub kind: String,

    /// Human-readable error message
    pub message: String,

    /// Optional backtrace or nested error detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Normalize an arbitrary handler error into a dead-letter annotation.
    pub fn from_handler_error(err: &crate::BusError) -> Self {
        Self::new("handler", err.to_string())
    }
}

/// Record written to the dead-letter destination on handler failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Route the failed message was originally published to
    pub route: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Original payload, decoded where possible
    pub payload: serde_json::Value,

    /// Normalized failure description
    pub error: ErrorInfo,
}

impl DeadLetterRecord {
    /// Build a record from the failed envelope, decoding the payload so the
    /// error annotation can be merged into it. Non-JSON payloads are kept
    /// verbatim as a JSON string.
    pub fn from_envelope(envelope: &InboundEnvelope, error: ErrorInfo) -> Self {
        let payload = serde_json::from_str(&envelope.payload)
            .unwrap_or_else(|_| serde_json::Value::String(envelope.payload.clone()));

        Self {
            route: envelope.route.clone(),
            correlation_id: envelope.correlation_id.clone(),
            reply_to: envelope.reply_to.clone(),
            payload,
            error,
        }
    }

    /// Original payload re-annotated with the error, the shape operators
    /// inspect in the dead-letter queue. Object payloads gain a
    /// `handling_error` field; anything else is wrapped.
    pub fn annotated_payload(&self) -> serde_json::Value {
        let error = serde_json::to_value(&self.error).unwrap_or_default();
        match &self.payload {
            serde_json::Value::Object(map) => {
                let mut map = map.clone();
                map.insert("handling_error".to_string(), error);
                serde_json::Value::Object(map)
            }
            other => serde_json::json!({
                "payload": other,
                "handling_error": error,
            }),
        }
    }
}

/// What a broker adapter can and cannot do.
///
/// The pipeline branches on these flags instead of special-casing adapters:
/// dead-lettering is only meaningful where acknowledgment exists, and the
/// RPC strategy depends on whether the broker has a native request/reply
/// primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Broker supports explicit per-message acknowledgment
    pub supports_acknowledgment: bool,

    /// Broker has a native request/reply primitive with managed reply inboxes
    pub native_rpc: bool,
}

/// Outcome of dispatching one inbound envelope through the pipeline.
///
/// Adapters match on this to drive the reply, dead-letter, and
/// acknowledgment steps; the pipeline itself never touches the broker.
#[derive(Debug)]
pub enum Dispatch {
    /// Handler ran successfully; carries the reply to publish when the
    /// envelope had a reply destination
    Completed(Option<ReplyMessage>),

    /// Message skipped (empty payload or no registered handler); not a failure
    Skipped,

    /// Handler or dispatch failed; the adapter should dead-letter where
    /// supported and still acknowledge the original exactly once
    Failed(ErrorInfo),
}
