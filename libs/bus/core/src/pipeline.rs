//! # Message Pipeline
//!
//! ## Purpose
//! The broker-independent half of message processing: a handler registry
//! keyed by exact route or prefix, dispatch of normalized envelopes into
//! those handlers, and resolution of correlated RPC replies.
//!
//! ## Architecture Role
//!
//! Adapters depend on the [`Pipeline`] trait, never on [`MessageRouter`]
//! directly; the router depends on nothing broker-specific. This is the
//! composition seam that lets one routing/correlation implementation serve
//! a subject broker, a topic exchange, and the in-memory loopback.
//!
//! ## Dispatch Rules
//! - Empty payloads are skipped silently; that is not a failure
//! - Exact-route handlers win over prefix handlers; among matching prefixes
//!   the longest wins
//! - A handler error becomes [`Dispatch::Failed`] with a normalized
//!   [`ErrorInfo`]; the adapter decides whether dead-lettering is possible
//! - A reply is only constructed when the envelope carried `reply_to`

use crate::{
    BusResult, CorrelationTable, Dispatch, ErrorInfo, InboundEnvelope, ReplyMessage, RouteTable,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Boxed future returned by route handlers.
pub type HandlerFuture = BoxFuture<'static, BusResult<Option<String>>>;

/// A registered route handler. Receives the normalized envelope and may
/// return a reply payload.
pub type RouteHandler = Arc<dyn Fn(InboundEnvelope) -> HandlerFuture + Send + Sync>;

/// The shared message-processing contract adapters dispatch into.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Exact routes with registered handlers
    fn registered_routes(&self) -> Vec<String>;

    /// Prefixes with registered handlers
    fn registered_prefixes(&self) -> Vec<String>;

    /// Snapshot of the current registrations for pattern translation
    fn route_table(&self) -> RouteTable {
        RouteTable::new(self.registered_routes(), self.registered_prefixes())
    }

    /// Dispatch one inbound envelope. Never returns an error: failures are
    /// folded into [`Dispatch::Failed`] so the caller of an adapter's
    /// `start()` is insulated from inbound-side problems.
    async fn process_message(&self, envelope: InboundEnvelope) -> Dispatch;

    /// Resolve a reply observed on the response destination. Unknown or
    /// expired correlation ids are ignored.
    fn process_response_message(&self, correlation_id: &str, payload: String, route: &str);
}

/// Handler registry and dispatcher implementing [`Pipeline`].
#[derive(Default)]
pub struct MessageRouter {
    handlers: DashMap<String, RouteHandler>,
    prefix_handlers: DashMap<String, RouteHandler>,
    pending: CorrelationTable,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an exact route.
    ///
    /// Duplicate registration is last-wins; the overwrite is logged so it
    /// never happens silently.
    pub fn on<F, Fut>(&self, route: impl Into<String>, handler: F)
    where
        F: Fn(InboundEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BusResult<Option<String>>> + Send + 'static,
    {
        let route = route.into();
        let handler: RouteHandler = Arc::new(move |envelope| Box::pin(handler(envelope)));
        if self.handlers.insert(route.clone(), handler).is_some() {
            warn!(route, "replacing existing handler for route");
        }
    }

    /// Register a handler for a prefix: the route itself and everything
    /// nested under it.
    pub fn on_prefix<F, Fut>(&self, prefix: impl Into<String>, handler: F)
    where
        F: Fn(InboundEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BusResult<Option<String>>> + Send + 'static,
    {
        let prefix = prefix.into();
        let handler: RouteHandler = Arc::new(move |envelope| Box::pin(handler(envelope)));
        if self.prefix_handlers.insert(prefix.clone(), handler).is_some() {
            warn!(prefix, "replacing existing handler for prefix");
        }
    }

    /// Register a pending RPC call; the returned receiver resolves when a
    /// correlated reply arrives within `window`.
    pub fn register_pending(
        &self,
        correlation_id: &str,
        window: Duration,
    ) -> oneshot::Receiver<String> {
        self.pending.register(correlation_id, window)
    }

    /// Drop a pending call the caller timed out on.
    pub fn abandon_pending(&self, correlation_id: &str) {
        self.pending.abandon(correlation_id);
    }

    /// Number of RPC calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Exact handler first, then the longest matching prefix.
    fn find_handler(&self, route: &str) -> Option<RouteHandler> {
        if let Some(handler) = self.handlers.get(route) {
            return Some(handler.value().clone());
        }

        self.prefix_handlers
            .iter()
            .filter(|entry| route.starts_with(entry.key().as_str()))
            .max_by_key(|entry| entry.key().len())
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl Pipeline for MessageRouter {
    fn registered_routes(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    fn registered_prefixes(&self) -> Vec<String> {
        self.prefix_handlers
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    async fn process_message(&self, envelope: InboundEnvelope) -> Dispatch {
        if envelope.payload.is_empty() {
            debug!(route = %envelope.route, "skipping empty payload");
            return Dispatch::Skipped;
        }

        let Some(handler) = self.find_handler(&envelope.route) else {
            debug!(route = %envelope.route, "no handler registered for route");
            return Dispatch::Skipped;
        };

        let reply_to = envelope.reply_to.clone();
        let correlation_id = envelope.correlation_id.clone();

        match handler(envelope).await {
            Ok(Some(payload)) => match reply_to {
                Some(reply_to) => Dispatch::Completed(Some(ReplyMessage {
                    reply_to,
                    correlation_id,
                    payload,
                })),
                // fire-and-forget: the return value has nowhere to go
                None => Dispatch::Completed(None),
            },
            Ok(None) => Dispatch::Completed(None),
            Err(err) => Dispatch::Failed(ErrorInfo::from_handler_error(&err)),
        }
    }

    fn process_response_message(&self, correlation_id: &str, payload: String, route: &str) {
        debug!(correlation_id, route, "resolving correlated reply");
        self.pending.complete(correlation_id, payload);
    }
}
