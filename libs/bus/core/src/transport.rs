//! # Transport Trait & Service Bus Facade
//!
//! ## Purpose
//! [`Transport`] is the capability seam each broker adapter implements;
//! [`ServiceBus`] composes one transport with one [`MessageRouter`] and owns
//! the lifecycle state machine (init → start → stop → dispose, the last two
//! idempotent).
//!
//! ## RPC Strategies
//! `execute` branches on [`TransportCapabilities::native_rpc`]:
//! - native (subject brokers): the adapter blocks on a broker-managed reply
//!   inbox and returns the payload from `send` directly
//! - correlation-based (topic exchanges, memory): a pending entry is
//!   registered before publishing, and the caller awaits the correlated
//!   reply on this instance's response destination, bounded by the
//!   configured timeout

use crate::{
    BusConfig, BusError, BusResult, IdGenerator, MessageRouter, OutboundRequest, Pipeline,
    ReplyMessage, TransportCapabilities,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Broker adapter contract consumed by [`ServiceBus`].
///
/// `start` receives the pipeline to dispatch inbound deliveries into; all
/// inbound-side errors stay contained behind it. Outbound errors from
/// `send`/`send_reply` propagate to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// What this broker can do; drives dead-letter and RPC strategy choices
    fn capabilities(&self) -> TransportCapabilities;

    /// Connect and provision broker resources (exchanges, queues, the
    /// response destination)
    async fn init(&mut self) -> BusResult<()>;

    /// Translate the pipeline's route table into subscriptions/bindings and
    /// begin consuming
    async fn start(&mut self, pipeline: Arc<dyn Pipeline>) -> BusResult<()>;

    /// Flush outstanding publishes, drain in-flight deliveries, and close
    /// subscriptions. Must be a no-op when already stopped.
    async fn stop(&mut self) -> BusResult<()>;

    /// Tear down the connection. Must be a no-op when already disposed.
    async fn dispose(&mut self) -> BusResult<()>;

    /// Publish one message. For native-RPC transports an `is_rpc` request
    /// returns `Some(reply payload)`; everything else returns `None`.
    async fn send(&self, request: OutboundRequest) -> BusResult<Option<String>>;

    /// Publish a handler's reply directly to the requester's reply
    /// destination, bypassing route-based addressing
    async fn send_reply(&self, reply: ReplyMessage) -> BusResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Created,
    Initialized,
    Started,
    Stopped,
    Disposed,
}

/// One message-bus instance: a router, a transport, and a lifecycle.
pub struct ServiceBus {
    config: BusConfig,
    router: Arc<MessageRouter>,
    transport: Box<dyn Transport>,
    ids: IdGenerator,
    state: LifecycleState,
}

impl ServiceBus {
    pub fn new(config: BusConfig, transport: Box<dyn Transport>) -> BusResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            router: Arc::new(MessageRouter::new()),
            transport,
            ids: IdGenerator::new(),
            state: LifecycleState::Created,
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Handler registry; `router().on(...)` / `router().on_prefix(...)`
    /// register routes. Registrations made after `start` take effect on the
    /// next start.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn capabilities(&self) -> TransportCapabilities {
        self.transport.capabilities()
    }

    /// Connect and provision broker resources.
    pub async fn init(&mut self) -> BusResult<()> {
        match self.state {
            LifecycleState::Created => {
                self.transport.init().await?;
                self.state = LifecycleState::Initialized;
                info!(module = %self.config.module_name, "bus initialized");
                Ok(())
            }
            LifecycleState::Initialized => Ok(()),
            other => Err(BusError::State(format!(
                "cannot init from state {other:?}"
            ))),
        }
    }

    /// Begin consuming. Initializes first when needed.
    pub async fn start(&mut self) -> BusResult<()> {
        match self.state {
            LifecycleState::Created => self.init().await?,
            LifecycleState::Initialized => {}
            LifecycleState::Started => return Ok(()),
            other => {
                return Err(BusError::State(format!(
                    "cannot start from state {other:?}"
                )))
            }
        }

        let pipeline: Arc<dyn Pipeline> = self.router.clone();
        self.transport.start(pipeline).await?;
        self.state = LifecycleState::Started;
        info!(module = %self.config.module_name, "bus started");
        Ok(())
    }

    /// Stop consuming. Idempotent; safe to call in any state.
    pub async fn stop(&mut self) -> BusResult<()> {
        if self.state == LifecycleState::Started {
            self.transport.stop().await?;
            self.state = LifecycleState::Stopped;
            info!(module = %self.config.module_name, "bus stopped");
        }
        Ok(())
    }

    /// Stop and tear down the connection. Idempotent.
    pub async fn dispose(&mut self) -> BusResult<()> {
        if self.state == LifecycleState::Disposed {
            return Ok(());
        }

        self.stop().await?;
        self.transport.dispose().await?;
        self.state = LifecycleState::Disposed;
        info!(module = %self.config.module_name, "bus disposed");
        Ok(())
    }

    /// Fire-and-forget publish. Returns once the broker client confirms
    /// local buffering/flush; no reply is awaited and no reply address is
    /// attached.
    pub async fn send(
        &self,
        route: impl Into<String>,
        payload: impl Into<String>,
    ) -> BusResult<()> {
        self.ensure_started()?;

        let request = OutboundRequest {
            route: route.into(),
            payload: payload.into(),
            correlation_id: self.ids.next_id(),
            is_rpc: false,
            timeout: None,
        };

        self.transport.send(request).await?;
        Ok(())
    }

    /// RPC call: publish and block until the correlated reply arrives or
    /// the configured timeout elapses.
    pub async fn execute(
        &self,
        route: impl Into<String>,
        payload: impl Into<String>,
    ) -> BusResult<String> {
        self.ensure_started()?;

        let timeout = self.config.rpc_timeout();
        let correlation_id = self.ids.next_id();
        let request = OutboundRequest {
            route: route.into(),
            payload: payload.into(),
            correlation_id: correlation_id.clone(),
            is_rpc: true,
            timeout: Some(timeout),
        };

        if self.transport.capabilities().native_rpc {
            // the broker manages the reply inbox and the wait
            return match self.transport.send(request).await? {
                Some(reply) => Ok(reply),
                None => Err(BusError::Publish(
                    "native RPC transport returned no reply".to_string(),
                )),
            };
        }

        // correlation-based: register before publishing so a fast reply
        // cannot race the table entry
        let rx = self.router.register_pending(&correlation_id, timeout);

        if let Err(err) = self.transport.send(request).await {
            self.router.abandon_pending(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            // sender dropped (entry evicted) or window elapsed: both are
            // timeouts from the caller's point of view
            Ok(Err(_)) | Err(_) => {
                self.router.abandon_pending(&correlation_id);
                debug!(correlation_id, "RPC call abandoned after timeout");
                Err(BusError::Timeout(timeout))
            }
        }
    }

    fn ensure_started(&self) -> BusResult<()> {
        if self.state == LifecycleState::Started {
            Ok(())
        } else {
            Err(BusError::State(format!(
                "bus is not started (state {:?})",
                self.state
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records outbound traffic; answers native RPC with a canned reply.
    struct RecordingTransport {
        caps: TransportCapabilities,
        sent: Arc<Mutex<Vec<OutboundRequest>>>,
        inits: Arc<Mutex<u32>>,
        stops: Arc<Mutex<u32>>,
        disposals: Arc<Mutex<u32>>,
    }

    impl RecordingTransport {
        fn new(caps: TransportCapabilities) -> Self {
            Self {
                caps,
                sent: Arc::new(Mutex::new(Vec::new())),
                inits: Arc::new(Mutex::new(0)),
                stops: Arc::new(Mutex::new(0)),
                disposals: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn capabilities(&self) -> TransportCapabilities {
            self.caps
        }

        async fn init(&mut self) -> BusResult<()> {
            *self.inits.lock().unwrap() += 1;
            Ok(())
        }

        async fn start(&mut self, _pipeline: Arc<dyn Pipeline>) -> BusResult<()> {
            Ok(())
        }

        async fn stop(&mut self) -> BusResult<()> {
            *self.stops.lock().unwrap() += 1;
            Ok(())
        }

        async fn dispose(&mut self) -> BusResult<()> {
            *self.disposals.lock().unwrap() += 1;
            Ok(())
        }

        async fn send(&self, request: OutboundRequest) -> BusResult<Option<String>> {
            let native_reply = self.caps.native_rpc && request.is_rpc;
            self.sent.lock().unwrap().push(request);
            Ok(native_reply.then(|| "native-reply".to_string()))
        }

        async fn send_reply(&self, _reply: ReplyMessage) -> BusResult<()> {
            Ok(())
        }
    }

    fn caps(native_rpc: bool) -> TransportCapabilities {
        TransportCapabilities {
            supports_acknowledgment: false,
            native_rpc,
        }
    }

    #[tokio::test]
    async fn send_is_fire_and_forget() {
        let transport = RecordingTransport::new(caps(false));
        let sent = transport.sent.clone();
        let mut bus = ServiceBus::new(BusConfig::new("test"), Box::new(transport)).unwrap();

        bus.start().await.unwrap();
        bus.send("orders.created", "{}").await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].is_rpc);
        assert!(sent[0].timeout.is_none());
    }

    #[tokio::test]
    async fn native_rpc_returns_transport_reply() {
        let transport = RecordingTransport::new(caps(true));
        let mut bus = ServiceBus::new(BusConfig::new("test"), Box::new(transport)).unwrap();

        bus.start().await.unwrap();
        let reply = bus.execute("PING", "{}").await.unwrap();
        assert_eq!(reply, "native-reply");
        assert_eq!(bus.router().pending_calls(), 0);
    }

    #[tokio::test]
    async fn correlated_rpc_times_out_and_cleans_up() {
        let transport = RecordingTransport::new(caps(false));
        let config = BusConfig {
            default_rpc_timeout_ms: 20,
            ..BusConfig::new("test")
        };
        let mut bus = ServiceBus::new(config, Box::new(transport)).unwrap();

        bus.start().await.unwrap();
        for _ in 0..5 {
            let err = bus.execute("PING", "{}").await.unwrap_err();
            assert!(matches!(err, BusError::Timeout(_)));
        }
        assert_eq!(bus.router().pending_calls(), 0);
    }

    #[tokio::test]
    async fn operations_require_started_state() {
        let transport = RecordingTransport::new(caps(false));
        let bus = ServiceBus::new(BusConfig::new("test"), Box::new(transport)).unwrap();

        assert!(matches!(
            bus.send("r", "{}").await.unwrap_err(),
            BusError::State(_)
        ));
        assert!(matches!(
            bus.execute("r", "{}").await.unwrap_err(),
            BusError::State(_)
        ));
    }

    #[tokio::test]
    async fn stop_and_dispose_are_idempotent() {
        let transport = RecordingTransport::new(caps(false));
        let stops = transport.stops.clone();
        let disposals = transport.disposals.clone();
        let mut bus = ServiceBus::new(BusConfig::new("test"), Box::new(transport)).unwrap();

        bus.start().await.unwrap();
        bus.stop().await.unwrap();
        bus.stop().await.unwrap();
        bus.dispose().await.unwrap();
        bus.dispose().await.unwrap();

        assert_eq!(*stops.lock().unwrap(), 1);
        assert_eq!(*disposals.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn start_after_dispose_is_rejected() {
        let transport = RecordingTransport::new(caps(false));
        let mut bus = ServiceBus::new(BusConfig::new("test"), Box::new(transport)).unwrap();

        bus.dispose().await.unwrap();
        assert!(matches!(
            bus.start().await.unwrap_err(),
            BusError::State(_)
        ));
    }
}
