//! # In-Memory Loopback Transport
//!
//! ## Purpose
//! A brokerless [`Transport`] for tests and local development. Publishes
//! loop straight back into this instance's own pipeline when a registered
//! route or prefix covers them, RPC uses the correlation-based strategy
//! against a synthetic response destination, and dead letters are captured
//! in memory where tests can inspect them.
//!
//! No acknowledgment exists here, so like a subject broker the failure path
//! is a pure side-channel record.

use crate::{
    BusConfig, BusError, BusResult, DeadLetterRecord, Dispatch, ErrorInfo, InboundEnvelope,
    OutboundRequest, Pipeline, ReplyMessage, Transport, TransportCapabilities,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
struct MemoryDelivery {
    route: String,
    correlation_id: Option<String>,
    payload: String,
    reply_to: Option<String>,
}

struct MemoryInner {
    tx: mpsc::UnboundedSender<MemoryDelivery>,
    response_destination: String,
    dead_letters: Arc<Mutex<Vec<DeadLetterRecord>>>,
}

/// Handle onto the captured dead letters, usable after the transport has
/// been boxed into a bus.
#[derive(Clone)]
pub struct MemoryDeadLetterLog(Arc<Mutex<Vec<DeadLetterRecord>>>);

impl MemoryDeadLetterLog {
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.0.lock().expect("dead-letter log poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().expect("dead-letter log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loopback transport delivering to this process only.
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
    rx: Option<mpsc::UnboundedReceiver<MemoryDelivery>>,
    consumer: Option<JoinHandle<()>>,
}

impl MemoryTransport {
    pub fn new(config: &BusConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let instance_id = uuid::Uuid::new_v4().simple().to_string();

        Self {
            inner: Arc::new(MemoryInner {
                tx,
                response_destination: config.response_destination(&instance_id),
                dead_letters: Arc::new(Mutex::new(Vec::new())),
            }),
            rx: Some(rx),
            consumer: None,
        }
    }

    /// Captured dead letters; clone this before boxing the transport.
    pub fn dead_letter_log(&self) -> MemoryDeadLetterLog {
        MemoryDeadLetterLog(self.inner.dead_letters.clone())
    }

    fn enqueue(&self, delivery: MemoryDelivery) -> BusResult<()> {
        self.inner
            .tx
            .send(delivery)
            .map_err(|_| BusError::Publish("memory transport is stopped".to_string()))
    }

    async fn deliver(inner: Arc<MemoryInner>, pipeline: Arc<dyn Pipeline>, delivery: MemoryDelivery) {
        // replies to our own RPC calls resolve the correlation table
        if delivery.route == inner.response_destination {
            if let Some(correlation_id) = delivery.correlation_id.as_deref() {
                pipeline.process_response_message(correlation_id, delivery.payload, &delivery.route);
            }
            return;
        }

        if !pipeline.route_table().covers(&delivery.route) {
            debug!(route = %delivery.route, "no subscription covers route, dropping");
            return;
        }

        let envelope = InboundEnvelope {
            route: delivery.route,
            correlation_id: delivery.correlation_id,
            payload: delivery.payload,
            reply_to: delivery.reply_to,
        };
        let original = envelope.clone();

        match pipeline.process_message(envelope).await {
            Dispatch::Completed(Some(reply)) => {
                let _ = inner.tx.send(MemoryDelivery {
                    route: reply.reply_to,
                    correlation_id: reply.correlation_id,
                    payload: reply.payload,
                    reply_to: None,
                });
            }
            Dispatch::Completed(None) | Dispatch::Skipped => {}
            Dispatch::Failed(error) => Self::record_dead_letter(&inner, &original, error),
        }
    }

    fn record_dead_letter(inner: &MemoryInner, envelope: &InboundEnvelope, error: ErrorInfo) {
        warn!(route = %envelope.route, error = %error.message, "handler failed, recording dead letter");
        let record = DeadLetterRecord::from_envelope(envelope, error);
        inner
            .dead_letters
            .lock()
            .expect("dead-letter log poisoned")
            .push(record);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            supports_acknowledgment: false,
            native_rpc: false,
        }
    }

    async fn init(&mut self) -> BusResult<()> {
        Ok(())
    }

    async fn start(&mut self, pipeline: Arc<dyn Pipeline>) -> BusResult<()> {
        let mut rx = self
            .rx
            .take()
            .ok_or_else(|| BusError::State("memory transport already started".to_string()))?;
        let inner = self.inner.clone();

        self.consumer = Some(tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let inner = inner.clone();
                let pipeline = pipeline.clone();
                // each delivery is an independent unit of work
                tokio::spawn(async move {
                    MemoryTransport::deliver(inner, pipeline, delivery).await;
                });
            }
        }));

        Ok(())
    }

    async fn stop(&mut self) -> BusResult<()> {
        if let Some(consumer) = self.consumer.take() {
            consumer.abort();
            let _ = consumer.await;
        }
        Ok(())
    }

    async fn dispose(&mut self) -> BusResult<()> {
        self.stop().await
    }

    async fn send(&self, request: OutboundRequest) -> BusResult<Option<String>> {
        let (correlation_id, reply_to) = if request.is_rpc {
            (
                Some(request.correlation_id),
                Some(self.inner.response_destination.clone()),
            )
        } else {
            (None, None)
        };

        self.enqueue(MemoryDelivery {
            route: request.route,
            correlation_id,
            payload: request.payload,
            reply_to,
        })?;

        Ok(None)
    }

    async fn send_reply(&self, reply: ReplyMessage) -> BusResult<()> {
        self.enqueue(MemoryDelivery {
            route: reply.reply_to,
            correlation_id: reply.correlation_id,
            payload: reply.payload,
            reply_to: None,
        })
    }
}
