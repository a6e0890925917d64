//! # Subject Adapter Transport
//!
//! One subscription per computed pattern, one consumer task per
//! subscription, task-per-message dispatch into the shared pipeline.
//! Teardown flushes outstanding publishes and drains subscriptions before
//! the connection closes.

use async_nats::{Client, ConnectOptions, Request};
use async_trait::async_trait;
use bus_core::{
    BusConfig, BusError, BusResult, DeadLetterRecord, Dispatch, ErrorInfo, InboundEnvelope,
    OutboundRequest, Pipeline, ReplyMessage, Transport, TransportCapabilities, WildcardStyle,
};
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::NatsConfig;

/// `Transport` implementation for subject-based brokers.
pub struct NatsTransport {
    bus: BusConfig,
    config: NatsConfig,
    client: Option<Client>,
    consumers: Vec<JoinHandle<()>>,
}

impl NatsTransport {
    pub fn new(bus: BusConfig, config: NatsConfig) -> BusResult<Self> {
        bus.validate()?;
        config.validate()?;
        Ok(Self {
            bus,
            config,
            client: None,
            consumers: Vec::new(),
        })
    }

    fn client(&self) -> BusResult<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| BusError::State("transport is not initialized".to_string()))
    }

    fn default_timeout(&self) -> Duration {
        self.bus.rpc_timeout()
    }

    async fn flush_if_configured(&self, client: &Client) -> BusResult<()> {
        if self.bus.flush_after_publish {
            client
                .flush()
                .await
                .map_err(|e| BusError::Publish(format!("flush failed: {e}")))?;
        }
        Ok(())
    }

    /// Consumption loop for one subscription pattern. Every delivery is
    /// dispatched as its own task so slow handlers never stall the
    /// subscription.
    async fn consume(
        client: Client,
        pipeline: Arc<dyn Pipeline>,
        mut subscriber: async_nats::Subscriber,
        dead_letter_subject: String,
        flush_replies: bool,
    ) {
        while let Some(message) = subscriber.next().await {
            let client = client.clone();
            let pipeline = pipeline.clone();
            let dead_letter_subject = dead_letter_subject.clone();

            tokio::spawn(async move {
                Self::dispatch(client, pipeline, message, dead_letter_subject, flush_replies)
                    .await;
            });
        }
    }

    async fn dispatch(
        client: Client,
        pipeline: Arc<dyn Pipeline>,
        message: async_nats::Message,
        dead_letter_subject: String,
        flush_replies: bool,
    ) {
        if message.payload.is_empty() {
            return;
        }

        let payload = match String::from_utf8(message.payload.to_vec()) {
            Ok(payload) => payload,
            Err(err) => {
                // malformed payload: skipped, not retried, not dead-lettered
                warn!(subject = %message.subject, error = %err, "skipping undecodable payload");
                return;
            }
        };

        let envelope = InboundEnvelope {
            route: message.subject.to_string(),
            // the wire carries no correlation id, only a reply subject
            correlation_id: None,
            payload,
            reply_to: message.reply.as_ref().map(|s| s.to_string()),
        };
        let original = envelope.clone();

        match pipeline.process_message(envelope).await {
            Dispatch::Completed(Some(reply)) => {
                if let Err(err) = client
                    .publish(reply.reply_to.clone(), Bytes::from(reply.payload))
                    .await
                {
                    warn!(reply_to = %reply.reply_to, error = %err, "failed to publish reply");
                } else if flush_replies {
                    if let Err(err) = client.flush().await {
                        warn!(error = %err, "failed to flush reply");
                    }
                }
            }
            Dispatch::Completed(None) | Dispatch::Skipped => {}
            Dispatch::Failed(error) => {
                Self::dead_letter(&client, &dead_letter_subject, &original, error).await;
            }
        }
    }

    /// Side-channel dead-letter notification. There is no ack to protect
    /// here; a failure to publish the record is logged and the message is
    /// gone.
    async fn dead_letter(
        client: &Client,
        subject: &str,
        envelope: &InboundEnvelope,
        error: ErrorInfo,
    ) {
        warn!(route = %envelope.route, error = %error.message, "handler failed, dead-lettering");

        let record = DeadLetterRecord::from_envelope(envelope, error);
        let body = match Self::dead_letter_body(&record) {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "failed to encode dead-letter record");
                return;
            }
        };

        if let Err(err) = client.publish(subject.to_string(), Bytes::from(body)).await {
            warn!(subject, error = %err, "failed to publish dead-letter record");
        }
    }

    /// Dead-letter body for a subject broker. The protocol has no message
    /// properties, so the origin metadata (route, correlation id, reply
    /// destination) travels in the record itself.
    fn dead_letter_body(record: &DeadLetterRecord) -> BusResult<String> {
        serde_json::to_string(record)
            .map_err(|e| BusError::DeadLetter(format!("failed to encode record: {e}")))
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            supports_acknowledgment: false,
            native_rpc: true,
        }
    }

    async fn init(&mut self) -> BusResult<()> {
        let mut options = ConnectOptions::new().name(self.bus.module_name.clone());

        if let (Some(user), Some(password)) = (&self.config.user, &self.config.password) {
            options = options.user_and_password(user.clone(), password.clone());
        }
        if let Some(token) = &self.config.token {
            options = options.token(token.clone());
        }

        let client = options
            .connect(self.config.servers.join(","))
            .await
            .map_err(|e| BusError::Connection(format!("failed to connect: {e}")))?;

        info!(servers = ?self.config.servers, "connected to NATS");
        self.client = Some(client);
        Ok(())
    }

    async fn start(&mut self, pipeline: Arc<dyn Pipeline>) -> BusResult<()> {
        let client = self.client()?.clone();
        let patterns = pipeline
            .route_table()
            .subscription_patterns(WildcardStyle::Subject);
        let dead_letter_subject = self.bus.dead_letter_name();

        info!(?patterns, "subscribing");

        for pattern in patterns {
            let subscriber = client
                .subscribe(pattern.clone())
                .await
                .map_err(|e| BusError::Connection(format!("subscribe {pattern} failed: {e}")))?;

            debug!(pattern, "subscription established");

            self.consumers.push(tokio::spawn(Self::consume(
                client.clone(),
                pipeline.clone(),
                subscriber,
                dead_letter_subject.clone(),
                self.bus.flush_after_publish,
            )));
        }

        Ok(())
    }

    async fn stop(&mut self) -> BusResult<()> {
        if self.consumers.is_empty() {
            return Ok(());
        }

        if let Some(client) = &self.client {
            // ensure all published messages have left the client, then let
            // in-flight deliveries finish before subscriptions close
            if let Err(err) = client.flush().await {
                warn!(error = %err, "flush during stop failed");
            }
            if let Err(err) = client.drain().await {
                warn!(error = %err, "drain during stop failed");
            }
        }

        for consumer in self.consumers.drain(..) {
            consumer.abort();
        }

        info!("subject transport stopped");
        Ok(())
    }

    async fn dispose(&mut self) -> BusResult<()> {
        self.stop().await?;
        self.client = None;
        Ok(())
    }

    async fn send(&self, request: OutboundRequest) -> BusResult<Option<String>> {
        let client = self.client()?;

        if request.is_rpc {
            let timeout = request.timeout.unwrap_or_else(|| self.default_timeout());
            let nats_request = Request::new()
                .payload(Bytes::from(request.payload))
                .timeout(Some(timeout));

            let response = client
                .send_request(request.route, nats_request)
                .await
                .map_err(|err| match err.kind() {
                    async_nats::RequestErrorKind::TimedOut => BusError::Timeout(timeout),
                    _ => BusError::Publish(format!("request failed: {err}")),
                })?;

            let payload = String::from_utf8(response.payload.to_vec())
                .map_err(|e| BusError::Decode(format!("reply is not valid UTF-8: {e}")))?;
            return Ok(Some(payload));
        }

        client
            .publish(request.route, Bytes::from(request.payload))
            .await
            .map_err(|e| BusError::Publish(format!("publish failed: {e}")))?;

        self.flush_if_configured(client).await?;
        Ok(None)
    }

    async fn send_reply(&self, reply: ReplyMessage) -> BusResult<()> {
        let client = self.client()?;

        client
            .publish(reply.reply_to, Bytes::from(reply.payload))
            .await
            .map_err(|e| BusError::Publish(format!("reply publish failed: {e}")))?;

        self.flush_if_configured(client).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_body_carries_origin_metadata() {
        let envelope = InboundEnvelope {
            route: "orders.charge".to_string(),
            correlation_id: Some("c-7".to_string()),
            payload: r#"{"amount":10}"#.to_string(),
            reply_to: Some("caller-response-1".to_string()),
        };
        let record =
            DeadLetterRecord::from_envelope(&envelope, ErrorInfo::new("handler", "card declined"));

        let body = NatsTransport::dead_letter_body(&record).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();

        assert_eq!(value["route"], "orders.charge");
        assert_eq!(value["correlation_id"], "c-7");
        assert_eq!(value["reply_to"], "caller-response-1");
        assert_eq!(value["payload"]["amount"], 10);
        assert_eq!(value["error"]["kind"], "handler");
        assert_eq!(value["error"]["message"], "card declined");
    }

    #[test]
    fn capability_profile_is_subject_shaped() {
        let transport =
            NatsTransport::new(BusConfig::new("test"), NatsConfig::default()).unwrap();
        let caps = transport.capabilities();
        assert!(!caps.supports_acknowledgment);
        assert!(caps.native_rpc);
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(NatsTransport::new(BusConfig::new("test"), NatsConfig::new(vec![])).is_err());
    }

    #[tokio::test]
    async fn send_before_init_is_a_state_error() {
        let transport =
            NatsTransport::new(BusConfig::new("test"), NatsConfig::default()).unwrap();

        let result = transport
            .send(OutboundRequest {
                route: "r".to_string(),
                payload: "{}".to_string(),
                correlation_id: "c".to_string(),
                is_rpc: false,
                timeout: None,
            })
            .await;

        assert!(matches!(result, Err(BusError::State(_))));
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let mut transport =
            NatsTransport::new(BusConfig::new("test"), NatsConfig::default()).unwrap();
        transport.stop().await.unwrap();
        transport.dispose().await.unwrap();
    }
}
