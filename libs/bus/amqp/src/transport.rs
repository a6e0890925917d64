//! # Topic Adapter Transport
//!
//! One durable module queue bound once per computed pattern, plus an
//! exclusive per-instance response queue for correlated replies. Every
//! delivery on the module queue is acknowledged exactly once, after its
//! outcome is settled; failed handlers dead-letter the annotated record
//! first so the original message is never lost in limbo.

use async_trait::async_trait;
use bus_core::{
    BusConfig, BusError, BusResult, DeadLetterRecord, Dispatch, ErrorInfo, InboundEnvelope,
    OutboundRequest, Pipeline, ReplyMessage, Transport, TransportCapabilities, WildcardStyle,
};
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::AmqpConfig;

/// `Transport` implementation for topic-exchange brokers.
pub struct AmqpTransport {
    bus: BusConfig,
    config: AmqpConfig,
    /// Exclusive reply queue, unique per transport instance
    response_queue: String,
    connection: Option<Connection>,
    channel: Option<Channel>,
    consumer_tags: Vec<String>,
    consumers: Vec<JoinHandle<()>>,
}

impl AmqpTransport {
    pub fn new(bus: BusConfig, config: AmqpConfig) -> BusResult<Self> {
        bus.validate()?;
        config.validate()?;

        let instance_id = uuid::Uuid::new_v4().simple().to_string();
        let response_queue = bus.response_destination(&instance_id);

        Ok(Self {
            bus,
            config,
            response_queue,
            connection: None,
            channel: None,
            consumer_tags: Vec::new(),
            consumers: Vec::new(),
        })
    }

    /// Reply queue name replies for this instance are addressed to.
    pub fn response_queue(&self) -> &str {
        &self.response_queue
    }

    /// Response queue declaration: exclusive to this connection, except in
    /// test mode where exclusivity is relaxed so repeated runs can redeclare.
    fn response_queue_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            exclusive: !self.bus.test_mode,
            auto_delete: true,
            ..Default::default()
        }
    }

    fn channel(&self) -> BusResult<&Channel> {
        self.channel
            .as_ref()
            .ok_or_else(|| BusError::State("transport is not initialized".to_string()))
    }

    /// Publish and, when confirms are selected, wait for the broker ack.
    async fn publish(
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> BusResult<()> {
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("publish to {routing_key} failed: {e}")))?
            .await
            .map_err(|e| BusError::Publish(format!("confirm for {routing_key} failed: {e}")))?;
        Ok(())
    }

    /// Consumption loop for the module queue. Each delivery is dispatched as
    /// its own task so slow handlers never stall the consumer.
    async fn consume_main(
        channel: Channel,
        pipeline: Arc<dyn Pipeline>,
        mut consumer: Consumer,
        dead_letter_queue: String,
    ) {
        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    let channel = channel.clone();
                    let pipeline = pipeline.clone();
                    let dead_letter_queue = dead_letter_queue.clone();

                    tokio::spawn(async move {
                        Self::dispatch(channel, pipeline, delivery, dead_letter_queue).await;
                    });
                }
                Err(err) => {
                    warn!(error = %err, "module queue consumer error");
                }
            }
        }
    }

    /// Settle one delivery, then ack it exactly once.
    async fn dispatch(
        channel: Channel,
        pipeline: Arc<dyn Pipeline>,
        delivery: Delivery,
        dead_letter_queue: String,
    ) {
        Self::settle(&channel, &pipeline, &delivery, &dead_letter_queue).await;

        if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
            warn!(error = %err, "failed to ack delivery");
        }
    }

    async fn settle(
        channel: &Channel,
        pipeline: &Arc<dyn Pipeline>,
        delivery: &Delivery,
        dead_letter_queue: &str,
    ) {
        // empty payloads are acked and dropped, never retried
        if delivery.data.is_empty() {
            debug!("acking empty payload");
            return;
        }

        let payload = match String::from_utf8(delivery.data.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "skipping undecodable payload");
                return;
            }
        };

        let envelope = InboundEnvelope {
            route: delivery.routing_key.as_str().to_string(),
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|s| s.as_str().to_string()),
            payload,
            reply_to: delivery
                .properties
                .reply_to()
                .as_ref()
                .map(|s| s.as_str().to_string()),
        };
        let original = envelope.clone();

        match pipeline.process_message(envelope).await {
            Dispatch::Completed(Some(reply)) => {
                let mut properties = BasicProperties::default();
                if let Some(correlation_id) = &reply.correlation_id {
                    properties = properties.with_correlation_id(correlation_id.as_str().into());
                }

                // replies go through the default exchange straight to the
                // requester's response queue
                if let Err(err) = Self::publish(
                    channel,
                    "",
                    &reply.reply_to,
                    reply.payload.as_bytes(),
                    properties,
                )
                .await
                {
                    warn!(reply_to = %reply.reply_to, error = %err, "failed to publish reply");
                }
            }
            Dispatch::Completed(None) | Dispatch::Skipped => {}
            Dispatch::Failed(error) => {
                Self::dead_letter(channel, dead_letter_queue, &original, error).await;
            }
        }
    }

    /// Re-publish the failed message, annotated with the handler error, to
    /// the dead-letter queue. The original delivery is acked afterwards
    /// either way; losing the record is logged, not fatal.
    async fn dead_letter(
        channel: &Channel,
        queue: &str,
        envelope: &InboundEnvelope,
        error: ErrorInfo,
    ) {
        warn!(route = %envelope.route, error = %error.message, "handler failed, dead-lettering");

        let (body, properties) = Self::dead_letter_message(envelope, error);
        if let Err(err) = Self::publish(channel, "", queue, body.as_bytes(), properties).await {
            warn!(queue, error = %err, "failed to publish dead-letter record");
        }
    }

    /// Dead-letter body and properties. The body is the original payload
    /// annotated with the handler error; the origin metadata (correlation
    /// id, reply destination, and the original route as a header) rides in
    /// the message properties so operators can replay or inspect by origin.
    fn dead_letter_message(envelope: &InboundEnvelope, error: ErrorInfo) -> (String, BasicProperties) {
        let record = DeadLetterRecord::from_envelope(envelope, error);

        let mut headers = FieldTable::default();
        headers.insert(
            "route".into(),
            AMQPValue::LongString(record.route.as_str().into()),
        );

        let mut properties = BasicProperties::default().with_headers(headers);
        if let Some(correlation_id) = &record.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }
        if let Some(reply_to) = &record.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }

        (record.annotated_payload().to_string(), properties)
    }

    /// Consumption loop for the response queue: resolve correlated replies,
    /// ack everything.
    async fn consume_responses(
        pipeline: Arc<dyn Pipeline>,
        mut consumer: Consumer,
        response_queue: String,
    ) {
        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(err) => {
                    warn!(error = %err, "response queue consumer error");
                    continue;
                }
            };

            match (
                delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|s| s.as_str().to_string()),
                String::from_utf8(delivery.data.clone()),
            ) {
                (Some(correlation_id), Ok(payload)) => {
                    pipeline.process_response_message(&correlation_id, payload, &response_queue);
                }
                (None, _) => {
                    warn!("reply without correlation id dropped");
                }
                (_, Err(err)) => {
                    warn!(error = %err, "undecodable reply dropped");
                }
            }

            if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                warn!(error = %err, "failed to ack reply");
            }
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            supports_acknowledgment: true,
            native_rpc: false,
        }
    }

    async fn init(&mut self) -> BusResult<()> {
        let connection = Connection::connect(
            &self.config.connection_string,
            ConnectionProperties::default(),
        )
        .await
        .map_err(|e| BusError::Connection(format!("failed to connect: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("failed to open channel: {e}")))?;

        if self.bus.flush_after_publish {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| BusError::Connection(format!("confirm_select failed: {e}")))?;
        }

        // test_mode relaxes durability so repeated runs leave nothing behind
        let durable = !self.bus.test_mode;
        let auto_delete = self.bus.test_mode;

        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable,
                    auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("exchange declare failed: {e}")))?;

        channel
            .queue_declare(
                &self.bus.module_name,
                QueueDeclareOptions {
                    durable,
                    auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("queue declare failed: {e}")))?;

        channel
            .queue_declare(
                &self.response_queue,
                self.response_queue_options(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("response queue declare failed: {e}")))?;

        channel
            .queue_declare(
                &self.bus.dead_letter_name(),
                QueueDeclareOptions {
                    durable,
                    auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("dead-letter queue declare failed: {e}")))?;

        info!(
            exchange = %self.config.exchange,
            queue = %self.bus.module_name,
            response_queue = %self.response_queue,
            "connected to AMQP broker"
        );

        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    async fn start(&mut self, pipeline: Arc<dyn Pipeline>) -> BusResult<()> {
        let channel = self.channel()?.clone();
        let patterns = pipeline
            .route_table()
            .subscription_patterns(WildcardStyle::Topic);

        info!(?patterns, "binding module queue");

        for pattern in &patterns {
            channel
                .queue_bind(
                    &self.bus.module_name,
                    &self.config.exchange,
                    pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Connection(format!("bind {pattern} failed: {e}")))?;
        }

        let main_tag = format!("{}-main", self.bus.module_name);
        let main_consumer = channel
            .basic_consume(
                &self.bus.module_name,
                &main_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("consume failed: {e}")))?;
        self.consumer_tags.push(main_tag);

        self.consumers.push(tokio::spawn(Self::consume_main(
            channel.clone(),
            pipeline.clone(),
            main_consumer,
            self.bus.dead_letter_name(),
        )));

        let response_tag = format!("{}-consumer", self.response_queue);
        let response_consumer = channel
            .basic_consume(
                &self.response_queue,
                &response_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("response consume failed: {e}")))?;
        self.consumer_tags.push(response_tag);

        self.consumers.push(tokio::spawn(Self::consume_responses(
            pipeline,
            response_consumer,
            self.response_queue.clone(),
        )));

        Ok(())
    }

    async fn stop(&mut self) -> BusResult<()> {
        if self.consumer_tags.is_empty() {
            return Ok(());
        }

        if let Some(channel) = &self.channel {
            for tag in &self.consumer_tags {
                if let Err(err) = channel
                    .basic_cancel(tag, BasicCancelOptions::default())
                    .await
                {
                    warn!(tag, error = %err, "cancel during stop failed");
                }
            }
        }

        for consumer in self.consumers.drain(..) {
            consumer.abort();
        }
        self.consumer_tags.clear();

        info!("topic transport stopped");
        Ok(())
    }

    async fn dispose(&mut self) -> BusResult<()> {
        self.stop().await?;

        if let Some(channel) = self.channel.take() {
            if let Err(err) = channel.close(200, "closing").await {
                warn!(error = %err, "channel close failed");
            }
        }
        if let Some(connection) = self.connection.take() {
            if let Err(err) = connection.close(200, "closing").await {
                warn!(error = %err, "connection close failed");
            }
        }

        Ok(())
    }

    async fn send(&self, request: OutboundRequest) -> BusResult<Option<String>> {
        let channel = self.channel()?;

        let mut properties = BasicProperties::default();
        if request.is_rpc {
            // the reply comes back through the correlation table, addressed
            // to this instance's response queue
            properties = properties
                .with_reply_to(self.response_queue.as_str().into())
                .with_correlation_id(request.correlation_id.as_str().into());
        }

        Self::publish(
            channel,
            &self.config.exchange,
            &request.route,
            request.payload.as_bytes(),
            properties,
        )
        .await?;

        Ok(None)
    }

    async fn send_reply(&self, reply: ReplyMessage) -> BusResult<()> {
        let channel = self.channel()?;

        let mut properties = BasicProperties::default();
        if let Some(correlation_id) = &reply.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }

        Self::publish(
            channel,
            "",
            &reply.reply_to,
            reply.payload.as_bytes(),
            properties,
        )
        .await
    }
}
