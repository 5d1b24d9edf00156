use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::connection::Connection;
use crate::core::error::{ClientError, Result};
use crate::core::message::{Message, MessageId};
use crate::core::subscription::SubscriptionType;
use crate::core::topic::TopicName;
use crate::net::frame::{
    AckPayload, FlowPayload, FrameType, IdPayload, MessagePayload, SubscribePayload,
};

/// Shortest ack timeout accepted by `ConsumerOptions`.
pub const MIN_ACK_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RECEIVER_QUEUE_SIZE: u32 = 1000;

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub topic: String,
    pub subscription_name: String,
    pub subscription_type: SubscriptionType,
    /// Redeliver messages left unacknowledged this long. `None` disables it.
    pub ack_timeout: Option<Duration>,
    /// A random name is generated when unset.
    pub consumer_name: Option<String>,
    /// How many messages the broker may push ahead of `receive`.
    pub receiver_queue_size: u32,
}

impl ConsumerOptions {
    pub fn new(topic: impl Into<String>, subscription_name: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription_name: subscription_name.into(),
            subscription_type: SubscriptionType::default(),
            ack_timeout: None,
            consumer_name: None,
            receiver_queue_size: DEFAULT_RECEIVER_QUEUE_SIZE,
        }
    }

    pub fn subscription_type(mut self, subscription_type: SubscriptionType) -> Self {
        self.subscription_type = subscription_type;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    pub fn consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }

    pub fn receiver_queue_size(mut self, size: u32) -> Self {
        self.receiver_queue_size = size;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.subscription_name.is_empty() {
            return Err(ClientError::InvalidOption(
                "subscription name must not be empty".into(),
            ));
        }
        if self.receiver_queue_size == 0 {
            return Err(ClientError::InvalidOption(
                "receiver queue size must be at least 1".into(),
            ));
        }
        if let Some(timeout) = self.ack_timeout {
            if timeout < MIN_ACK_TIMEOUT {
                return Err(ClientError::InvalidOption(format!(
                    "ack timeout {timeout:?} is below the minimum of {MIN_ACK_TIMEOUT:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Receives from exactly one subscription for its whole lifetime.
#[derive(Debug)]
pub struct Consumer {
    id: u64,
    topic: TopicName,
    subscription: String,
    name: String,
    connection: Arc<Connection>,
    queue: flume::Receiver<MessagePayload>,
    receiver_queue_size: u32,
    /// Messages handed to the application since the last permit grant.
    consumed_since_flow: AtomicU32,
    closed: AtomicBool,
}

impl Consumer {
    pub(crate) async fn create(
        connection: Arc<Connection>,
        id: u64,
        options: ConsumerOptions,
    ) -> Result<Self> {
        let fail = |e: ClientError| {
            ClientError::subscribe(&options.topic, &options.subscription_name, e)
        };

        options.validate().map_err(fail)?;
        let topic = TopicName::parse(&options.topic).map_err(|e| fail(e.into()))?;
        let name = options
            .consumer_name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..10].to_string());

        // Register the queue before subscribing: the broker may push as soon as permits arrive.
        // Permits never exceed the queue size, so the broker cannot overfill it.
        let (tx, rx) = flume::bounded(options.receiver_queue_size as usize);
        connection.register_consumer(id, tx);

        let payload = SubscribePayload {
            consumer_id: id,
            topic: topic.to_string(),
            subscription: options.subscription_name.clone(),
            sub_type: options.subscription_type.into(),
            consumer_name: name.clone(),
            ack_timeout_ms: options
                .ack_timeout
                .map(|t| t.as_millis() as u64)
                .unwrap_or(0),
        }
        .encode()
        .map_err(|e| fail(e.into()))?;

        let subscribed = match connection.request(FrameType::Subscribe, payload).await {
            Ok(frame) if frame.msg_type == FrameType::Success => Ok(()),
            Ok(frame) => Err(ClientError::UnexpectedResponse(format!(
                "{:?} in reply to SUBSCRIBE",
                frame.msg_type
            ))),
            Err(e) => Err(e),
        };
        if let Err(e) = subscribed {
            connection.unregister_consumer(id);
            return Err(fail(e));
        }

        let consumer = Self {
            id,
            topic,
            subscription: options.subscription_name,
            name,
            connection,
            queue: rx,
            receiver_queue_size: options.receiver_queue_size,
            consumed_since_flow: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        };
        consumer
            .grant_permits(consumer.receiver_queue_size)
            .map_err(|e| ClientError::subscribe(consumer.topic.as_str(), &consumer.subscription, e))?;

        info!(
            topic = %consumer.topic,
            subscription = %consumer.subscription,
            consumer = %consumer.name,
            subscription_type = %options.subscription_type,
            "consumer subscribed"
        );
        Ok(consumer)
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next message. Fails with a `Receive` error wrapping
    /// `Cancelled` once `cancel` fires, or `Disconnected` if the connection
    /// goes away.
    pub async fn receive(&self, cancel: &CancellationToken) -> Result<Message> {
        self.receive_inner(cancel)
            .await
            .map_err(|e| ClientError::receive(&self.subscription, e))
    }

    async fn receive_inner(&self, cancel: &CancellationToken) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ConsumerClosed);
        }

        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            next = self.queue.recv_async() => next.map_err(|_| {
                if self.closed.load(Ordering::Acquire) {
                    ClientError::ConsumerClosed
                } else {
                    ClientError::Disconnected
                }
            })?,
        };

        self.message_consumed()?;
        Ok(self.to_message(payload))
    }

    /// Acknowledges a message so that it is never redelivered.
    pub async fn ack(&self, message: &Message) -> Result<()> {
        self.ack_id(message.id).await
    }

    pub async fn ack_id(&self, message_id: MessageId) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ConsumerClosed);
        }
        let payload = AckPayload {
            consumer_id: self.id,
            message_id: message_id.value(),
        }
        .encode();
        self.connection
            .send_oneway(FrameType::Ack, payload)
            .map_err(|e| ClientError::ack(message_id.value(), e))?;
        debug!(consumer = %self.name, message_id = %message_id, "acked");
        Ok(())
    }

    /// Asks the broker to redeliver every message this consumer has not acked.
    pub async fn redeliver_unacknowledged(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ConsumerClosed);
        }
        let payload = IdPayload { id: self.id }.encode();
        self.connection
            .send_oneway(FrameType::RedeliverUnacknowledged, payload)
    }

    /// Detaches from the subscription. Unacked messages go back to the
    /// subscription for the remaining consumers.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.connection.unregister_consumer(self.id);
        let payload = IdPayload { id: self.id }.encode();
        self.connection
            .request(FrameType::CloseConsumer, payload)
            .await?;
        info!(consumer = %self.name, subscription = %self.subscription, "consumer closed");
        Ok(())
    }

    /// Deletes the subscription on the broker, discarding its backlog. Fails
    /// with a 409 broker error while other consumers are attached; the
    /// consumer stays usable in that case.
    pub async fn unsubscribe(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ConsumerClosed);
        }
        let payload = IdPayload { id: self.id }.encode();
        self.connection
            .request(FrameType::Unsubscribe, payload)
            .await?;
        self.closed.store(true, Ordering::Release);
        self.connection.unregister_consumer(self.id);
        info!(consumer = %self.name, subscription = %self.subscription, "unsubscribed");
        Ok(())
    }

    fn grant_permits(&self, permits: u32) -> Result<()> {
        let payload = FlowPayload {
            consumer_id: self.id,
            permits,
        }
        .encode();
        self.connection.send_oneway(FrameType::Flow, payload)
    }

    /// Re-grants permits once half the receiver queue has been drained.
    fn message_consumed(&self) -> Result<()> {
        let threshold = (self.receiver_queue_size / 2).max(1);
        let consumed = self.consumed_since_flow.fetch_add(1, Ordering::AcqRel) + 1;
        if consumed >= threshold {
            let grant = self.consumed_since_flow.swap(0, Ordering::AcqRel);
            if grant > 0 {
                self.grant_permits(grant)?;
            }
        }
        Ok(())
    }

    fn to_message(&self, payload: MessagePayload) -> Message {
        Message {
            id: MessageId::from_raw(payload.message_id),
            topic: self.topic.to_string(),
            payload: payload.message,
            key: payload.metadata.key,
            properties: payload.metadata.properties,
            publish_time: payload.publish_time,
            event_time: payload.metadata.event_time,
            redelivery_count: payload.redelivery_count,
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.connection.unregister_consumer(self.id);
            let payload = IdPayload { id: self.id }.encode();
            let _ = self
                .connection
                .send_oneway(FrameType::CloseConsumer, payload);
        }
    }
}
