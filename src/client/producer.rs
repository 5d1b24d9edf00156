use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::client::connection::Connection;
use crate::core::error::{ClientError, Result};
use crate::core::message::{MessageId, ProducerMessage};
use crate::core::topic::TopicName;
use crate::net::frame::{
    FrameEncodeError, FrameType, IdPayload, MessageMetadata, ProducerPayload,
    ProducerSuccessPayload, SendPayload, SendReceiptPayload,
};

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub topic: String,
    /// Broker assigns a unique name when unset.
    pub name: Option<String>,
    /// Defaults to the client's operation timeout.
    pub send_timeout: Option<Duration>,
}

impl ProducerOptions {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            name: None,
            send_timeout: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }
}

impl From<&str> for ProducerOptions {
    fn from(topic: &str) -> Self {
        ProducerOptions::new(topic)
    }
}

impl From<String> for ProducerOptions {
    fn from(topic: String) -> Self {
        ProducerOptions::new(topic)
    }
}

/// Broker acknowledgement of one sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub sequence_id: u64,
    pub message_id: MessageId,
}

/// Publishes to exactly one topic for its whole lifetime.
#[derive(Debug)]
pub struct Producer {
    id: u64,
    topic: TopicName,
    name: String,
    connection: Arc<Connection>,
    next_sequence_id: AtomicU64,
    send_timeout: Duration,
    closed: AtomicBool,
}

impl Producer {
    pub(crate) async fn create(
        connection: Arc<Connection>,
        id: u64,
        options: ProducerOptions,
    ) -> Result<Self> {
        let topic = TopicName::parse(&options.topic)
            .map_err(|e| ClientError::create_producer(&options.topic, e.into()))?;

        let success = register(&connection, id, &topic, options.name.clone())
            .await
            .map_err(|e| ClientError::create_producer(topic.as_str(), e))?;

        info!(
            topic = %topic,
            producer = %success.producer_name,
            producer_id = id,
            "producer created"
        );

        let send_timeout = options
            .send_timeout
            .unwrap_or_else(|| connection.operation_timeout());

        Ok(Self {
            id,
            topic,
            name: success.producer_name,
            connection,
            next_sequence_id: AtomicU64::new(0),
            send_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    /// Name the broker registered this producer under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends one message and waits until the broker has accepted it.
    pub async fn send(&self, message: ProducerMessage) -> Result<SendReceipt> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ProducerClosed);
        }

        let sequence_id = self.next_sequence_id.fetch_add(1, Ordering::Relaxed);
        self.send_inner(sequence_id, message)
            .await
            .map_err(|e| ClientError::send(sequence_id, e))
    }

    async fn send_inner(&self, sequence_id: u64, message: ProducerMessage) -> Result<SendReceipt> {
        let payload = SendPayload {
            producer_id: self.id,
            sequence_id,
            metadata: MessageMetadata {
                key: message.key,
                properties: message.properties,
                event_time: message.event_time,
            },
            message: message.payload,
        }
        .encode()?;
        if payload.len() > self.connection.max_message_size() as usize {
            return Err(FrameEncodeError::PayloadTooLarge(payload.len()).into());
        }

        let response = self
            .connection
            .request_with_timeout(FrameType::Send, payload, self.send_timeout)
            .await?;
        if response.msg_type != FrameType::SendReceipt {
            return Err(ClientError::UnexpectedResponse(format!(
                "{:?} in reply to SEND",
                response.msg_type
            )));
        }

        let receipt = SendReceiptPayload::decode(&response.payload)?;
        if receipt.producer_id != self.id || receipt.sequence_id != sequence_id {
            return Err(ClientError::UnexpectedResponse(format!(
                "receipt for producer {} sequence {}",
                receipt.producer_id, receipt.sequence_id
            )));
        }

        debug!(
            producer = %self.name,
            sequence_id,
            message_id = receipt.message_id,
            "message sent"
        );

        Ok(SendReceipt {
            sequence_id,
            message_id: MessageId::from_raw(receipt.message_id),
        })
    }

    /// Detaches the producer from the broker. Later sends fail with `ProducerClosed`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let payload = IdPayload { id: self.id }.encode();
        self.connection
            .request(FrameType::CloseProducer, payload)
            .await?;
        info!(producer = %self.name, "producer closed");
        Ok(())
    }
}

async fn register(
    connection: &Connection,
    id: u64,
    topic: &TopicName,
    name: Option<String>,
) -> Result<ProducerSuccessPayload> {
    let payload = ProducerPayload {
        producer_id: id,
        topic: topic.to_string(),
        producer_name: name,
    }
    .encode()?;

    let response = connection.request(FrameType::Producer, payload).await?;
    if response.msg_type != FrameType::ProducerSuccess {
        return Err(ClientError::UnexpectedResponse(format!(
            "{:?} in reply to PRODUCER",
            response.msg_type
        )));
    }
    Ok(ProducerSuccessPayload::decode(&response.payload)?)
}

impl Drop for Producer {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let payload = IdPayload { id: self.id }.encode();
            let _ = self
                .connection
                .send_oneway(FrameType::CloseProducer, payload);
        }
    }
}
