use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::broker::auth::TokenValidator;
use crate::broker::subscription::{ConsumerKey, Outbound, Subscription, UnsubscribeError};
use crate::broker::topic::Topic;
use crate::broker::{Broker, BrokerError};
use crate::client::MIN_ACK_TIMEOUT;
use crate::core::subscription::SubscriptionType;
use crate::core::topic::TopicName;
use crate::net::frame::{
    self, code, AckPayload, ConnectPayload, ConnectedPayload, FlowPayload, Frame, FrameType,
    IdPayload, ProducerPayload, ProducerSuccessPayload, SendPayload, SendReceiptPayload,
    SubscribePayload, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};

const INITIAL_BUFFER_SIZE: usize = 8 * 1024;
const SERVER_VERSION: &str = concat!("relaymq-broker-", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
struct ProducerState {
    topic: Arc<Topic>,
    name: String,
}

#[derive(Debug)]
struct ConsumerState {
    topic: Arc<Topic>,
    subscription: Arc<Subscription>,
}

/// Broker side of one client connection.
pub(crate) struct Connection {
    id: u64,
    peer: SocketAddr,
    broker: Arc<Broker>,
    validator: Arc<dyn TokenValidator>,
    outbound: Outbound,
    connected: bool,
    producers: HashMap<u64, ProducerState>,
    consumers: HashMap<u64, ConsumerState>,
}

impl Connection {
    /// Serves one client until it disconnects, sends undecodable framing,
    /// or the broker shuts down.
    pub(crate) async fn run(
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        broker: Arc<Broker>,
        validator: Arc<dyn TokenValidator>,
        shutdown: watch::Receiver<bool>,
    ) {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, rx));

        let mut conn = Connection {
            id,
            peer,
            broker,
            validator,
            outbound: tx,
            connected: false,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        };

        if let Err(err) = conn.read_loop(reader, shutdown).await {
            warn!("connection {} error: {}", id, err);
        }
        conn.release();
        // Dropping the last outbound sender lets the writer drain and stop.
        drop(conn);

        match writer_task.await {
            Ok(Err(err)) => debug!("connection {} writer error: {}", id, err),
            Err(err) => warn!("connection {} writer task failed: {}", id, err),
            Ok(Ok(())) => {}
        }
        trace!("connection {} closed", id);
    }

    async fn read_loop(
        &mut self,
        mut reader: OwnedReadHalf,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
        loop {
            tokio::select! {
                read = reader.read_buf(&mut buf) => {
                    if read? == 0 {
                        return Ok(());
                    }
                    while let Some(frame) = frame::try_decode_frame(&mut buf)? {
                        self.process_frame(frame);
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// Detaches every consumer so their unacked messages go to the others.
    fn release(&mut self) {
        for (consumer_id, consumer) in self.consumers.drain() {
            consumer.subscription.detach(ConsumerKey {
                conn_id: self.id,
                consumer_id,
            });
        }
        self.producers.clear();
    }

    fn reply(&self, frame: Frame) {
        if self.outbound.send(frame).is_err() {
            debug!("connection {} writer gone; dropping reply", self.id);
        }
    }

    fn error(&self, correlation_id: u64, code: u16, message: impl Into<String>) {
        let message = message.into();
        debug!(code, %message, "request refused");
        self.reply(Frame::error(correlation_id, code, message));
    }

    /// Close frames sent on drop carry correlation id 0 and expect no answer.
    fn ack_close(&self, correlation_id: u64) {
        if correlation_id != 0 {
            self.reply(Frame::empty(FrameType::Success, correlation_id));
        }
    }

    fn consumer_key(&self, consumer_id: u64) -> ConsumerKey {
        ConsumerKey {
            conn_id: self.id,
            consumer_id,
        }
    }

    fn process_frame(&mut self, frame: Frame) {
        let corr = frame.correlation_id;
        match frame.msg_type {
            FrameType::Connect => self.handle_connect(frame),
            FrameType::Ping => self.reply(Frame::empty(FrameType::Pong, corr)),
            FrameType::Pong => trace!("pong"),
            _ if !self.connected => self.error(corr, code::UNAUTHENTICATED, "CONNECT required"),
            FrameType::Producer => self.handle_producer(frame),
            FrameType::Send => self.handle_send(frame),
            FrameType::Subscribe => self.handle_subscribe(frame),
            FrameType::Flow => self.handle_flow(frame),
            FrameType::Ack => self.handle_ack(frame),
            FrameType::RedeliverUnacknowledged => self.handle_redeliver(frame),
            FrameType::CloseProducer => self.handle_close_producer(frame),
            FrameType::CloseConsumer => self.handle_close_consumer(frame),
            FrameType::Unsubscribe => self.handle_unsubscribe(frame),
            other => self.error(corr, code::BAD_REQUEST, format!("unexpected {other:?} frame")),
        }
    }

    fn handle_connect(&mut self, frame: Frame) {
        let corr = frame.correlation_id;
        if self.connected {
            return self.error(corr, code::BAD_REQUEST, "CONNECT already performed");
        }
        let payload = match ConnectPayload::decode(&frame.payload) {
            Ok(p) => p,
            Err(_) => return self.error(corr, code::BAD_REQUEST, "invalid CONNECT payload"),
        };
        if payload.protocol_version != PROTOCOL_VERSION {
            return self.error(
                corr,
                code::UNSUPPORTED_VERSION,
                format!("unsupported protocol version {}", payload.protocol_version),
            );
        }
        if !self.validator.validate(payload.auth_token.as_deref()) {
            return self.error(corr, code::UNAUTHENTICATED, "invalid auth token");
        }

        let connected = ConnectedPayload {
            protocol_version: PROTOCOL_VERSION,
            server_version: SERVER_VERSION.to_string(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
        .encode();
        match connected {
            Ok(bytes) => {
                self.connected = true;
                info!(client_version = %payload.client_version, peer = %self.peer, "client connected");
                self.reply(Frame::new(FrameType::Connected, corr, bytes));
            }
            Err(err) => self.error(corr, code::INTERNAL, err.to_string()),
        }
    }

    fn handle_producer(&mut self, frame: Frame) {
        let corr = frame.correlation_id;
        let payload = match ProducerPayload::decode(&frame.payload) {
            Ok(p) => p,
            Err(_) => return self.error(corr, code::BAD_REQUEST, "invalid PRODUCER payload"),
        };
        let topic_name = match TopicName::parse(&payload.topic) {
            Ok(t) => t,
            Err(err) => return self.error(corr, code::BAD_REQUEST, err.to_string()),
        };
        if self.producers.contains_key(&payload.producer_id) {
            return self.error(
                corr,
                code::BAD_REQUEST,
                format!("producer id {} already in use", payload.producer_id),
            );
        }

        let topic = self.broker.topic(&topic_name);
        let name = payload
            .producer_name
            .unwrap_or_else(|| topic.next_producer_name());

        match (ProducerSuccessPayload {
            producer_name: name.clone(),
        })
        .encode()
        {
            Ok(bytes) => {
                info!(topic = %topic_name, producer = %name, "producer registered");
                self.producers
                    .insert(payload.producer_id, ProducerState { topic, name });
                self.reply(Frame::new(FrameType::ProducerSuccess, corr, bytes));
            }
            Err(err) => self.error(corr, code::INTERNAL, err.to_string()),
        }
    }

    fn handle_send(&mut self, frame: Frame) {
        let corr = frame.correlation_id;
        if frame.payload.len() > MAX_MESSAGE_SIZE as usize {
            return self.error(
                corr,
                code::BAD_REQUEST,
                format!(
                    "message of {} bytes exceeds the {} byte limit",
                    frame.payload.len(),
                    MAX_MESSAGE_SIZE
                ),
            );
        }
        let payload = match SendPayload::decode(&frame.payload) {
            Ok(p) => p,
            Err(_) => return self.error(corr, code::BAD_REQUEST, "invalid SEND payload"),
        };
        let Some(producer) = self.producers.get(&payload.producer_id) else {
            return self.error(
                corr,
                code::NOT_FOUND,
                format!("unknown producer {}", payload.producer_id),
            );
        };

        let message_id = producer.topic.publish(payload.metadata, payload.message);
        trace!(producer = %producer.name, sequence_id = payload.sequence_id, message_id, "send");

        let receipt = SendReceiptPayload {
            producer_id: payload.producer_id,
            sequence_id: payload.sequence_id,
            message_id,
        }
        .encode();
        self.reply(Frame::new(FrameType::SendReceipt, corr, receipt));
    }

    fn handle_subscribe(&mut self, frame: Frame) {
        let corr = frame.correlation_id;
        let payload = match SubscribePayload::decode(&frame.payload) {
            Ok(p) => p,
            Err(_) => return self.error(corr, code::BAD_REQUEST, "invalid SUBSCRIBE payload"),
        };
        let topic_name = match TopicName::parse(&payload.topic) {
            Ok(t) => t,
            Err(err) => return self.error(corr, code::BAD_REQUEST, err.to_string()),
        };
        let Ok(sub_type) = SubscriptionType::try_from(payload.sub_type) else {
            return self.error(
                corr,
                code::BAD_REQUEST,
                format!("unknown subscription type {}", payload.sub_type),
            );
        };
        if payload.subscription.is_empty() {
            return self.error(corr, code::BAD_REQUEST, "empty subscription name");
        }
        let ack_timeout = match payload.ack_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        if ack_timeout.is_some_and(|t| t < MIN_ACK_TIMEOUT) {
            return self.error(corr, code::BAD_REQUEST, "ack timeout below minimum");
        }
        if self.consumers.contains_key(&payload.consumer_id) {
            return self.error(
                corr,
                code::BAD_REQUEST,
                format!("consumer id {} already in use", payload.consumer_id),
            );
        }

        let topic = self.broker.topic(&topic_name);
        let attached = topic.subscribe(
            &payload.subscription,
            sub_type,
            self.consumer_key(payload.consumer_id),
            payload.consumer_name.clone(),
            ack_timeout,
            self.outbound.clone(),
        );
        match attached {
            Ok(subscription) => {
                info!(
                    topic = %topic_name,
                    subscription = %payload.subscription,
                    consumer = %payload.consumer_name,
                    %sub_type,
                    "consumer subscribed"
                );
                self.consumers.insert(
                    payload.consumer_id,
                    ConsumerState {
                        topic,
                        subscription,
                    },
                );
                self.reply(Frame::empty(FrameType::Success, corr));
            }
            Err(err) => self.error(corr, code::CONFLICT, err.to_string()),
        }
    }

    fn handle_flow(&mut self, frame: Frame) {
        let Ok(payload) = FlowPayload::decode(&frame.payload) else {
            return self.error(frame.correlation_id, code::BAD_REQUEST, "invalid FLOW payload");
        };
        match self.consumers.get(&payload.consumer_id) {
            Some(consumer) => {
                consumer
                    .subscription
                    .flow(self.consumer_key(payload.consumer_id), payload.permits);
            }
            None => debug!(consumer_id = payload.consumer_id, "flow for unknown consumer"),
        }
    }

    fn handle_ack(&mut self, frame: Frame) {
        let Ok(payload) = AckPayload::decode(&frame.payload) else {
            return self.error(frame.correlation_id, code::BAD_REQUEST, "invalid ACK payload");
        };
        let acked = self
            .consumers
            .get(&payload.consumer_id)
            .is_some_and(|consumer| {
                consumer
                    .subscription
                    .ack(self.consumer_key(payload.consumer_id), payload.message_id)
            });
        if !acked {
            debug!(
                consumer_id = payload.consumer_id,
                message_id = payload.message_id,
                "ack for unknown delivery"
            );
        }
    }

    fn handle_redeliver(&mut self, frame: Frame) {
        let Ok(payload) = IdPayload::decode(&frame.payload) else {
            return self.error(frame.correlation_id, code::BAD_REQUEST, "invalid REDELIVER payload");
        };
        if let Some(consumer) = self.consumers.get(&payload.id) {
            let requeued = consumer
                .subscription
                .redeliver_unacknowledged(self.consumer_key(payload.id));
            debug!(consumer_id = payload.id, requeued, "redeliver unacknowledged");
        }
    }

    fn handle_close_producer(&mut self, frame: Frame) {
        let corr = frame.correlation_id;
        let Ok(payload) = IdPayload::decode(&frame.payload) else {
            return self.error(corr, code::BAD_REQUEST, "invalid CLOSE_PRODUCER payload");
        };
        match self.producers.remove(&payload.id) {
            Some(producer) => {
                debug!(producer = %producer.name, "producer closed");
                self.ack_close(corr);
            }
            None => self.error(corr, code::NOT_FOUND, format!("unknown producer {}", payload.id)),
        }
    }

    fn handle_close_consumer(&mut self, frame: Frame) {
        let corr = frame.correlation_id;
        let Ok(payload) = IdPayload::decode(&frame.payload) else {
            return self.error(corr, code::BAD_REQUEST, "invalid CLOSE_CONSUMER payload");
        };
        match self.consumers.remove(&payload.id) {
            Some(consumer) => {
                consumer.subscription.detach(self.consumer_key(payload.id));
                debug!(subscription = %consumer.subscription.name(), consumer_id = payload.id, "consumer closed");
                self.ack_close(corr);
            }
            None => self.error(corr, code::NOT_FOUND, format!("unknown consumer {}", payload.id)),
        }
    }

    fn handle_unsubscribe(&mut self, frame: Frame) {
        let corr = frame.correlation_id;
        let Ok(payload) = IdPayload::decode(&frame.payload) else {
            return self.error(corr, code::BAD_REQUEST, "invalid UNSUBSCRIBE payload");
        };
        let Some(consumer) = self.consumers.get(&payload.id) else {
            return self.error(corr, code::NOT_FOUND, format!("unknown consumer {}", payload.id));
        };

        let name = consumer.subscription.name().to_string();
        match consumer.topic.unsubscribe(&name, self.consumer_key(payload.id)) {
            Ok(()) => {
                self.consumers.remove(&payload.id);
                info!(subscription = %name, consumer_id = payload.id, "unsubscribed");
                self.reply(Frame::empty(FrameType::Success, corr));
            }
            Err(err @ UnsubscribeError::Busy { .. }) => {
                self.error(corr, code::CONFLICT, err.to_string())
            }
            Err(err @ UnsubscribeError::NotAttached(_)) => {
                self.error(corr, code::NOT_FOUND, err.to_string())
            }
        }
    }
}

/// Drains the outbound queue, coalescing whatever is already queued into one write.
/// A frame that cannot be encoded is dropped; the rest of the batch still goes out.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) -> Result<(), BrokerError> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(frame) = next {
            if let Err(err) = frame::encode_frame(&frame, &mut buf) {
                warn!("dropping unencodable {:?} frame: {}", frame.msg_type, err);
            }
            next = rx.try_recv().ok();
        }
        if buf.is_empty() {
            continue;
        }
        writer.write_all(&buf).await?;
        buf.clear();
    }
    writer.shutdown().await?;
    Ok(())
}
