use std::collections::BTreeMap;
use std::convert::TryFrom;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const LENGTH_FIELD_LEN: usize = 4;
/// Type byte plus correlation id.
pub const FRAME_HEADER_LEN: usize = 1 + 8;
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_SIZE as usize - FRAME_HEADER_LEN;
pub const PROTOCOL_VERSION: u16 = 1;

const SEND_HEADER_LEN: usize = 8 + 8;
const MESSAGE_HEADER_LEN: usize = 8 + 8 + 4 + 8;

/// Largest encoded SEND payload the broker accepts. The MESSAGE pushed for
/// it carries a longer header and must still fit in one frame.
pub const MAX_MESSAGE_SIZE: u32 = (MAX_PAYLOAD_LEN - (MESSAGE_HEADER_LEN - SEND_HEADER_LEN)) as u32;

/// Error codes carried in `Error` frames.
pub mod code {
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHENTICATED: u16 = 401;
    pub const NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;
    pub const UNSUPPORTED_VERSION: u16 = 426;
    pub const INTERNAL: u16 = 500;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Producer = 0x03,
    ProducerSuccess = 0x04,
    Send = 0x05,
    SendReceipt = 0x06,
    Subscribe = 0x07,
    Success = 0x08,
    Flow = 0x09,
    Message = 0x0A,
    Ack = 0x0B,
    RedeliverUnacknowledged = 0x0C,
    CloseProducer = 0x0D,
    CloseConsumer = 0x0E,
    Error = 0x0F,
    Ping = 0x10,
    Pong = 0x11,
    Unsubscribe = 0x12,
}

impl From<FrameType> for u8 {
    fn from(t: FrameType) -> Self {
        t as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameDecodeError;

    fn try_from(value: u8) -> Result<Self, FrameDecodeError> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Producer),
            0x04 => Ok(FrameType::ProducerSuccess),
            0x05 => Ok(FrameType::Send),
            0x06 => Ok(FrameType::SendReceipt),
            0x07 => Ok(FrameType::Subscribe),
            0x08 => Ok(FrameType::Success),
            0x09 => Ok(FrameType::Flow),
            0x0A => Ok(FrameType::Message),
            0x0B => Ok(FrameType::Ack),
            0x0C => Ok(FrameType::RedeliverUnacknowledged),
            0x0D => Ok(FrameType::CloseProducer),
            0x0E => Ok(FrameType::CloseConsumer),
            0x0F => Ok(FrameType::Error),
            0x10 => Ok(FrameType::Ping),
            0x11 => Ok(FrameType::Pong),
            0x12 => Ok(FrameType::Unsubscribe),
            other => Err(FrameDecodeError::UnknownFrameType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: FrameType,
    pub correlation_id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: FrameType, correlation_id: u64, payload: Bytes) -> Self {
        Self {
            msg_type,
            correlation_id,
            payload,
        }
    }

    /// A frame with no payload (`Success`, `Ping`, `Pong`).
    pub fn empty(msg_type: FrameType, correlation_id: u64) -> Self {
        Self::new(msg_type, correlation_id, Bytes::new())
    }

    pub fn error(correlation_id: u64, code: u16, message: impl Into<String>) -> Self {
        let payload = ErrorPayload {
            code,
            message: message.into(),
        }
        .encode();
        Self::new(FrameType::Error, correlation_id, payload)
    }
}

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("invalid frame length: {0}")]
    InvalidLength(u32),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}

#[derive(Debug, Error)]
pub enum FrameEncodeError {
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

// ───────────────────────────────────────────────────────────
// Payload helpers
// ───────────────────────────────────────────────────────────

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), FrameEncodeError> {
    let len = u16::try_from(s.len()).map_err(|_| FrameEncodeError::PayloadTooLarge(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) -> Result<(), FrameEncodeError> {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn put_opt_u64(buf: &mut BytesMut, v: Option<u64>) {
    match v {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64(v);
        }
        None => buf.put_u8(0),
    }
}

fn put_properties(
    buf: &mut BytesMut,
    properties: &BTreeMap<String, String>,
) -> Result<(), FrameEncodeError> {
    let count = u16::try_from(properties.len())
        .map_err(|_| FrameEncodeError::PayloadTooLarge(properties.len()))?;
    buf.put_u16(count);
    for (k, v) in properties {
        put_str(buf, k)?;
        put_str(buf, v)?;
    }
    Ok(())
}

/// Bounds-checked cursor over a payload. Every read fails with
/// `InvalidLength(total)` instead of panicking on short input.
struct PayloadReader<'a> {
    buf: &'a [u8],
    total: u32,
}

impl<'a> PayloadReader<'a> {
    fn new(payload: &'a Bytes) -> Self {
        Self {
            buf: &payload[..],
            total: payload.len() as u32,
        }
    }

    fn need(&self, n: usize) -> Result<(), FrameDecodeError> {
        if self.buf.remaining() < n {
            return Err(FrameDecodeError::InvalidLength(self.total));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, FrameDecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, FrameDecodeError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, FrameDecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, FrameDecodeError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn string(&mut self, field: &'static str) -> Result<String, FrameDecodeError> {
        let len = self.u16()? as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        String::from_utf8(head.to_vec()).map_err(|_| FrameDecodeError::InvalidUtf8(field))
    }

    fn opt_string(&mut self, field: &'static str) -> Result<Option<String>, FrameDecodeError> {
        match self.u8()? {
            0 => Ok(None),
            1 => self.string(field).map(Some),
            _ => Err(FrameDecodeError::InvalidValue(field)),
        }
    }

    fn opt_u64(&mut self, field: &'static str) -> Result<Option<u64>, FrameDecodeError> {
        match self.u8()? {
            0 => Ok(None),
            1 => self.u64().map(Some),
            _ => Err(FrameDecodeError::InvalidValue(field)),
        }
    }

    fn properties(&mut self) -> Result<BTreeMap<String, String>, FrameDecodeError> {
        let count = self.u16()?;
        let mut properties = BTreeMap::new();
        for _ in 0..count {
            let k = self.string("property name")?;
            let v = self.string("property value")?;
            properties.insert(k, v);
        }
        Ok(properties)
    }

    /// Everything not read yet, as an owned slice of the original payload.
    fn rest(self, payload: &Bytes) -> Bytes {
        payload.slice(payload.len() - self.buf.len()..)
    }

    /// Fixed-layout payloads must be consumed exactly.
    fn finish(self) -> Result<(), FrameDecodeError> {
        if self.buf.has_remaining() {
            return Err(FrameDecodeError::InvalidLength(self.total));
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────

/// CONNECT payload: [u16 protocol_version][str client_version][opt str auth_token]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPayload {
    pub protocol_version: u16,
    pub client_version: String,
    pub auth_token: Option<String>,
}

impl ConnectPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::with_capacity(2 + 2 + self.client_version.len() + 64);
        buf.put_u16(self.protocol_version);
        put_str(&mut buf, &self.client_version)?;
        put_opt_str(&mut buf, self.auth_token.as_deref())?;
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut r = PayloadReader::new(payload);
        let protocol_version = r.u16()?;
        let client_version = r.string("client version")?;
        let auth_token = r.opt_string("auth token")?;
        r.finish()?;
        Ok(Self {
            protocol_version,
            client_version,
            auth_token,
        })
    }
}

/// CONNECTED payload: [u16 protocol_version][str server_version][u32 max_message_size]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPayload {
    pub protocol_version: u16,
    pub server_version: String,
    pub max_message_size: u32,
}

impl ConnectedPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::with_capacity(2 + 2 + self.server_version.len() + 4);
        buf.put_u16(self.protocol_version);
        put_str(&mut buf, &self.server_version)?;
        buf.put_u32(self.max_message_size);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut r = PayloadReader::new(payload);
        let protocol_version = r.u16()?;
        let server_version = r.string("server version")?;
        let max_message_size = r.u32()?;
        r.finish()?;
        Ok(Self {
            protocol_version,
            server_version,
            max_message_size,
        })
    }
}

/// PRODUCER payload: [u64 producer_id][str topic][opt str producer_name]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerPayload {
    pub producer_id: u64,
    pub topic: String,
    pub producer_name: Option<String>,
}

impl ProducerPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::with_capacity(8 + 2 + self.topic.len() + 32);
        buf.put_u64(self.producer_id);
        put_str(&mut buf, &self.topic)?;
        put_opt_str(&mut buf, self.producer_name.as_deref())?;
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut r = PayloadReader::new(payload);
        let producer_id = r.u64()?;
        let topic = r.string("topic")?;
        let producer_name = r.opt_string("producer name")?;
        r.finish()?;
        Ok(Self {
            producer_id,
            topic,
            producer_name,
        })
    }
}

/// PRODUCER_SUCCESS payload: [str producer_name]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSuccessPayload {
    pub producer_name: String,
}

impl ProducerSuccessPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::with_capacity(2 + self.producer_name.len());
        put_str(&mut buf, &self.producer_name)?;
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut r = PayloadReader::new(payload);
        let producer_name = r.string("producer name")?;
        r.finish()?;
        Ok(Self { producer_name })
    }
}

/// Per-message metadata shared by SEND and MESSAGE:
/// [opt str key][u16 n][n × (str name, str value)][opt u64 event_time]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub key: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub event_time: Option<u64>,
}

impl MessageMetadata {
    fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameEncodeError> {
        put_opt_str(buf, self.key.as_deref())?;
        put_properties(buf, &self.properties)?;
        put_opt_u64(buf, self.event_time);
        Ok(())
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Result<Self, FrameDecodeError> {
        Ok(Self {
            key: r.opt_string("message key")?,
            properties: r.properties()?,
            event_time: r.opt_u64("event time")?,
        })
    }
}

/// SEND payload: [u64 producer_id][u64 sequence_id][metadata][message_bytes...]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendPayload {
    pub producer_id: u64,
    pub sequence_id: u64,
    pub metadata: MessageMetadata,
    pub message: Bytes,
}

impl SendPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::with_capacity(SEND_HEADER_LEN + 16 + self.message.len());
        buf.put_u64(self.producer_id);
        buf.put_u64(self.sequence_id);
        self.metadata.encode_into(&mut buf)?;
        buf.put_slice(&self.message);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut r = PayloadReader::new(payload);
        let producer_id = r.u64()?;
        let sequence_id = r.u64()?;
        let metadata = MessageMetadata::decode_from(&mut r)?;
        let message = r.rest(payload);
        Ok(Self {
            producer_id,
            sequence_id,
            metadata,
            message,
        })
    }
}

/// SEND_RECEIPT payload: [u64 producer_id][u64 sequence_id][u64 message_id]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceiptPayload {
    pub producer_id: u64,
    pub sequence_id: u64,
    pub message_id: u64,
}

impl SendReceiptPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u64(self.producer_id);
        buf.put_u64(self.sequence_id);
        buf.put_u64(self.message_id);
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut r = PayloadReader::new(payload);
        let producer_id = r.u64()?;
        let sequence_id = r.u64()?;
        let message_id = r.u64()?;
        r.finish()?;
        Ok(Self {
            producer_id,
            sequence_id,
            message_id,
        })
    }
}

/// SUBSCRIBE payload:
/// [u64 consumer_id][str topic][str subscription][u8 sub_type][str consumer_name][u64 ack_timeout_ms]
///
/// An `ack_timeout_ms` of 0 disables ack-timeout redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePayload {
    pub consumer_id: u64,
    pub topic: String,
    pub subscription: String,
    pub sub_type: u8,
    pub consumer_name: String,
    pub ack_timeout_ms: u64,
}

impl SubscribePayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::with_capacity(
            8 + 2 + self.topic.len() + 2 + self.subscription.len() + 1 + 2 + 32 + 8,
        );
        buf.put_u64(self.consumer_id);
        put_str(&mut buf, &self.topic)?;
        put_str(&mut buf, &self.subscription)?;
        buf.put_u8(self.sub_type);
        put_str(&mut buf, &self.consumer_name)?;
        buf.put_u64(self.ack_timeout_ms);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut r = PayloadReader::new(payload);
        let consumer_id = r.u64()?;
        let topic = r.string("topic")?;
        let subscription = r.string("subscription")?;
        let sub_type = r.u8()?;
        let consumer_name = r.string("consumer name")?;
        let ack_timeout_ms = r.u64()?;
        r.finish()?;
        Ok(Self {
            consumer_id,
            topic,
            subscription,
            sub_type,
            consumer_name,
            ack_timeout_ms,
        })
    }
}

/// FLOW payload: [u64 consumer_id][u32 permits]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowPayload {
    pub consumer_id: u64,
    pub permits: u32,
}

impl FlowPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u64(self.consumer_id);
        buf.put_u32(self.permits);
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut r = PayloadReader::new(payload);
        let consumer_id = r.u64()?;
        let permits = r.u32()?;
        r.finish()?;
        Ok(Self {
            consumer_id,
            permits,
        })
    }
}

/// MESSAGE payload:
/// [u64 consumer_id][u64 message_id][u32 redelivery_count][u64 publish_time][metadata][message_bytes...]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePayload {
    pub consumer_id: u64,
    pub message_id: u64,
    pub redelivery_count: u32,
    pub publish_time: u64,
    pub metadata: MessageMetadata,
    pub message: Bytes,
}

impl MessagePayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_LEN + 16 + self.message.len());
        buf.put_u64(self.consumer_id);
        buf.put_u64(self.message_id);
        buf.put_u32(self.redelivery_count);
        buf.put_u64(self.publish_time);
        self.metadata.encode_into(&mut buf)?;
        buf.put_slice(&self.message);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut r = PayloadReader::new(payload);
        let consumer_id = r.u64()?;
        let message_id = r.u64()?;
        let redelivery_count = r.u32()?;
        let publish_time = r.u64()?;
        let metadata = MessageMetadata::decode_from(&mut r)?;
        let message = r.rest(payload);
        Ok(Self {
            consumer_id,
            message_id,
            redelivery_count,
            publish_time,
            metadata,
            message,
        })
    }
}

/// ACK payload: [u64 consumer_id][u64 message_id]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPayload {
    pub consumer_id: u64,
    pub message_id: u64,
}

impl AckPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64(self.consumer_id);
        buf.put_u64(self.message_id);
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut r = PayloadReader::new(payload);
        let consumer_id = r.u64()?;
        let message_id = r.u64()?;
        r.finish()?;
        Ok(Self {
            consumer_id,
            message_id,
        })
    }
}

/// Payload of CLOSE_PRODUCER, CLOSE_CONSUMER, UNSUBSCRIBE and REDELIVER_UNACKNOWLEDGED: [u64 id]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    pub id: u64,
}

impl IdPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(self.id);
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut r = PayloadReader::new(payload);
        let id = r.u64()?;
        r.finish()?;
        Ok(Self { id })
    }
}

/// ERROR payload: [u16 code][u16 message_len][message_bytes]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

impl ErrorPayload {
    /// Messages longer than `u16::MAX` bytes are truncated on a char boundary.
    pub fn encode(&self) -> Bytes {
        let mut end = self.message.len().min(u16::MAX as usize);
        while !self.message.is_char_boundary(end) {
            end -= 1;
        }
        let msg = &self.message[..end];

        let mut buf = BytesMut::with_capacity(2 + 2 + msg.len());
        buf.put_u16(self.code);
        buf.put_u16(msg.len() as u16);
        buf.put_slice(msg.as_bytes());
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut r = PayloadReader::new(payload);
        let code = r.u16()?;
        let message = r.string("error message")?;
        r.finish()?;
        Ok(Self { code, message })
    }
}

// ───────────────────────────────────────────────────────────
// Framing
// ───────────────────────────────────────────────────────────

/// Encode a frame into the provided buffer.
#[inline(always)]
#[tracing::instrument(level = "trace", skip(frame, dst))]
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameEncodeError> {
    let payload_len = frame.payload.len();
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameEncodeError::PayloadTooLarge(payload_len));
    }
    let total_len = FRAME_HEADER_LEN + payload_len;

    dst.reserve(LENGTH_FIELD_LEN + total_len);
    dst.put_u32(total_len as u32);
    dst.put_u8(frame.msg_type.into());
    dst.put_u64(frame.correlation_id);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Try to decode a single frame from the buffer.
///
/// Returns `Ok(None)` if there is not yet enough data to decode a full frame.
#[inline(always)]
#[tracing::instrument(level = "trace", skip(src))]
pub fn try_decode_frame(src: &mut BytesMut) -> Result<Option<Frame>, FrameDecodeError> {
    if src.len() < LENGTH_FIELD_LEN {
        return Ok(None);
    }

    let mut length_bytes = &src[..LENGTH_FIELD_LEN];
    let frame_len = length_bytes.get_u32();

    if frame_len == 0 {
        return Err(FrameDecodeError::InvalidLength(frame_len));
    }

    if frame_len > MAX_FRAME_SIZE {
        return Err(FrameDecodeError::FrameTooLarge(frame_len));
    }

    let frame_len_usize = frame_len as usize;
    if frame_len_usize < FRAME_HEADER_LEN {
        return Err(FrameDecodeError::InvalidLength(frame_len));
    }

    if src.len() < LENGTH_FIELD_LEN + frame_len_usize {
        return Ok(None);
    }

    let total = LENGTH_FIELD_LEN + frame_len_usize;
    let mut frame_bytes = src.split_to(total);
    frame_bytes.advance(LENGTH_FIELD_LEN);

    let msg_type_raw = frame_bytes.get_u8();
    let msg_type = FrameType::try_from(msg_type_raw)?;
    let correlation_id = frame_bytes.get_u64();
    let payload = frame_bytes.freeze();

    Ok(Some(Frame {
        msg_type,
        correlation_id,
        payload,
    }))
}
