use std::time::Duration;

use thiserror::Error;

use crate::core::topic::TopicError;
use crate::net::frame::{FrameDecodeError, FrameEncodeError};

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by `Client`, `Producer` and `Consumer`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid service URL `{url}`: {reason}")]
    InvalidServiceUrl { url: String, reason: String },

    #[error(transparent)]
    InvalidTopic(#[from] TopicError),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("unsupported transport `{0}`")]
    UnsupportedTransport(String),

    #[error("handshake rejected ({code}): {message}")]
    Handshake { code: u16, message: String },

    #[error("failed to create producer on `{topic}`")]
    CreateProducer {
        topic: String,
        #[source]
        source: Box<ClientError>,
    },

    #[error("failed to subscribe `{subscription}` on `{topic}`")]
    Subscribe {
        topic: String,
        subscription: String,
        #[source]
        source: Box<ClientError>,
    },

    #[error("failed to send message with sequence id {sequence_id}")]
    Send {
        sequence_id: u64,
        #[source]
        source: Box<ClientError>,
    },

    #[error("failed to receive on subscription `{subscription}`")]
    Receive {
        subscription: String,
        #[source]
        source: Box<ClientError>,
    },

    #[error("failed to acknowledge message {message_id}")]
    Ack {
        message_id: u64,
        #[source]
        source: Box<ClientError>,
    },

    #[error("broker error ({code}): {message}")]
    Broker { code: u16, message: String },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("connection closed")]
    Disconnected,

    #[error("producer is closed")]
    ProducerClosed,

    #[error("consumer is closed")]
    ConsumerClosed,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("frame decode error: {0}")]
    FrameDecode(#[from] FrameDecodeError),

    #[error("frame encode error: {0}")]
    FrameEncode(#[from] FrameEncodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub(crate) fn create_producer(topic: impl Into<String>, source: ClientError) -> Self {
        Self::CreateProducer {
            topic: topic.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn subscribe(
        topic: impl Into<String>,
        subscription: impl Into<String>,
        source: ClientError,
    ) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            subscription: subscription.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn send(sequence_id: u64, source: ClientError) -> Self {
        Self::Send {
            sequence_id,
            source: Box::new(source),
        }
    }

    pub(crate) fn receive(subscription: impl Into<String>, source: ClientError) -> Self {
        Self::Receive {
            subscription: subscription.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn ack(message_id: u64, source: ClientError) -> Self {
        Self::Ack {
            message_id,
            source: Box::new(source),
        }
    }

    fn cause(&self) -> Option<&ClientError> {
        match self {
            Self::CreateProducer { source, .. }
            | Self::Subscribe { source, .. }
            | Self::Send { source, .. }
            | Self::Receive { source, .. }
            | Self::Ack { source, .. } => Some(source),
            _ => None,
        }
    }

    /// True when this error, or a wrapped cause, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            other => other.cause().is_some_and(ClientError::is_cancelled),
        }
    }

    /// Broker error code carried by this error or one of its wrapped causes.
    pub fn broker_code(&self) -> Option<u16> {
        match self {
            Self::Broker { code, .. } | Self::Handshake { code, .. } => Some(*code),
            other => other.cause().and_then(ClientError::broker_code),
        }
    }
}
