//! Client handle: owns the broker connection and creates producers and consumers.

pub mod connection;
mod consumer;
mod producer;

pub use consumer::{Consumer, ConsumerOptions, MIN_ACK_TIMEOUT};
pub use producer::{Producer, ProducerOptions, SendReceipt};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::core::error::Result;
use crate::core::url::ServiceUrl;
use connection::Connection;

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `pulsar://host:port` style service URL.
    pub url: String,
    pub connection_timeout: Duration,
    /// Upper bound for any request/response exchange with the broker.
    pub operation_timeout: Duration,
    pub auth_token: Option<String>,
    /// Zero disables keep-alive pings.
    pub keep_alive_interval: Duration,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            auth_token: None,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
        }
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }
}

/// A connected client. Cheap to clone; clones share the connection.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    url: ServiceUrl,
    connection: Arc<Connection>,
    next_producer_id: AtomicU64,
    next_consumer_id: AtomicU64,
}

impl Client {
    /// Parses the service URL and connects. Fails on a malformed URL, an
    /// unreachable broker, or a rejected handshake; nothing is retried.
    pub async fn connect(options: ClientOptions) -> Result<Self> {
        let url = ServiceUrl::parse(&options.url)?;
        let connection = Connection::connect(&url, &options).await?;
        info!(url = %url, "client ready");

        Ok(Self {
            inner: Arc::new(ClientInner {
                url,
                connection,
                next_producer_id: AtomicU64::new(1),
                next_consumer_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn service_url(&self) -> &ServiceUrl {
        &self.inner.url
    }

    /// Version string the broker reported in the handshake.
    pub fn server_version(&self) -> &str {
        self.inner.connection.server_version()
    }

    /// Largest encoded message (headers, metadata and body) the broker accepts, in bytes.
    pub fn max_message_size(&self) -> u32 {
        self.inner.connection.max_message_size()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.connection.is_closed()
    }

    /// Creates a producer bound to one topic. Accepts a topic name or full
    /// `ProducerOptions`.
    pub async fn create_producer(&self, options: impl Into<ProducerOptions>) -> Result<Producer> {
        let id = self.inner.next_producer_id.fetch_add(1, Ordering::Relaxed);
        Producer::create(self.inner.connection.clone(), id, options.into()).await
    }

    /// Subscribes a consumer to a topic under the given subscription.
    pub async fn subscribe(&self, options: ConsumerOptions) -> Result<Consumer> {
        let id = self.inner.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        Consumer::create(self.inner.connection.clone(), id, options).await
    }

    /// Closes the underlying connection; every producer and consumer created
    /// from this client stops working.
    pub fn close(&self) {
        self.inner.connection.close();
    }
}
