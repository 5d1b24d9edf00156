//! A single multiplexed client connection.
//!
//! The TCP stream is split: a reader task decodes frames and routes them
//! (responses to the waiting request by correlation id, pushed messages to the
//! owning consumer), and a writer task drains an outbound queue so that
//! one-way frames such as `Flow` and `Ack` can be queued from sync code.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::client::ClientOptions;
use crate::core::error::{ClientError, Result};
use crate::core::message::current_timestamp;
use crate::core::url::{Scheme, ServiceUrl};
use crate::net::frame::{
    self, ConnectPayload, ConnectedPayload, ErrorPayload, Frame, FrameEncodeError, FrameType,
    MessagePayload, MAX_PAYLOAD_LEN, PROTOCOL_VERSION,
};

const INITIAL_BUFFER_SIZE: usize = 8 * 1024;

/// State shared between the connection handle and its background tasks.
#[derive(Debug)]
struct Shared {
    peer: String,
    pending: DashMap<u64, oneshot::Sender<Frame>>,
    consumers: DashMap<u64, flume::Sender<MessagePayload>>,
    closed: CancellationToken,
    /// Last time any frame arrived, in ms since the epoch.
    last_seen_ms: AtomicU64,
}

impl Shared {
    fn shutdown(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        // Dropping the senders wakes every waiter with a disconnect.
        self.pending.clear();
        self.consumers.clear();
        info!(peer = %self.peer, "connection closed");
    }

    fn dispatch(&self, outbound: &mpsc::UnboundedSender<Frame>, frame: Frame) {
        self.last_seen_ms.store(current_timestamp(), Ordering::Relaxed);

        match frame.msg_type {
            FrameType::Message => match MessagePayload::decode(&frame.payload) {
                Ok(msg) => match self.consumers.get(&msg.consumer_id) {
                    Some(tx) => {
                        if let Err(flume::TrySendError::Full(msg)) = tx.try_send(msg) {
                            warn!(
                                consumer_id = msg.consumer_id,
                                message_id = msg.message_id,
                                "receiver queue full; message dropped"
                            );
                        }
                    }
                    None => {
                        debug!(consumer_id = msg.consumer_id, "message for unknown consumer dropped");
                    }
                },
                Err(e) => warn!(peer = %self.peer, "undecodable MESSAGE frame: {}", e),
            },
            FrameType::Ping => {
                let _ = outbound.send(Frame::empty(FrameType::Pong, frame.correlation_id));
            }
            FrameType::Pong => trace!(peer = %self.peer, "pong"),
            _ => match self.pending.remove(&frame.correlation_id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(frame);
                }
                None if frame.msg_type == FrameType::Error => {
                    match ErrorPayload::decode(&frame.payload) {
                        Ok(e) => warn!(peer = %self.peer, code = e.code, "broker error: {}", e.message),
                        Err(e) => warn!(peer = %self.peer, "undecodable ERROR frame: {}", e),
                    }
                }
                None => {
                    debug!(
                        peer = %self.peer,
                        correlation_id = frame.correlation_id,
                        msg_type = ?frame.msg_type,
                        "response without a waiting request"
                    );
                }
            },
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Frame>,
    next_request_id: AtomicU64,
    operation_timeout: Duration,
    server_version: String,
    /// Largest SEND payload the broker accepts, as announced in `Connected`.
    max_message_size: u32,
}

impl Connection {
    /// Opens a TCP connection to the first reachable host of `url` and performs
    /// the CONNECT handshake.
    pub async fn connect(url: &ServiceUrl, options: &ClientOptions) -> Result<Arc<Self>> {
        if url.scheme() == Scheme::Tls {
            return Err(ClientError::UnsupportedTransport(url.scheme().as_str().to_string()));
        }

        let mut last_err = None;
        let mut stream = None;
        for host in url.hosts() {
            let addr = host.to_string();
            let attempt =
                time::timeout(options.connection_timeout, TcpStream::connect((host.host.as_str(), host.port)))
                    .await;
            match attempt {
                Ok(Ok(s)) => {
                    stream = Some((s, addr));
                    break;
                }
                Ok(Err(e)) => {
                    debug!("connect to {} failed: {}", addr, e);
                    last_err = Some(ClientError::Connect { addr, source: e });
                }
                Err(_) => {
                    debug!("connect to {} timed out", addr);
                    last_err = Some(ClientError::Connect {
                        addr,
                        source: std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            format!("no answer within {:?}", options.connection_timeout),
                        ),
                    });
                }
            }
        }

        let (mut stream, peer) = match stream {
            Some(s) => s,
            None => {
                return Err(last_err.unwrap_or_else(|| ClientError::InvalidServiceUrl {
                    url: url.to_string(),
                    reason: "no host given".into(),
                }))
            }
        };
        stream.set_nodelay(true)?;

        let mut read_buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
        let connected = time::timeout(
            options.operation_timeout,
            handshake(&mut stream, &mut read_buf, options.auth_token.clone()),
        )
        .await
        .map_err(|_| ClientError::Timeout(options.operation_timeout))??;

        info!(
            peer = %peer,
            server_version = %connected.server_version,
            "connected to broker"
        );

        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            peer,
            pending: DashMap::new(),
            consumers: DashMap::new(),
            closed: CancellationToken::new(),
            last_seen_ms: AtomicU64::new(current_timestamp()),
        });

        tokio::spawn(read_loop(shared.clone(), reader, read_buf, outbound.clone()));
        tokio::spawn(write_loop(shared.clone(), writer, outbound_rx));
        if !options.keep_alive_interval.is_zero() {
            tokio::spawn(keep_alive(
                shared.clone(),
                outbound.clone(),
                options.keep_alive_interval,
            ));
        }

        Ok(Arc::new(Self {
            shared,
            outbound,
            next_request_id: AtomicU64::new(1),
            operation_timeout: options.operation_timeout,
            server_version: connected.server_version,
            max_message_size: connected.max_message_size,
        }))
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn max_message_size(&self) -> u32 {
        self.max_message_size
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Sends a request and waits for the broker's response, using the
    /// connection's operation timeout.
    pub async fn request(&self, msg_type: FrameType, payload: Bytes) -> Result<Frame> {
        self.request_with_timeout(msg_type, payload, self.operation_timeout)
            .await
    }

    /// Sends a request and waits for its response. An `Error` response is
    /// turned into `ClientError::Broker`; a payload too large for one frame
    /// fails before anything is queued.
    pub async fn request_with_timeout(
        &self,
        msg_type: FrameType,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Frame> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameEncodeError::PayloadTooLarge(payload.len()).into());
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(request_id, tx);

        // Closed between the caller's check and the insert: nobody would drain it.
        if self.is_closed() || self.outbound.send(Frame::new(msg_type, request_id, payload)).is_err() {
            self.shared.pending.remove(&request_id);
            return Err(ClientError::Disconnected);
        }

        let response = match time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => return Err(ClientError::Disconnected),
            Err(_) => {
                self.shared.pending.remove(&request_id);
                return Err(ClientError::Timeout(timeout));
            }
        };

        if response.msg_type == FrameType::Error {
            let err = ErrorPayload::decode(&response.payload)?;
            return Err(ClientError::Broker {
                code: err.code,
                message: err.message,
            });
        }
        Ok(response)
    }

    /// Queues a frame that gets no response on success.
    pub fn send_oneway(&self, msg_type: FrameType, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Disconnected);
        }
        self.outbound
            .send(Frame::new(msg_type, 0, payload))
            .map_err(|_| ClientError::Disconnected)
    }

    pub fn register_consumer(&self, consumer_id: u64, tx: flume::Sender<MessagePayload>) {
        self.shared.consumers.insert(consumer_id, tx);
    }

    pub fn unregister_consumer(&self, consumer_id: u64) {
        self.shared.consumers.remove(&consumer_id);
    }

    /// Closes the connection. Pending requests fail with `Disconnected`.
    pub fn close(&self) {
        self.shared.shutdown();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

async fn handshake(
    stream: &mut TcpStream,
    read_buf: &mut BytesMut,
    auth_token: Option<String>,
) -> Result<ConnectedPayload> {
    let connect = ConnectPayload {
        protocol_version: PROTOCOL_VERSION,
        client_version: concat!("relaymq-", env!("CARGO_PKG_VERSION")).to_string(),
        auth_token,
    }
    .encode()?;

    let mut out = BytesMut::new();
    frame::encode_frame(&Frame::new(FrameType::Connect, 0, connect), &mut out)?;
    stream.write_all(&out).await?;
    stream.flush().await?;

    let response = loop {
        if let Some(frame) = frame::try_decode_frame(read_buf)? {
            break frame;
        }
        if stream.read_buf(read_buf).await? == 0 {
            return Err(ClientError::Disconnected);
        }
    };

    match response.msg_type {
        FrameType::Connected => Ok(ConnectedPayload::decode(&response.payload)?),
        FrameType::Error => {
            let err = ErrorPayload::decode(&response.payload)?;
            Err(ClientError::Handshake {
                code: err.code,
                message: err.message,
            })
        }
        other => Err(ClientError::UnexpectedResponse(format!(
            "{other:?} in reply to CONNECT"
        ))),
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    mut buf: BytesMut,
    outbound: mpsc::UnboundedSender<Frame>,
) {
    'io: loop {
        // Frames that arrived together with the handshake response are already buffered.
        loop {
            match frame::try_decode_frame(&mut buf) {
                Ok(Some(frame)) => shared.dispatch(&outbound, frame),
                Ok(None) => break,
                Err(e) => {
                    error!(peer = %shared.peer, "protocol error: {}", e);
                    break 'io;
                }
            }
        }

        tokio::select! {
            _ = shared.closed.cancelled() => break 'io,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    info!(peer = %shared.peer, "broker closed the connection");
                    break 'io;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(peer = %shared.peer, "read error: {}", e);
                    break 'io;
                }
            }
        }
    }

    shared.shutdown();
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);

    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => break,
            next = outbound.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };

        // Coalesce whatever else is queued into one write.
        let mut next = Some(frame);
        while let Some(frame) = next {
            if let Err(e) = frame::encode_frame(&frame, &mut buf) {
                warn!(peer = %shared.peer, "dropping unencodable {:?} frame: {}", frame.msg_type, e);
            }
            next = outbound.try_recv().ok();
        }

        if let Err(e) = writer.write_all(&buf).await {
            error!(peer = %shared.peer, "write error: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!(peer = %shared.peer, "flush error: {}", e);
            break;
        }
        buf.clear();
    }

    let _ = writer.shutdown().await;
    shared.shutdown();
}

async fn keep_alive(
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Frame>,
    interval: Duration,
) {
    let mut ticker = time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let idle_ms = current_timestamp().saturating_sub(shared.last_seen_ms.load(Ordering::Relaxed));
        if idle_ms > 2 * interval.as_millis() as u64 {
            warn!(peer = %shared.peer, idle_ms, "broker stopped answering keep-alives");
            shared.shutdown();
            return;
        }

        if outbound.send(Frame::empty(FrameType::Ping, 0)).is_err() {
            return;
        }
    }
}
