mod common;

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use relaymq::net::{
    code, encode_frame, try_decode_frame, ConnectPayload, ConnectedPayload, ErrorPayload, Frame,
    FrameType, IdPayload, MessageMetadata, ProducerPayload, ProducerSuccessPayload, SendPayload,
    SendReceiptPayload, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::start_broker;

struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .expect("failed to connect to server");
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send_frame(&mut self, frame: &Frame) {
        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf).expect("encode_frame failed");
        self.stream
            .write_all(&buf)
            .await
            .expect("failed to write frame");
    }

    async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = try_decode_frame(&mut self.buf).expect("decode failed") {
                return Some(frame);
            }
            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .expect("failed to read from stream");
            if n == 0 {
                return None;
            }
        }
    }

    async fn request(&mut self, frame: Frame) -> Frame {
        self.send_frame(&frame).await;
        self.recv_frame().await.expect("no response")
    }

    async fn handshake(&mut self, version: u16) -> Frame {
        let payload = ConnectPayload {
            protocol_version: version,
            client_version: "raw-test".into(),
            auth_token: None,
        }
        .encode()
        .expect("encode connect");
        self.request(Frame::new(FrameType::Connect, 1, payload)).await
    }
}

fn error_code(frame: &Frame) -> u16 {
    assert_eq!(frame.msg_type, FrameType::Error, "{frame:?}");
    ErrorPayload::decode(&frame.payload).expect("decode error").code
}

#[tokio::test]
async fn requests_before_connect_are_unauthenticated() {
    let broker = start_broker().await;
    let mut client = TestClient::connect(broker.addr).await;

    let resp = client
        .request(Frame::new(FrameType::CloseProducer, 7, IdPayload { id: 1 }.encode()))
        .await;
    assert_eq!(resp.correlation_id, 7);
    assert_eq!(error_code(&resp), code::UNAUTHENTICATED);

    // The connection stays usable.
    let resp = client.handshake(PROTOCOL_VERSION).await;
    assert_eq!(resp.msg_type, FrameType::Connected);
    let connected = ConnectedPayload::decode(&resp.payload).unwrap();
    assert_eq!(connected.protocol_version, PROTOCOL_VERSION);
    assert!(connected.server_version.starts_with("relaymq-broker-"));
    assert_eq!(connected.max_message_size, MAX_MESSAGE_SIZE);
}

#[tokio::test]
async fn wrong_protocol_version_is_refused() {
    let broker = start_broker().await;
    let mut client = TestClient::connect(broker.addr).await;
    let resp = client.handshake(PROTOCOL_VERSION + 1).await;
    assert_eq!(error_code(&resp), code::UNSUPPORTED_VERSION);
}

#[tokio::test]
async fn producer_lifecycle_over_raw_frames() {
    let broker = start_broker().await;
    let mut client = TestClient::connect(broker.addr).await;
    client.handshake(PROTOCOL_VERSION).await;

    let producer = ProducerPayload {
        producer_id: 3,
        topic: "raw".into(),
        producer_name: None,
    }
    .encode()
    .unwrap();
    let resp = client
        .request(Frame::new(FrameType::Producer, 10, producer))
        .await;
    assert_eq!(resp.msg_type, FrameType::ProducerSuccess);
    let success = ProducerSuccessPayload::decode(&resp.payload).unwrap();
    assert_eq!(success.producer_name, "raw-0");

    for (corr, expected_id) in [(11u64, 0u64), (12, 1)] {
        let send = SendPayload {
            producer_id: 3,
            sequence_id: corr,
            metadata: MessageMetadata::default(),
            message: Bytes::from_static(b"hello"),
        }
        .encode()
        .unwrap();
        let resp = client.request(Frame::new(FrameType::Send, corr, send)).await;
        assert_eq!(resp.msg_type, FrameType::SendReceipt);
        let receipt = SendReceiptPayload::decode(&resp.payload).unwrap();
        assert_eq!(receipt.sequence_id, corr);
        assert_eq!(receipt.message_id, expected_id);
    }

    let send = SendPayload {
        producer_id: 99,
        sequence_id: 0,
        metadata: MessageMetadata::default(),
        message: Bytes::new(),
    }
    .encode()
    .unwrap();
    let resp = client.request(Frame::new(FrameType::Send, 13, send)).await;
    assert_eq!(error_code(&resp), code::NOT_FOUND);

    let resp = client
        .request(Frame::new(FrameType::CloseProducer, 14, IdPayload { id: 3 }.encode()))
        .await;
    assert_eq!(resp.msg_type, FrameType::Success);
    assert_eq!(resp.correlation_id, 14);
}

#[tokio::test]
async fn undecodable_framing_closes_the_connection() {
    let broker = start_broker().await;
    let mut client = TestClient::connect(broker.addr).await;

    // Valid length, unknown frame type.
    let mut raw = BytesMut::new();
    raw.put_u32(9);
    raw.put_u8(0xEE);
    raw.put_u64(1);
    client.stream.write_all(&raw).await.unwrap();

    assert!(client.recv_frame().await.is_none());
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let broker = start_broker().await;
    let mut client = TestClient::connect(broker.addr).await;
    let resp = client.request(Frame::empty(FrameType::Ping, 5)).await;
    assert_eq!(resp.msg_type, FrameType::Pong);
    assert_eq!(resp.correlation_id, 5);
}

#[tokio::test]
async fn send_too_large_to_deliver_is_a_bad_request() {
    let broker = start_broker().await;
    let mut client = TestClient::connect(broker.addr).await;
    client.handshake(PROTOCOL_VERSION).await;

    let producer = ProducerPayload {
        producer_id: 1,
        topic: "raw-big".into(),
        producer_name: None,
    }
    .encode()
    .unwrap();
    client
        .request(Frame::new(FrameType::Producer, 2, producer))
        .await;

    // Fits in a frame, but the MESSAGE pushed for it would not.
    let send = SendPayload {
        producer_id: 1,
        sequence_id: 0,
        metadata: MessageMetadata::default(),
        message: Bytes::from(vec![b'x'; MAX_MESSAGE_SIZE as usize - 16 - 4 + 1]),
    }
    .encode()
    .unwrap();
    let resp = client.request(Frame::new(FrameType::Send, 3, send)).await;
    assert_eq!(resp.correlation_id, 3);
    assert_eq!(error_code(&resp), code::BAD_REQUEST);

    let resp = client.request(Frame::empty(FrameType::Ping, 4)).await;
    assert_eq!(resp.msg_type, FrameType::Pong);
}
