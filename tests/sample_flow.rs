mod common;

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use relaymq::config::SampleSettings;
use relaymq::net::{
    code, encode_frame, try_decode_frame, ConnectedPayload, Frame, FrameType,
    ProducerSuccessPayload, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
use relaymq::sample;
use relaymq::ClientError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time;
use tokio_util::sync::CancellationToken;

use common::{start_broker, unused_addr};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A one-connection broker that accepts the handshake, the producer and the
/// subscription, then answers every SEND with a 500.
async fn broker_failing_sends() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            while let Ok(Some(frame)) = try_decode_frame(&mut buf) {
                let corr = frame.correlation_id;
                let reply = match frame.msg_type {
                    FrameType::Connect => Frame::new(
                        FrameType::Connected,
                        corr,
                        ConnectedPayload {
                            protocol_version: PROTOCOL_VERSION,
                            server_version: "failing-sends".into(),
                            max_message_size: MAX_MESSAGE_SIZE,
                        }
                        .encode()
                        .unwrap(),
                    ),
                    FrameType::Producer => Frame::new(
                        FrameType::ProducerSuccess,
                        corr,
                        ProducerSuccessPayload {
                            producer_name: "failing-0".into(),
                        }
                        .encode()
                        .unwrap(),
                    ),
                    FrameType::Subscribe => Frame::empty(FrameType::Success, corr),
                    FrameType::Send => Frame::error(corr, code::INTERNAL, "storage unavailable"),
                    _ => continue,
                };
                let mut out = BytesMut::new();
                encode_frame(&reply, &mut out).unwrap();
                if stream.write_all(&out).await.is_err() {
                    return;
                }
            }
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    });
    addr
}

fn settings_for(url: String) -> SampleSettings {
    SampleSettings {
        service_url: url,
        operation_timeout: Duration::from_secs(5),
        connection_timeout: Duration::from_secs(2),
        ..SampleSettings::default()
    }
}

#[tokio::test]
async fn sends_five_then_prints_each_consumed_message() {
    let broker = start_broker().await;
    let settings = settings_for(broker.url());
    let out = SharedBuf::default();
    let cancel = CancellationToken::new();

    let run = {
        let mut out = out.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { sample::run(&settings, &mut out, &cancel).await })
    };

    let deadline = time::Instant::now() + Duration::from_secs(5);
    while out.lines().len() < 5 {
        assert!(time::Instant::now() < deadline, "only got {:?}", out.lines());
        time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();

    let report = run.await.unwrap().expect("sample run");
    let sequence_ids: Vec<u64> = report.sent.iter().map(|r| r.sequence_id).collect();
    assert_eq!(sequence_ids, vec![0, 1, 2, 3, 4]);
    assert_eq!(report.consumed, 5);

    let lines = out.lines();
    for (i, line) in lines.iter().enumerate() {
        let suffix = format!(" consume message-{i}");
        assert!(line.ends_with(&suffix), "line {i}: {line}");
        let stamp = line.trim_end_matches(&suffix);
        assert!(stamp.ends_with(" UTC"), "timestamp `{stamp}`");
        assert!(stamp.contains(", "), "timestamp `{stamp}`");
    }
}

#[tokio::test]
async fn unreachable_broker_fails_before_anything_is_sent() {
    let addr = unused_addr().await;
    let settings = settings_for(format!("pulsar://{addr}"));
    let mut out = SharedBuf::default();

    let err = sample::run(&settings, &mut out, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Connect { .. }), "{err:?}");
    assert!(out.lines().is_empty());
}

#[tokio::test]
async fn invalid_topic_halts_at_producer_creation() {
    let broker = start_broker().await;
    let mut settings = settings_for(broker.url());
    settings.topic = "persistent://public/default/a/b".into();
    let mut out = SharedBuf::default();

    let err = sample::run(&settings, &mut out, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::CreateProducer { .. }), "{err:?}");
    assert_eq!(broker.broker.topic_count(), 0);
}

#[tokio::test]
async fn rejected_subscription_halts_before_sending() {
    let broker = start_broker().await;
    let client = broker.client().await;
    let holder = client
        .subscribe(relaymq::ConsumerOptions::new(
            relaymq::config::DEFAULT_TOPIC,
            relaymq::config::DEFAULT_SUBSCRIPTION,
        ))
        .await
        .unwrap();

    // The sample asks for a shared subscription; an exclusive consumer already holds it.
    let settings = settings_for(broker.url());
    let mut out = SharedBuf::default();
    let err = sample::run(&settings, &mut out, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Subscribe { .. }), "{err:?}");
    assert_eq!(err.broker_code(), Some(409));

    let nothing = common::drain(&holder, Duration::from_millis(200)).await;
    assert!(nothing.is_empty());
}

#[tokio::test]
async fn failed_send_halts_before_receiving() {
    common::init_logging();
    let addr = broker_failing_sends().await;
    let settings = settings_for(format!("pulsar://{addr}"));
    let mut out = SharedBuf::default();

    let err = time::timeout(
        Duration::from_secs(5),
        sample::run(&settings, &mut out, &CancellationToken::new()),
    )
    .await
    .expect("sample should stop at the first failed send")
    .unwrap_err();
    match &err {
        ClientError::Send { sequence_id, .. } => assert_eq!(*sequence_id, 0),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.broker_code(), Some(500));
    assert!(out.lines().is_empty());
}

#[tokio::test]
async fn broker_shutdown_mid_loop_is_a_receive_error() {
    let broker = start_broker().await;
    let settings = settings_for(broker.url());
    let out = SharedBuf::default();

    let run = {
        let mut out = out.clone();
        tokio::spawn(async move {
            sample::run(&settings, &mut out, &CancellationToken::new()).await
        })
    };

    let deadline = time::Instant::now() + Duration::from_secs(5);
    while out.lines().len() < 5 {
        assert!(time::Instant::now() < deadline, "only got {:?}", out.lines());
        time::sleep(Duration::from_millis(20)).await;
    }
    drop(broker);

    let err = time::timeout(Duration::from_secs(5), run)
        .await
        .expect("sample should stop once the broker is gone")
        .unwrap()
        .unwrap_err();
    match err {
        ClientError::Receive { source, .. } => {
            assert!(matches!(*source, ClientError::Disconnected), "{source:?}")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(out.lines().len(), 5);
}
