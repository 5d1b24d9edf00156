mod common;

use std::time::Duration;

use relaymq::{Client, ClientError, ClientOptions, ConsumerOptions, ProducerMessage};
use tokio::time;
use tokio_util::sync::CancellationToken;

use common::{init_logging, start_broker, start_broker_with, unused_addr};

#[tokio::test]
async fn malformed_urls_fail_at_connect() {
    init_logging();
    for url in ["", "http://localhost:6650", "pulsar://", "pulsar://host:0"] {
        let err = Client::connect(ClientOptions::new(url)).await.unwrap_err();
        assert!(
            matches!(err, ClientError::InvalidServiceUrl { .. }),
            "{url}: {err:?}"
        );
    }
}

#[tokio::test]
async fn tls_urls_are_not_supported() {
    init_logging();
    let err = Client::connect(ClientOptions::new("pulsar+ssl://localhost:6651"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::UnsupportedTransport(_)), "{err:?}");
}

#[tokio::test]
async fn unreachable_broker_is_a_connect_error() {
    init_logging();
    let addr = unused_addr().await;
    let err = Client::connect(
        ClientOptions::new(format!("pulsar://{addr}")).connection_timeout(Duration::from_secs(2)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ClientError::Connect { .. }), "{err:?}");
}

#[tokio::test]
async fn second_host_is_tried_when_the_first_is_down() {
    let broker = start_broker().await;
    let dead = unused_addr().await;
    let url = format!("pulsar://{},{}", dead, broker.addr);

    let client = Client::connect(ClientOptions::new(url)).await.unwrap();
    assert!(client.is_connected());
}

#[tokio::test]
async fn token_is_checked_during_handshake() {
    let broker = start_broker_with(|cfg| cfg.allowed_tokens = vec!["secret".into()]).await;

    let err = Client::connect(ClientOptions::new(broker.url()))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Handshake { code: 401, .. }), "{err:?}");

    let err = Client::connect(ClientOptions::new(broker.url()).auth_token("wrong"))
        .await
        .unwrap_err();
    assert_eq!(err.broker_code(), Some(401));

    let client = Client::connect(ClientOptions::new(broker.url()).auth_token("secret"))
        .await
        .unwrap();
    assert!(client.is_connected());
}

#[tokio::test]
async fn receive_returns_cancelled_when_token_fires() {
    let broker = start_broker().await;
    let client = broker.client().await;
    let consumer = client
        .subscribe(ConsumerOptions::new("quiet", "sub"))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = time::timeout(Duration::from_secs(5), consumer.receive(&cancel))
        .await
        .expect("receive should return once cancelled")
        .unwrap_err();
    assert!(err.is_cancelled(), "{err:?}");
    assert!(matches!(err, ClientError::Receive { .. }));
}

#[tokio::test]
async fn closing_the_client_disconnects_consumers_and_producers() {
    let broker = start_broker().await;
    let client = broker.client().await;
    let consumer = client
        .subscribe(ConsumerOptions::new("closing", "sub"))
        .await
        .unwrap();
    let producer = client.create_producer("closing").await.unwrap();

    client.close();
    assert!(!client.is_connected());

    let err = consumer.receive(&CancellationToken::new()).await.unwrap_err();
    match err {
        ClientError::Receive { source, .. } => {
            assert!(matches!(*source, ClientError::Disconnected), "{source:?}")
        }
        other => panic!("unexpected {other:?}"),
    }

    let err = producer.send(ProducerMessage::new("late")).await.unwrap_err();
    assert!(matches!(err, ClientError::Send { .. }), "{err:?}");
}

#[tokio::test]
async fn closed_producer_rejects_sends() {
    let broker = start_broker().await;
    let client = broker.client().await;
    let producer = client.create_producer("closed-producer").await.unwrap();
    assert_eq!(producer.topic().as_str(), "persistent://public/default/closed-producer");
    assert_eq!(producer.name(), "closed-producer-0");

    producer.close().await.unwrap();
    let err = producer.send(ProducerMessage::new("x")).await.unwrap_err();
    assert!(matches!(err, ClientError::ProducerClosed), "{err:?}");
}

#[tokio::test]
async fn short_ack_timeout_is_rejected_locally() {
    let broker = start_broker().await;
    let client = broker.client().await;
    let err = client
        .subscribe(ConsumerOptions::new("t", "sub").ack_timeout(Duration::from_millis(10)))
        .await
        .unwrap_err();
    match err {
        ClientError::Subscribe { source, .. } => {
            assert!(matches!(*source, ClientError::InvalidOption(_)), "{source:?}")
        }
        other => panic!("unexpected {other:?}"),
    }
}
