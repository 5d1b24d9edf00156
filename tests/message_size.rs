mod common;

use std::time::{Duration, Instant};

use relaymq::net::{FrameEncodeError, MAX_FRAME_SIZE, MAX_MESSAGE_SIZE};
use relaymq::{ClientError, ConsumerOptions, ProducerMessage};

use common::{recv, start_broker};

/// SEND header (producer id, sequence id) plus empty metadata.
const SEND_OVERHEAD: usize = 16 + 4;

fn is_too_large(err: &ClientError) -> bool {
    match err {
        ClientError::Send { source, .. } => matches!(
            **source,
            ClientError::FrameEncode(FrameEncodeError::PayloadTooLarge(_))
        ),
        _ => false,
    }
}

#[tokio::test]
async fn largest_accepted_message_is_delivered() {
    let broker = start_broker().await;
    let client = broker.client().await;
    assert!(client.server_version().starts_with("relaymq-broker-"));
    assert_eq!(client.max_message_size(), MAX_MESSAGE_SIZE);

    let consumer = client
        .subscribe(ConsumerOptions::new("big-topic", "sub"))
        .await
        .unwrap();
    let producer = client.create_producer("big-topic").await.unwrap();

    let body_len = MAX_MESSAGE_SIZE as usize - SEND_OVERHEAD;
    producer
        .send(ProducerMessage::new(vec![b'z'; body_len]))
        .await
        .expect("largest message accepted");
    let big = recv(&consumer).await;
    assert_eq!(big.payload().len(), body_len);

    producer.send(ProducerMessage::new("small")).await.unwrap();
    assert_eq!(recv(&consumer).await.payload_str(), "small");
    assert!(client.is_connected());
}

#[tokio::test]
async fn oversized_send_fails_without_waiting() {
    let broker = start_broker().await;
    let client = broker.client().await;
    let producer = client.create_producer("too-big").await.unwrap();

    for body_len in [
        MAX_MESSAGE_SIZE as usize - SEND_OVERHEAD + 1,
        MAX_FRAME_SIZE as usize,
    ] {
        let started = Instant::now();
        let err = producer
            .send(ProducerMessage::new(vec![0u8; body_len]))
            .await
            .unwrap_err();
        assert!(is_too_large(&err), "{body_len}: {err:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    producer.send(ProducerMessage::new("fits")).await.unwrap();
    assert!(client.is_connected());
}
