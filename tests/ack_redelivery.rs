mod common;

use std::time::Duration;

use relaymq::{ConsumerOptions, ProducerMessage, SubscriptionType};

use common::{drain, recv, start_broker};

#[tokio::test]
async fn unacked_message_is_redelivered_after_ack_timeout() {
    let broker = start_broker().await;
    let client = broker.client().await;
    let consumer = client
        .subscribe(
            ConsumerOptions::new("acks", "acks-sub")
                .subscription_type(SubscriptionType::Shared)
                .ack_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    let producer = client.create_producer("acks").await.unwrap();

    producer.send(ProducerMessage::new("acked")).await.unwrap();
    producer.send(ProducerMessage::new("forgotten")).await.unwrap();

    let first = recv(&consumer).await;
    let second = recv(&consumer).await;
    assert_eq!(first.redelivery_count, 0);
    consumer.ack(&first).await.unwrap();

    let again = recv(&consumer).await;
    assert_eq!(again.id, second.id);
    assert_eq!(again.payload_str(), "forgotten");
    assert_eq!(again.redelivery_count, 1);

    consumer.ack(&again).await.unwrap();
    assert!(drain(&consumer, Duration::from_millis(1500)).await.is_empty());
}

#[tokio::test]
async fn without_ack_timeout_nothing_is_redelivered() {
    let broker = start_broker().await;
    let client = broker.client().await;
    let consumer = client
        .subscribe(ConsumerOptions::new("no-timeout", "sub"))
        .await
        .unwrap();
    let producer = client.create_producer("no-timeout").await.unwrap();

    producer.send(ProducerMessage::new("once")).await.unwrap();
    assert_eq!(recv(&consumer).await.payload_str(), "once");
    assert!(drain(&consumer, Duration::from_millis(1300)).await.is_empty());
}

#[tokio::test]
async fn redeliver_unacknowledged_requeues_immediately() {
    let broker = start_broker().await;
    let client = broker.client().await;
    let consumer = client
        .subscribe(ConsumerOptions::new("redeliver", "sub"))
        .await
        .unwrap();
    let producer = client.create_producer("redeliver").await.unwrap();

    for i in 0..3 {
        producer
            .send(ProducerMessage::new(format!("message-{i}")))
            .await
            .unwrap();
    }
    let first = recv(&consumer).await;
    consumer.ack(&first).await.unwrap();
    assert_eq!(drain(&consumer, Duration::from_millis(200)).await.len(), 2);

    consumer.redeliver_unacknowledged().await.unwrap();
    let again = drain(&consumer, Duration::from_millis(300)).await;
    let payloads: Vec<String> = again.iter().map(|m| m.payload_str().into_owned()).collect();
    assert_eq!(payloads, vec!["message-1", "message-2"]);
    assert!(again.iter().all(|m| m.redelivery_count == 1));
}

#[tokio::test]
async fn disconnecting_consumer_returns_messages_to_the_subscription() {
    let broker = start_broker().await;
    let staying = broker.client().await;
    let leaving = broker.client().await;
    let opts = ConsumerOptions::new("handoff", "sub").subscription_type(SubscriptionType::Shared);

    let gone = leaving.subscribe(opts.clone().receiver_queue_size(100)).await.unwrap();
    let producer = staying.create_producer("handoff").await.unwrap();
    producer.send(ProducerMessage::new("orphan")).await.unwrap();
    assert_eq!(recv(&gone).await.payload_str(), "orphan");

    let survivor = staying.subscribe(opts).await.unwrap();
    leaving.close();

    let msg = recv(&survivor).await;
    assert_eq!(msg.payload_str(), "orphan");
    assert_eq!(msg.redelivery_count, 1);
}

#[tokio::test]
async fn message_metadata_round_trips_through_the_broker() {
    let broker = start_broker().await;
    let client = broker.client().await;
    let consumer = client
        .subscribe(ConsumerOptions::new("meta", "sub"))
        .await
        .unwrap();
    let producer = client.create_producer("meta").await.unwrap();

    producer
        .send(
            ProducerMessage::new("body")
                .with_key("order-7")
                .with_property("origin", "test")
                .with_event_time(1_700_000_000_000),
        )
        .await
        .unwrap();

    let msg = recv(&consumer).await;
    assert_eq!(msg.topic, "persistent://public/default/meta");
    assert_eq!(msg.key.as_deref(), Some("order-7"));
    assert_eq!(msg.properties.get("origin").map(String::as_str), Some("test"));
    assert_eq!(msg.event_time, Some(1_700_000_000_000));
    assert!(msg.publish_time > 0);
}
