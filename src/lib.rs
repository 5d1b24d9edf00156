//! RelayMQ – a lightweight pub/sub client with an in-process reference broker.
//!
//! This crate exports
//!  * `client`  – `Client`, `Producer` and `Consumer` handles
//!  * `core`    – errors, messages, topic names, service URLs, subscription types
//!  * `net`     – the length-prefixed wire frames shared by client and broker
//!  * `broker`  – a small TCP broker speaking the same frames
//!  * `config`  – TOML-driven runtime configuration
//!  * `sample`  – the send-five-then-consume walkthrough
//!
//! A typical program connects, creates a producer, subscribes a consumer and
//! then sends and receives:
//!
//! ```no_run
//! use relaymq::{Client, ClientOptions, ConsumerOptions, ProducerMessage, SubscriptionType};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> relaymq::Result<()> {
//! let client = Client::connect(ClientOptions::new("pulsar://localhost:6650")).await?;
//! let producer = client.create_producer("my-topic").await?;
//! let consumer = client
//!     .subscribe(ConsumerOptions::new("my-topic", "my-sub").subscription_type(SubscriptionType::Shared))
//!     .await?;
//!
//! producer.send(ProducerMessage::new("hello")).await?;
//! let msg = consumer.receive(&CancellationToken::new()).await?;
//! consumer.ack(&msg).await?;
//! # Ok(())
//! # }
//! ```

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod client;
pub mod config;
pub mod core;
pub mod logging;
pub mod net;
pub mod sample;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use client::{
    Client, ClientOptions, Consumer, ConsumerOptions, Producer, ProducerOptions, SendReceipt,
};
pub use config::{load_config, Config};
pub use core::error::{ClientError, Result};
pub use core::message::{Message, MessageId, ProducerMessage};
pub use core::subscription::SubscriptionType;
pub use core::topic::TopicName;
