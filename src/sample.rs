//! The producer/consumer walkthrough behind the `relaymq-sample` binary:
//! connect, create a producer, subscribe, send a handful of messages, then
//! print everything that arrives until cancelled.

use std::io::Write;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::{Client, SendReceipt};
use crate::config::SampleSettings;
use crate::core::error::Result;
use crate::core::message::ProducerMessage;

/// `Monday, 02-Jan-06 15:04:05 UTC`
pub const RFC850_FORMAT: &str = "%A, %d-%b-%y %H:%M:%S %Z";

pub fn format_consume_line(at: DateTime<Utc>, payload: &str) -> String {
    format!("{} consume {}", at.format(RFC850_FORMAT), payload)
}

/// What a sample run did before it stopped.
#[derive(Debug, Clone, Default)]
pub struct SampleReport {
    pub sent: Vec<SendReceipt>,
    pub consumed: u64,
}

/// Runs the sample against the broker in `settings`, writing one line per
/// consumed message to `out`.
///
/// Any connect, producer, subscribe, send or receive failure ends the run
/// with that error. Cancelling `cancel` ends it cleanly.
pub async fn run<W: Write>(
    settings: &SampleSettings,
    out: &mut W,
    cancel: &CancellationToken,
) -> Result<SampleReport> {
    let client = Client::connect(settings.client_options()).await?;
    let producer = client.create_producer(settings.topic.as_str()).await?;
    let consumer = client.subscribe(settings.consumer_options()).await?;

    let mut report = SampleReport::default();
    for i in 0..settings.message_count {
        let receipt = producer
            .send(ProducerMessage::new(format!("message-{i}")))
            .await?;
        report.sent.push(receipt);
    }
    info!(count = report.sent.len(), topic = %producer.topic(), "messages sent");

    loop {
        let msg = match consumer.receive(cancel).await {
            Ok(msg) => msg,
            Err(e) if e.is_cancelled() => break,
            Err(e) => return Err(e),
        };
        writeln!(out, "{}", format_consume_line(Utc::now(), &msg.payload_str()))?;
        out.flush()?;
        report.consumed += 1;
    }

    info!(consumed = report.consumed, "sample stopped");
    client.close();
    Ok(report)
}
