//! relaymq-sample – send five messages, then print everything consumed.
//
//  $ relaymq-sample --url pulsar://localhost:6650
//  Monday, 02-Jan-06 15:04:05 UTC consume message-0
use std::io;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use relaymq::logging::init_logging;
use relaymq::{sample, Config};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "relaymq-sample", version, about = "RelayMQ producer/consumer sample")]
struct Cli {
    /// Path to config TOML; its `[sample]` section supplies defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker service URL.
    #[arg(long, env = "RELAYMQ_SERVICE_URL")]
    url: Option<String>,

    #[arg(long, env = "RELAYMQ_TOPIC")]
    topic: Option<String>,

    #[arg(long, env = "RELAYMQ_SUBSCRIPTION")]
    subscription: Option<String>,

    /// Authentication token sent in the handshake.
    #[arg(long, env = "RELAYMQ_AUTH_TOKEN")]
    token: Option<String>,

    /// How many messages to send before consuming.
    #[arg(long)]
    messages: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    let mut settings = Config::load(cli.config.as_deref())
        .context("loading configuration")?
        .sample;
    if let Some(url) = cli.url {
        settings.service_url = url;
    }
    if let Some(topic) = cli.topic {
        settings.topic = topic;
    }
    if let Some(subscription) = cli.subscription {
        settings.subscription = subscription;
    }
    if let Some(token) = cli.token {
        settings.auth_token = Some(token);
    }
    if let Some(n) = cli.messages {
        settings.message_count = n;
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received; stopping");
                on_signal.cancel();
            }
            Err(err) => warn!("failed to listen for ctrl-c: {}", err),
        }
    });

    let mut stdout = io::stdout().lock();
    let report = sample::run(&settings, &mut stdout, &cancel)
        .await
        .with_context(|| format!("sample against {} failed", settings.service_url))?;
    info!(sent = report.sent.len(), consumed = report.consumed, "done");
    Ok(())
}
