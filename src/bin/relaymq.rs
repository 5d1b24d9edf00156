//! relaymq – the reference broker daemon.
//
//  $ relaymq start --config relaymq.toml
//  $ RELAYMQ_BIND_ADDR=0.0.0.0:6650 relaymq start
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use relaymq::broker::{Broker, Server};
use relaymq::logging::init_logging;
use relaymq::Config;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "relaymq", version, about = "RelayMQ reference broker")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the broker daemon.
    Start {
        /// Path to config TOML (falls back to RELAYMQ_CONFIG, then built-in defaults)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    match cli.cmd {
        Command::Start { config } => {
            let cfg = Config::load(config.as_deref())?;
            let broker_config = cfg.broker;
            info!(
                bind_addr = %broker_config.bind_addr,
                auth = !broker_config.allowed_tokens.is_empty(),
                "starting relaymq broker"
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("ctrl-c received; shutting down"),
                    Err(err) => error!("failed to listen for ctrl-c: {}", err),
                }
                let _ = shutdown_tx.send(true);
            });

            let server = Server::new(broker_config, Arc::new(Broker::new()), shutdown_rx);
            server.start().await?;
        }
    }
    Ok(())
}
