use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, Instrument};

use crate::broker::auth::{AllowAnyToken, StaticTokenValidator, TokenValidator};
use crate::broker::connection::Connection;
use crate::broker::{Broker, BrokerConfig, BrokerError};

pub struct Server {
    config: BrokerConfig,
    broker: Arc<Broker>,
    validator: Arc<dyn TokenValidator>,
    shutdown: watch::Receiver<bool>,
}

impl Server {
    /// Builds a server; `allowed_tokens` picks the validator unless one is
    /// supplied with [`Server::with_validator`].
    pub fn new(config: BrokerConfig, broker: Arc<Broker>, shutdown: watch::Receiver<bool>) -> Self {
        let validator: Arc<dyn TokenValidator> = if config.allowed_tokens.is_empty() {
            Arc::new(AllowAnyToken)
        } else {
            Arc::new(StaticTokenValidator::from_tokens(
                config.allowed_tokens.iter().cloned(),
            ))
        };
        Self {
            config,
            broker,
            validator,
            shutdown,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn start(&self) -> Result<(), BrokerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the accept loop on an already bound listener until a shutdown signal is received.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BrokerError> {
        let local_addr = listener.local_addr()?;
        info!("relaymq broker listening on {}", local_addr);

        let sweeper = tokio::spawn(ack_timeout_sweeper(
            self.broker.clone(),
            self.config.ack_check_interval,
            self.shutdown.clone(),
        ));

        let mut next_conn_id: u64 = 1;
        let mut shutdown_rx = self.shutdown.clone();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            let conn_id = next_conn_id;
                            next_conn_id = next_conn_id.wrapping_add(1);
                            self.spawn_connection(conn_id, stream, addr);
                        }
                        Err(err) => {
                            error!("accept error: {}", err);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("shutdown signal received; stopping accept loop");
                    break;
                }
            }
        }

        sweeper.abort();
        Ok(())
    }

    fn spawn_connection(&self, conn_id: u64, stream: tokio::net::TcpStream, addr: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!("connection {}: set_nodelay failed: {}", conn_id, err);
        }
        debug!("accepted connection {} from {}", conn_id, addr);

        let span = tracing::info_span!("connection", conn_id, peer = %addr);
        tokio::spawn(
            Connection::run(
                conn_id,
                stream,
                addr,
                self.broker.clone(),
                self.validator.clone(),
                self.shutdown.clone(),
            )
            .instrument(span),
        );
    }
}

async fn ack_timeout_sweeper(
    broker: Arc<Broker>,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let requeued = broker.check_ack_timeouts(Instant::now());
                if requeued > 0 {
                    debug!(requeued, "ack timeouts redelivered");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
