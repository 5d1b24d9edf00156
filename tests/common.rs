#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use relaymq::broker::{Broker, BrokerConfig, Server};
use relaymq::{Client, ClientOptions, Consumer, Message};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = relaymq::logging::init_logging();
    });
}

pub struct TestBroker {
    pub addr: SocketAddr,
    pub broker: Arc<Broker>,
    shutdown: watch::Sender<bool>,
}

impl TestBroker {
    pub fn url(&self) -> String {
        format!("pulsar://{}", self.addr)
    }

    pub async fn client(&self) -> Client {
        Client::connect(ClientOptions::new(self.url()))
            .await
            .expect("connect to test broker")
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub async fn start_broker() -> TestBroker {
    start_broker_with(|_| {}).await
}

/// Serves a fresh broker on an ephemeral port with a fast ack-timeout sweep.
pub async fn start_broker_with(tweak: impl FnOnce(&mut BrokerConfig)) -> TestBroker {
    init_logging();

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral failed");
    let addr = listener.local_addr().expect("local addr");

    let mut config = BrokerConfig {
        bind_addr: addr,
        ack_check_interval: Duration::from_millis(50),
        ..BrokerConfig::default()
    };
    tweak(&mut config);

    let broker = Arc::new(Broker::new());
    let (shutdown, shutdown_rx) = watch::channel(false);
    let server = Server::new(config, broker.clone(), shutdown_rx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestBroker {
        addr,
        broker,
        shutdown,
    }
}

/// Receives one message or panics after five seconds.
pub async fn recv(consumer: &Consumer) -> Message {
    time::timeout(Duration::from_secs(5), consumer.receive(&CancellationToken::new()))
        .await
        .expect("timed out waiting for a message")
        .expect("receive failed")
}

/// Receives until nothing arrives for `quiet`.
pub async fn drain(consumer: &Consumer, quiet: Duration) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(Ok(msg)) =
        time::timeout(quiet, consumer.receive(&CancellationToken::new())).await
    {
        out.push(msg);
    }
    out
}

/// An address nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr
}
