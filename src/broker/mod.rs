//! # Broker Module
//!
//! An in-memory reference broker speaking the same frame protocol as the
//! client. It keeps topics, subscriptions and in-flight messages in memory
//! only; nothing survives a restart.
//!
//! - `server`: accept loop, per-connection handling and the ack-timeout sweeper.
//! - `topic` / `subscription`: message fan-out and per-subscription dispatch.
//! - `auth`: token validation for the `Connect` handshake.
//!
//! ```bash
//! relaymq start --config relaymq.toml
//! ```

pub mod auth;
mod connection;
pub mod server;
pub mod subscription;
pub mod topic;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;

use crate::core::topic::TopicName;
use crate::net::frame::{FrameDecodeError, FrameEncodeError};

pub use auth::{AllowAnyToken, StaticTokenValidator, TokenValidator};
pub use server::Server;
use topic::Topic;

pub const DEFAULT_BROKER_PORT: u16 = 6650;

/// The `[broker]` section of `relaymq.toml`; missing keys keep their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    /// Accepted `Connect` tokens. Empty accepts every client.
    pub allowed_tokens: Vec<String>,
    /// How often unacked deliveries are checked against their ack timeout.
    #[serde(
        rename = "ack_check_interval_ms",
        deserialize_with = "crate::config::duration_from_ms"
    )]
    pub ack_check_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_BROKER_PORT)),
            allowed_tokens: Vec::new(),
            ack_check_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame decode error: {0}")]
    FrameDecode(#[from] FrameDecodeError),

    #[error("frame encode error: {0}")]
    FrameEncode(#[from] FrameEncodeError),
}

/// Topic registry shared by every connection.
#[derive(Debug, Default)]
pub struct Broker {
    topics: DashMap<String, Arc<Topic>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(&self, name: &TopicName) -> Arc<Topic> {
        self.topics
            .entry(name.as_str().to_string())
            .or_insert_with(|| Arc::new(Topic::new(name.clone())))
            .value()
            .clone()
    }

    pub fn get_topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(|t| t.value().clone())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Redelivers every message whose ack deadline has passed. Returns how many were requeued.
    pub fn check_ack_timeouts(&self, now: Instant) -> usize {
        // Snapshot first so no map shard is held while subscription locks are taken.
        let topics: Vec<Arc<Topic>> = self.topics.iter().map(|t| t.value().clone()).collect();
        topics.iter().map(|t| t.check_ack_timeouts(now)).sum()
    }
}
