use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::broker::subscription::{
    AttachError, ConsumerKey, Outbound, StoredMessage, Subscription, UnsubscribeError,
};
use crate::core::message::current_timestamp;
use crate::core::subscription::SubscriptionType;
use crate::core::topic::TopicName;
use crate::net::frame::MessageMetadata;

#[derive(Debug)]
pub struct Topic {
    name: TopicName,
    /// Next message id; held while fanning out so every subscription sees ids in order.
    next_message_id: Mutex<u64>,
    next_producer_seq: AtomicU64,
    subscriptions: DashMap<String, Arc<Subscription>>,
}

impl Topic {
    pub fn new(name: TopicName) -> Self {
        Self {
            name,
            next_message_id: Mutex::new(0),
            next_producer_seq: AtomicU64::new(0),
            subscriptions: DashMap::new(),
        }
    }

    pub fn name(&self) -> &TopicName {
        &self.name
    }

    /// Unique producer name of the form `<local-name>-<n>`.
    pub fn next_producer_name(&self) -> String {
        let seq = self.next_producer_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.name.local_name(), seq)
    }

    /// Stores a message in every subscription and returns its id. Without
    /// subscriptions the message is dropped.
    pub fn publish(&self, metadata: MessageMetadata, payload: Bytes) -> u64 {
        let mut next_id = self.next_message_id.lock();
        let message_id = *next_id;
        *next_id += 1;

        let message = Arc::new(StoredMessage {
            message_id,
            publish_time: current_timestamp(),
            metadata,
            payload,
        });

        let mut fanout = 0usize;
        for sub in self.subscriptions.iter() {
            sub.enqueue(message.clone());
            fanout += 1;
        }
        trace!(topic = %self.name, message_id, fanout, "published");
        message_id
    }

    /// Returns the named subscription, creating it with `sub_type` if needed.
    pub fn subscription(&self, name: &str, sub_type: SubscriptionType) -> Arc<Subscription> {
        self.subscriptions
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(topic = %self.name, subscription = name, %sub_type, "subscription created");
                Arc::new(Subscription::new(name, sub_type))
            })
            .value()
            .clone()
    }

    /// Attaches a consumer, creating the subscription with `sub_type` if needed.
    pub fn subscribe(
        &self,
        name: &str,
        sub_type: SubscriptionType,
        key: ConsumerKey,
        consumer_name: String,
        ack_timeout: Option<Duration>,
        outbound: Outbound,
    ) -> Result<Arc<Subscription>, AttachError> {
        // Attach under the map entry so a concurrent unsubscribe cannot remove it in between.
        let entry = self
            .subscriptions
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(topic = %self.name, subscription = name, %sub_type, "subscription created");
                Arc::new(Subscription::new(name, sub_type))
            });
        entry.attach(key, consumer_name, sub_type, ack_timeout, outbound)?;
        Ok(entry.value().clone())
    }

    /// Removes the subscription if `key` is its only consumer.
    pub fn unsubscribe(&self, name: &str, key: ConsumerKey) -> Result<(), UnsubscribeError> {
        let mut outcome = Err(UnsubscribeError::NotAttached(name.to_string()));
        self.subscriptions.remove_if(name, |_, sub| {
            outcome = sub.unsubscribe(key);
            outcome.is_ok()
        });
        if outcome.is_ok() {
            debug!(topic = %self.name, subscription = name, "subscription removed");
        }
        outcome
    }

    pub fn get_subscription(&self, name: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.get(name).map(|s| s.value().clone())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn check_ack_timeouts(&self, now: Instant) -> usize {
        self.subscriptions
            .iter()
            .map(|sub| sub.check_ack_timeouts(now))
            .sum()
    }
}
