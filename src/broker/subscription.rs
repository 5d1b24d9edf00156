use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::core::subscription::SubscriptionType;
use crate::net::frame::{Frame, FrameType, MessageMetadata, MessagePayload, MAX_PAYLOAD_LEN};

/// Frames queued for one client connection's writer task.
pub type Outbound = mpsc::UnboundedSender<Frame>;

/// Identifies a consumer across connections: consumer ids are only unique per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerKey {
    pub conn_id: u64,
    pub consumer_id: u64,
}

/// A published message, shared by every subscription of its topic.
#[derive(Debug)]
pub struct StoredMessage {
    pub message_id: u64,
    pub publish_time: u64,
    pub metadata: MessageMetadata,
    pub payload: Bytes,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("exclusive subscription `{0}` already has a consumer")]
    Busy(String),

    #[error("subscription `{name}` is {existing}, not {requested}")]
    TypeMismatch {
        name: String,
        existing: SubscriptionType,
        requested: SubscriptionType,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnsubscribeError {
    #[error("consumer is not attached to subscription `{0}`")]
    NotAttached(String),

    #[error("subscription `{name}` still has {others} other consumer(s)")]
    Busy { name: String, others: usize },
}

#[derive(Debug, Clone)]
struct QueueEntry {
    message: Arc<StoredMessage>,
    redelivery_count: u32,
}

#[derive(Debug)]
struct Inflight {
    entry: QueueEntry,
    consumer: ConsumerKey,
    deadline: Option<Instant>,
}

#[derive(Debug)]
struct ConsumerSlot {
    key: ConsumerKey,
    name: String,
    permits: u32,
    ack_timeout: Option<Duration>,
    outbound: Outbound,
}

/// One named cursor over a topic. Every subscription sees every message
/// published after it was created; its consumers split them according to
/// the subscription type.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    inner: Mutex<SubscriptionInner>,
}

#[derive(Debug)]
struct SubscriptionInner {
    sub_type: SubscriptionType,
    pending: VecDeque<QueueEntry>,
    inflight: HashMap<u64, Inflight>,
    /// Attach order; the head is the active consumer for exclusive and failover.
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

impl Subscription {
    pub fn new(name: impl Into<String>, sub_type: SubscriptionType) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(SubscriptionInner {
                sub_type,
                pending: VecDeque::new(),
                inflight: HashMap::new(),
                consumers: Vec::new(),
                cursor: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscription_type(&self) -> SubscriptionType {
        self.inner.lock().sub_type
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    /// Messages waiting for a consumer with permits.
    pub fn backlog(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Messages delivered and not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.inner.lock().inflight.len()
    }

    /// Attaches a consumer. The subscription adopts the requested type when
    /// it has no consumers; otherwise the types must match.
    pub fn attach(
        &self,
        key: ConsumerKey,
        consumer_name: impl Into<String>,
        requested: SubscriptionType,
        ack_timeout: Option<Duration>,
        outbound: Outbound,
    ) -> Result<(), AttachError> {
        let mut inner = self.inner.lock();
        if inner.sub_type != requested {
            if !inner.consumers.is_empty() {
                return Err(AttachError::TypeMismatch {
                    name: self.name.clone(),
                    existing: inner.sub_type,
                    requested,
                });
            }
            inner.sub_type = requested;
        }
        if requested == SubscriptionType::Exclusive && !inner.consumers.is_empty() {
            return Err(AttachError::Busy(self.name.clone()));
        }

        let name = consumer_name.into();
        debug!(subscription = %self.name, consumer = %name, "consumer attached");
        inner.consumers.push(ConsumerSlot {
            key,
            name,
            permits: 0,
            ack_timeout,
            outbound,
        });
        Ok(())
    }

    /// Detaches a consumer and hands its unacked messages to whoever remains.
    pub fn detach(&self, key: ConsumerKey) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.consumers.len();
        inner.consumers.retain(|c| c.key != key);
        if inner.consumers.len() == before {
            return false;
        }

        let requeued = inner.requeue(|f| f.consumer == key);
        debug!(subscription = %self.name, requeued, "consumer detached");
        inner.dispatch(&self.name);
        true
    }

    /// Detaches the last consumer and discards everything queued or in flight.
    /// Fails while other consumers are still attached.
    pub fn unsubscribe(&self, key: ConsumerKey) -> Result<(), UnsubscribeError> {
        let mut inner = self.inner.lock();
        if !inner.consumers.iter().any(|c| c.key == key) {
            return Err(UnsubscribeError::NotAttached(self.name.clone()));
        }
        if inner.consumers.len() > 1 {
            return Err(UnsubscribeError::Busy {
                name: self.name.clone(),
                others: inner.consumers.len() - 1,
            });
        }

        let discarded = inner.pending.len() + inner.inflight.len();
        inner.consumers.clear();
        inner.pending.clear();
        inner.inflight.clear();
        debug!(subscription = %self.name, discarded, "unsubscribed");
        Ok(())
    }

    pub fn enqueue(&self, message: Arc<StoredMessage>) {
        let mut inner = self.inner.lock();
        inner.pending.push_back(QueueEntry {
            message,
            redelivery_count: 0,
        });
        inner.dispatch(&self.name);
    }

    pub fn flow(&self, key: ConsumerKey, permits: u32) -> bool {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.consumers.iter_mut().find(|c| c.key == key) else {
            return false;
        };
        slot.permits = slot.permits.saturating_add(permits);
        trace!(subscription = %self.name, consumer = %slot.name, permits = slot.permits, "flow");
        inner.dispatch(&self.name);
        true
    }

    /// Removes an in-flight message. Only the consumer it was delivered to may ack it.
    pub fn ack(&self, key: ConsumerKey, message_id: u64) -> bool {
        let mut inner = self.inner.lock();
        let owned = inner
            .inflight
            .get(&message_id)
            .is_some_and(|f| f.consumer == key);
        if owned {
            inner.inflight.remove(&message_id);
        }
        owned
    }

    pub fn redeliver_unacknowledged(&self, key: ConsumerKey) -> usize {
        let mut inner = self.inner.lock();
        let requeued = inner.requeue(|f| f.consumer == key);
        if requeued > 0 {
            inner.dispatch(&self.name);
        }
        requeued
    }

    /// Requeues messages whose ack deadline has passed.
    pub fn check_ack_timeouts(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let requeued = inner.requeue(|f| f.deadline.is_some_and(|d| d <= now));
        if requeued > 0 {
            debug!(subscription = %self.name, requeued, "ack timeout expired");
            inner.dispatch(&self.name);
        }
        requeued
    }
}

impl SubscriptionInner {
    /// Moves matching in-flight messages back to the head of the queue, oldest first.
    fn requeue(&mut self, matches: impl Fn(&Inflight) -> bool) -> usize {
        let ids: Vec<u64> = self
            .inflight
            .iter()
            .filter(|(_, f)| matches(f))
            .map(|(id, _)| *id)
            .collect();

        let mut entries: Vec<QueueEntry> = ids
            .into_iter()
            .filter_map(|id| self.inflight.remove(&id))
            .map(|f| {
                let mut entry = f.entry;
                entry.redelivery_count = entry.redelivery_count.saturating_add(1);
                entry
            })
            .collect();
        entries.sort_by_key(|e| e.message.message_id);

        let count = entries.len();
        for entry in entries.into_iter().rev() {
            self.pending.push_front(entry);
        }
        count
    }

    fn dispatch(&mut self, sub_name: &str) {
        if self.consumers.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut idx = 0;
        while idx < self.pending.len() {
            let key_slot = self.pending[idx]
                .message
                .metadata
                .key
                .as_deref()
                .map(|k| key_slot(k, self.consumers.len()));

            let Some(target) = self.pick_consumer(key_slot) else {
                // Key-shared messages for other consumers may still be deliverable.
                if self.sub_type == SubscriptionType::KeyShared {
                    idx += 1;
                    continue;
                }
                break;
            };

            let Some(entry) = self.pending.remove(idx) else {
                break;
            };
            if let Err(entry) = self.deliver(target, entry, now, sub_name) {
                self.pending.insert(idx, entry);
            }
        }
    }

    fn pick_consumer(&mut self, key_slot: Option<usize>) -> Option<usize> {
        match self.sub_type {
            SubscriptionType::Exclusive | SubscriptionType::Failover => {
                (self.consumers[0].permits > 0).then_some(0)
            }
            SubscriptionType::Shared => self.next_round_robin(),
            SubscriptionType::KeyShared => match key_slot {
                Some(slot) => (self.consumers[slot].permits > 0).then_some(slot),
                None => self.next_round_robin(),
            },
        }
    }

    fn next_round_robin(&mut self) -> Option<usize> {
        let len = self.consumers.len();
        for offset in 0..len {
            let i = (self.cursor + offset) % len;
            if self.consumers[i].permits > 0 {
                self.cursor = (i + 1) % len;
                return Some(i);
            }
        }
        None
    }

    fn deliver(
        &mut self,
        target: usize,
        entry: QueueEntry,
        now: Instant,
        sub_name: &str,
    ) -> Result<(), QueueEntry> {
        let slot = &mut self.consumers[target];
        let message = &entry.message;
        let payload = MessagePayload {
            consumer_id: slot.key.consumer_id,
            message_id: message.message_id,
            redelivery_count: entry.redelivery_count,
            publish_time: message.publish_time,
            metadata: message.metadata.clone(),
            message: message.payload.clone(),
        }
        .encode();

        let payload = match payload {
            Ok(p) if p.len() <= MAX_PAYLOAD_LEN => p,
            Ok(p) => {
                warn!(subscription = %sub_name, message_id = message.message_id, len = p.len(), "dropping message larger than a frame");
                return Ok(());
            }
            Err(err) => {
                warn!(subscription = %sub_name, message_id = message.message_id, error = %err, "dropping undeliverable message");
                return Ok(());
            }
        };

        if slot
            .outbound
            .send(Frame::new(FrameType::Message, 0, payload))
            .is_err()
        {
            // Writer is gone; the connection will detach this consumer shortly.
            slot.permits = 0;
            return Err(entry);
        }

        slot.permits -= 1;
        trace!(subscription = %sub_name, consumer = %slot.name, message_id = message.message_id, "delivered");
        let deadline = slot.ack_timeout.map(|t| now + t);
        self.inflight.insert(
            message.message_id,
            Inflight {
                consumer: slot.key,
                deadline,
                entry,
            },
        );
        Ok(())
    }
}

fn key_slot(key: &str, consumers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % consumers as u64) as usize
}
