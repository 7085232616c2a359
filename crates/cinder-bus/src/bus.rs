//! Topic and label routed pub/sub over bounded channels.

use crate::config::BusConfig;
use crate::metrics::BusMetrics;
use cinder_core::events::{LabelFilter, Message};
use cinder_core::ids::SubscriptionId;
use cinder_core::ports::{EventBus, Subscription};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

struct Subscriber {
    id: SubscriptionId,
    filter: LabelFilter,
    tx: mpsc::Sender<Message>,
}

/// Event bus that fans messages out to in-process subscribers.
///
/// Every subscriber owns a bounded buffer. `publish` never waits: a full buffer
/// loses the message for that subscriber only, and a closed one is pruned.
#[derive(Clone)]
pub struct InMemoryEventBus {
    config: BusConfig,
    topics: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
    metrics: Arc<BusMetrics>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self {
            config,
            topics: Arc::new(RwLock::new(HashMap::new())),
            metrics: BusMetrics::new(),
        }
    }

    pub fn metrics(&self) -> Arc<BusMetrics> {
        self.metrics.clone()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }

    fn prune(&self, topic: &str, closed: &[SubscriptionId]) {
        let mut topics = self.topics.write();
        if let Some(subs) = topics.get_mut(topic) {
            let before = subs.len();
            subs.retain(|s| !closed.contains(&s.id));
            self.metrics.subscribers_removed((before - subs.len()) as u64);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, topic: &str, message: Message) {
        self.metrics.record_publish();

        let mut closed = Vec::new();
        {
            let topics = self.topics.read();
            let Some(subs) = topics.get(topic) else {
                trace!(topic, "no subscribers");
                return;
            };
            for sub in subs.iter().filter(|s| s.filter.matches(&message.labels)) {
                match sub.tx.try_send(message.clone()) {
                    Ok(()) => self.metrics.record_delivery(),
                    Err(TrySendError::Full(_)) => {
                        self.metrics.record_drop();
                        debug!(topic, subscription = %sub.id, "subscriber buffer full, dropping message");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(sub.id),
                }
            }
        }

        if !closed.is_empty() {
            self.prune(topic, &closed);
        }
    }

    fn subscribe(&self, topic: &str, filter: LabelFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.buffer_size);
        let id = SubscriptionId::new();

        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, filter, tx });
        self.metrics.subscriber_added();
        debug!(topic, subscription = %id, "subscribed");

        Subscription {
            id,
            stream: Box::pin(ReceiverStream::new(rx)),
        }
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut topics = self.topics.write();
        let mut removed = 0;
        topics.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed += before - subs.len();
            !subs.is_empty()
        });
        self.metrics.subscribers_removed(removed as u64);
        if removed > 0 {
            debug!(subscription = %id, "unsubscribed");
        }
    }
}
