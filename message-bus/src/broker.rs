//! In-process event broker
//!
//! `topic -> subscriber -> bounded channel`. Publishing never blocks: each
//! subscriber gets a `try_send`, and a full channel is handled by the
//! configured [`SlowConsumerPolicy`] instead of stalling the publisher.

use crate::{
    metrics::{BROKER_DELIVERIES_TOTAL, BROKER_SUBSCRIBERS},
    types::*,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Receiving end of a subscription
#[derive(Debug)]
pub struct Subscription<E> {
    /// Handle for `unsubscribe`
    pub id: SubscriberId,
    /// Topic subscribed to
    pub topic: Topic,
    /// Event channel; yields `None` once unsubscribed or the broker shuts down
    pub receiver: mpsc::Receiver<E>,
}

impl<E> Subscription<E> {
    /// Next event
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }
}

/// Pub/sub broker, injected explicitly into publishers
pub struct Broker<E> {
    subs: RwLock<HashMap<Topic, HashMap<SubscriberId, mpsc::Sender<E>>>>,
    next_id: AtomicU64,
    config: BrokerConfig,
    closed: AtomicBool,
}

impl<E> std::fmt::Debug for Broker<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("topics", &self.subs.read().len())
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<E: Clone + Send + 'static> Broker<E> {
    /// Create broker
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            subs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe with a channel of the configured capacity
    pub fn subscribe(&self, topic: impl Into<Topic>) -> Subscription<E> {
        let topic = topic.into();
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let id = self.subscribe_with(topic.clone(), sender);
        Subscription {
            id,
            topic,
            receiver,
        }
    }

    /// Subscribe an existing channel. After shutdown the sender is dropped
    /// right away, so its receiver sees the channel close.
    pub fn subscribe_with(&self, topic: impl Into<Topic>, sender: mpsc::Sender<E>) -> SubscriberId {
        let topic = topic.into();
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let mut subs = self.subs.write();
        if self.closed.load(Ordering::SeqCst) {
            return id;
        }
        subs.entry(topic.clone()).or_default().insert(id, sender);
        BROKER_SUBSCRIBERS.inc();
        debug!(%topic, %id, "Subscribed");
        id
    }

    /// Remove a subscriber, closing its channel. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriberId, topic: &Topic) -> bool {
        let mut subs = self.subs.write();
        let removed = Self::remove_locked(&mut subs, id, topic);
        if removed {
            debug!(%topic, %id, "Unsubscribed");
        }
        removed
    }

    /// Subscribers currently registered on `topic`
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.subs.read().get(topic).map_or(0, HashMap::len)
    }

    /// Deliver `event` to every subscriber of `topic` without blocking
    pub fn publish(&self, topic: &Topic, event: E) -> PublishReport {
        let mut report = PublishReport::default();
        let mut to_remove = Vec::new();

        {
            let subs = self.subs.read();
            let Some(subscribers) = subs.get(topic) else {
                return report;
            };

            for (id, sender) in subscribers {
                match sender.try_send(event.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => match self.config.slow_consumer_policy {
                        SlowConsumerPolicy::DropEvent => {
                            warn!(%topic, %id, "Subscriber channel full, event dropped");
                            report.dropped += 1;
                        }
                        SlowConsumerPolicy::Disconnect => {
                            warn!(%topic, %id, "Subscriber channel full, disconnecting");
                            to_remove.push(*id);
                        }
                    },
                    Err(TrySendError::Closed(_)) => {
                        debug!(%topic, %id, "Subscriber gone, removing");
                        to_remove.push(*id);
                    }
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subs.write();
            for id in to_remove {
                if Self::remove_locked(&mut subs, id, topic) {
                    report.removed += 1;
                }
            }
        }

        BROKER_DELIVERIES_TOTAL
            .with_label_values(&["delivered"])
            .inc_by(report.delivered as f64);
        BROKER_DELIVERIES_TOTAL
            .with_label_values(&["dropped"])
            .inc_by(report.dropped as f64);
        BROKER_DELIVERIES_TOTAL
            .with_label_values(&["removed"])
            .inc_by(report.removed as f64);

        report
    }

    /// Drop every sender; all receivers drain and then see the channel close
    pub fn shutdown(&self) {
        let mut subs = self.subs.write();
        self.closed.store(true, Ordering::SeqCst);
        let count: usize = subs.values().map(HashMap::len).sum();
        subs.clear();
        BROKER_SUBSCRIBERS.sub(count as i64);
        debug!(subscribers = count, "Broker shut down");
    }

    fn remove_locked(
        subs: &mut HashMap<Topic, HashMap<SubscriberId, mpsc::Sender<E>>>,
        id: SubscriberId,
        topic: &Topic,
    ) -> bool {
        let Some(subscribers) = subs.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(&id).is_some();
        if subscribers.is_empty() {
            subs.remove(topic);
        }
        if removed {
            BROKER_SUBSCRIBERS.dec();
        }
        removed
    }
}
