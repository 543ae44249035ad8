//! In-process broker.
//!
//! Stands in for Redis when every "process" lives in the same binary, which
//! is how the test suite simulates several servers sharing one bus.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;

use super::{Broker, BrokerError, Subscription};

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Topic map of tokio broadcast channels.
pub struct InMemoryBroker {
    topics: DashMap<String, broadcast::Sender<Vec<u8>>>,
    capacity: usize,
    available: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity,
            available: AtomicBool::new(true),
        }
    }

    /// Number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Simulate an outage: publish and subscribe fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// End every subscription on a topic, as a dropped broker connection would.
    pub fn disconnect_topic(&self, topic: &str) {
        self.topics.remove(topic);
    }

    fn ensure_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker is offline".into()))
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_available()?;
        if let Some(tx) = self.topics.get(topic) {
            // No receivers is not an error for pub/sub
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        self.ensure_available()?;
        let rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let topic_name = topic.to_string();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let topic_name = topic_name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(topic = %topic_name, skipped, "Subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed();

        Ok(Subscription::new(topic, stream))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.ensure_available()
    }
}
