//! Broker Module
//!
//! Publish/subscribe fan-out between server processes.
//!
//! Every process serving a participant of a conversation subscribes to the
//! topic named after the room; anything published there reaches all of
//! them, including the publisher itself.
//!
//! ```text
//! +-----------+   publish(room)   +--------+   message   +-----------+
//! | process A | ----------------> | broker | ----------> | process A |
//! +-----------+                   +--------+ ----------> | process B |
//!                                                        +-----------+
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use support_chat::infrastructure::broker::{Broker, RedisBroker};
//!
//! let broker = RedisBroker::connect(&settings.redis).await?;
//! let mut subscription = broker.subscribe("support-42").await?;
//! broker.publish("support-42", b"{\"text\":\"hello\"}".to_vec()).await?;
//! let payload = subscription.next().await;
//! ```

mod memory_broker;
mod redis_broker;

pub use memory_broker::InMemoryBroker;
pub use redis_broker::RedisBroker;

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

/// Broker failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        BrokerError::Unavailable(err.to_string())
    }
}

/// Publish/subscribe transport keyed by topic.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Open a long-lived subscription. Dropping it unsubscribes.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError>;

    /// Round-trip check used by readiness probes.
    async fn ping(&self) -> Result<(), BrokerError>;
}

/// Stream of payloads published to one topic.
///
/// The stream ends when the broker drops the subscription; the caller
/// decides whether to resubscribe.
pub struct Subscription {
    topic: String,
    stream: BoxStream<'static, Vec<u8>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, stream: BoxStream<'static, Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            stream,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Stream for Subscription {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Topic naming.
pub mod topics {
    /// Prefix for per-agent notification topics (e.g., "agent:42")
    pub const AGENT: &str = crate::domain::AGENT_TOPIC_PREFIX;

    /// Room traffic is published under the room name itself.
    #[inline]
    pub fn room(name: &str) -> &str {
        name
    }

    /// Topic an agent's connection listens on for new assignments.
    #[inline]
    pub fn agent(agent_id: i64) -> String {
        format!("{}{}", AGENT, agent_id)
    }
}
