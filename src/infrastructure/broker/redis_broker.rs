//! Redis pub/sub broker.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info, instrument};

use super::{Broker, BrokerError, Subscription};
use crate::config::RedisSettings;

/// Broker backed by Redis PUBLISH/SUBSCRIBE.
///
/// Publishing shares one auto-reconnecting `ConnectionManager`. Each
/// subscription owns a dedicated pub/sub connection, closed when the
/// subscription is dropped.
#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisBroker {
    #[instrument(skip(settings), fields(url = %settings.url))]
    pub async fn connect(settings: &RedisSettings) -> Result<Self, redis::RedisError> {
        info!("Connecting to Redis...");
        let client = Client::open(settings.url.as_str())?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        info!("Redis connection established");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        debug!(topic = %topic, "Subscribed to Redis channel");

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .boxed();

        Ok(Subscription::new(topic, stream))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.publisher.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
