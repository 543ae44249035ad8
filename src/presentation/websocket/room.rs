//! Room
//!
//! The local side of one conversation on this process.
//!
//! A started room runs two tasks:
//!
//! - the **owner task** holds the client set, applies attach/detach
//!   commands and fans broker messages out to every attached client,
//!   the sender included;
//! - the **publish task** drains the room's outbound queue onto the broker
//!   topic named after the room.
//!
//! Only the owner task touches the client set, so attach, detach and
//! fan-out never race. The room stops, and drops its broker subscription,
//! as soon as its last client leaves, or when no client attaches within
//! `rooms.idle_timeout_ms` of it starting.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::client::{ClientHandle, Payload, SendOutcome};
use crate::config::RoomSettings;
use crate::domain::{InvalidRoomName, RoomName};
use crate::infrastructure::broker::{topics, Broker, Subscription};
use crate::infrastructure::metrics;

/// A locally originated message waiting to be published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub room_name: String,
    pub message: serde_json::Value,
}

/// Room errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Invalid room name: {0}")]
    InvalidName(#[from] InvalidRoomName),

    #[error("Room is closed")]
    Closed,

    #[error("Client is closed")]
    ClientClosed,

    #[error("Room not found")]
    NotFound,

    #[error("Not a participant of this room")]
    Forbidden,
}

pub(crate) enum RoomCommand {
    Attach {
        client: ClientHandle,
        ack: oneshot::Sender<Result<(), RoomError>>,
    },
    Detach {
        client_id: Uuid,
    },
    ClientCount {
        reply: oneshot::Sender<usize>,
    },
}

/// A room that has not been started yet.
pub struct Room {
    id: Uuid,
    name: RoomName,
    clients: HashMap<Uuid, ClientHandle>,
    outbound_tx: mpsc::Sender<BroadcastMessage>,
    outbound_rx: mpsc::Receiver<BroadcastMessage>,
    settings: RoomSettings,
}

impl Room {
    /// Create a room with default settings.
    pub fn new(name: &str) -> Result<Self, RoomError> {
        Self::with_settings(name, RoomSettings::default())
    }

    pub fn with_settings(name: &str, settings: RoomSettings) -> Result<Self, RoomError> {
        Ok(Self::from_name(RoomName::new(name)?, settings))
    }

    pub fn from_name(name: RoomName, settings: RoomSettings) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_capacity.max(1));
        Self {
            id: Uuid::new_v4(),
            name,
            clients: HashMap::new(),
            outbound_tx,
            outbound_rx,
            settings,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &RoomName {
        &self.name
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Start the owner and publish tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run(self, broker: Arc<dyn Broker>) -> RoomHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let handle = RoomHandle {
            id: self.id,
            name: self.name.clone(),
            commands: commands_tx.clone(),
            outbound: self.outbound_tx,
        };

        tokio::spawn(publish_loop(
            self.name.clone(),
            self.outbound_rx,
            broker.clone(),
            stop_rx,
        ));

        let owner = RoomOwner {
            id: self.id,
            name: self.name,
            clients: self.clients,
            commands: commands_rx,
            weak_commands: commands_tx.downgrade(),
            broker,
            settings: self.settings,
            _stop_publisher: stop_tx,
        };
        tokio::spawn(owner.run());

        metrics::room_started();
        info!(room = %handle.name, room_id = %handle.id, "Room started");
        handle
    }
}

/// Cheap, cloneable handle to a running room.
#[derive(Clone)]
pub struct RoomHandle {
    id: Uuid,
    name: RoomName,
    commands: mpsc::UnboundedSender<RoomCommand>,
    outbound: mpsc::Sender<BroadcastMessage>,
}

impl RoomHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &RoomName {
        &self.name
    }

    /// Attach a client. Resolves once the room has registered it.
    pub async fn attach(&self, client: ClientHandle) -> Result<(), RoomError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(RoomCommand::Attach { client, ack })
            .map_err(|_| RoomError::Closed)?;
        rx.await.map_err(|_| RoomError::Closed)?
    }

    pub fn detach(&self, client_id: Uuid) {
        let _ = self.commands.send(RoomCommand::Detach { client_id });
    }

    /// Queue a message for publication under this room's topic.
    ///
    /// Waits while the outbound queue is full.
    pub async fn broadcast(&self, message: serde_json::Value) -> Result<(), RoomError> {
        self.outbound
            .send(BroadcastMessage {
                room_name: self.name.to_string(),
                message,
            })
            .await
            .map_err(|_| RoomError::Closed)
    }

    pub async fn client_count(&self) -> Result<usize, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RoomCommand::ClientCount { reply })
            .map_err(|_| RoomError::Closed)?;
        rx.await.map_err(|_| RoomError::Closed)
    }

    /// Whether the owner task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Resolves once the owner task has stopped.
    pub async fn closed(&self) {
        self.commands.closed().await
    }
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct RoomOwner {
    id: Uuid,
    name: RoomName,
    clients: HashMap<Uuid, ClientHandle>,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
    weak_commands: mpsc::WeakUnboundedSender<RoomCommand>,
    broker: Arc<dyn Broker>,
    settings: RoomSettings,
    // Dropping this stops the publish task.
    _stop_publisher: oneshot::Sender<()>,
}

impl RoomOwner {
    async fn run(mut self) {
        // Commands queue up until the first subscription is in place, so an
        // attach only resolves once the room can receive traffic.
        let Some(subscription) = self.subscribe().await else {
            self.teardown("subscription unavailable");
            return;
        };
        let mut subscription = Some(subscription);
        let mut resubscribing: Option<BoxFuture<'static, Option<Subscription>>> = None;

        let idle = tokio::time::sleep(self.settings.idle_timeout());
        tokio::pin!(idle);

        let reason = loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break "all handles dropped";
                    };
                    if self.handle_command(command) == Flow::Stop {
                        break "last client left";
                    }
                }
                payload = next_payload(&mut subscription) => {
                    match payload {
                        Some(payload) => {
                            if self.fan_out(payload) == Flow::Stop {
                                break "last client left";
                            }
                        }
                        None => {
                            warn!(room = %self.name, "Broker subscription ended, resubscribing");
                            subscription = None;
                            resubscribing = Some(self.subscribe());
                        }
                    }
                }
                renewed = finish_resubscribe(&mut resubscribing) => {
                    resubscribing = None;
                    match renewed {
                        Some(renewed) => {
                            info!(room = %self.name, "Room resubscribed");
                            subscription = Some(renewed);
                        }
                        None => break "subscription unavailable",
                    }
                }
                _ = &mut idle, if self.clients.is_empty() => {
                    break "no client joined";
                }
            }
        };

        drop(subscription);
        drop(resubscribing);
        self.teardown(reason);
    }

    fn subscribe(&self) -> BoxFuture<'static, Option<Subscription>> {
        subscribe_with_retry(
            self.broker.clone(),
            self.name.clone(),
            self.settings.clone(),
        )
        .boxed()
    }

    fn handle_command(&mut self, command: RoomCommand) -> Flow {
        match command {
            RoomCommand::Attach { client, ack } => {
                // Bind before checking: a concurrent close either sees the
                // link and sends a detach, or we see it closed here.
                client.bind_room(self.name.as_str(), self.weak_commands.clone());
                if client.is_closed() {
                    client.unbind_room();
                    let _ = ack.send(Err(RoomError::ClientClosed));
                    return self.stop_if_empty();
                }

                debug!(
                    room = %self.name,
                    client_id = %client.id(),
                    user_id = client.user_id(),
                    role = %client.role(),
                    "Client attached"
                );
                self.clients.insert(client.id(), client);
                let _ = ack.send(Ok(()));
                Flow::Continue
            }
            RoomCommand::Detach { client_id } => {
                if let Some(client) = self.clients.remove(&client_id) {
                    debug!(room = %self.name, client_id = %client_id, "Client detached");
                    client.unbind_room();
                    client.close();
                }
                self.stop_if_empty()
            }
            RoomCommand::ClientCount { reply } => {
                let _ = reply.send(self.clients.len());
                Flow::Continue
            }
        }
    }

    /// Deliver a broker payload to every attached client without waiting.
    fn fan_out(&mut self, payload: Payload) -> Flow {
        let mut delivered = 0u64;
        let mut dropped = 0u64;
        let mut gone = Vec::new();

        for (client_id, client) in &self.clients {
            match client.send(payload.clone()) {
                SendOutcome::Accepted => delivered += 1,
                SendOutcome::Dropped => {
                    dropped += 1;
                    warn!(
                        room = %self.name,
                        client_id = %client_id,
                        "Client queue full, message dropped"
                    );
                }
                SendOutcome::Closed => gone.push(*client_id),
            }
        }
        metrics::record_fanout(delivered, dropped);

        if gone.is_empty() {
            return Flow::Continue;
        }
        for client_id in gone {
            self.clients.remove(&client_id);
        }
        self.stop_if_empty()
    }

    fn stop_if_empty(&self) -> Flow {
        if self.clients.is_empty() {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    fn teardown(&mut self, reason: &str) {
        for (_, client) in self.clients.drain() {
            client.unbind_room();
            client.close();
        }
        metrics::room_stopped();
        info!(room = %self.name, room_id = %self.id, reason, "Room stopped");
    }
}

async fn next_payload(subscription: &mut Option<Subscription>) -> Option<Payload> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn finish_resubscribe(
    pending: &mut Option<BoxFuture<'static, Option<Subscription>>>,
) -> Option<Subscription> {
    match pending {
        Some(pending) => pending.await,
        None => std::future::pending().await,
    }
}

/// Subscribe to the room topic, backing off exponentially between attempts.
async fn subscribe_with_retry(
    broker: Arc<dyn Broker>,
    name: RoomName,
    settings: RoomSettings,
) -> Option<Subscription> {
    let max_retries = settings.subscribe_max_retries;
    let mut attempt = 0;
    loop {
        match broker.subscribe(topics::room(name.as_str())).await {
            Ok(subscription) => return Some(subscription),
            Err(e) if attempt >= max_retries => {
                error!(room = %name, error = %e, attempts = attempt + 1, "Giving up on room subscription");
                return None;
            }
            Err(e) => {
                let delay = settings.backoff_for(attempt);
                warn!(
                    room = %name,
                    error = %e,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Room subscription failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Drain the outbound queue onto the broker until the owner task stops.
async fn publish_loop(
    name: RoomName,
    mut outbound: mpsc::Receiver<BroadcastMessage>,
    broker: Arc<dyn Broker>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => publish(&name, broker.as_ref(), message).await,
                None => return,
            },
            _ = &mut stop => break,
        }
    }

    // Flush what was queued before the room stopped.
    outbound.close();
    while let Some(message) = outbound.recv().await {
        publish(&name, broker.as_ref(), message).await;
    }
}

async fn publish(name: &RoomName, broker: &dyn Broker, message: BroadcastMessage) {
    let payload = match serde_json::to_vec(&message.message) {
        Ok(payload) => payload,
        Err(e) => {
            metrics::record_publish_failure("serialization");
            warn!(room = %name, error = %e, "Failed to encode broadcast message, dropping");
            return;
        }
    };

    if let Err(e) = broker.publish(topics::room(name.as_str()), payload).await {
        metrics::record_publish_failure("broker");
        warn!(room = %name, error = %e, "Failed to publish room message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Role;
    use crate::presentation::websocket::client::ClientReceiver;
    use crate::infrastructure::broker::InMemoryBroker;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn fast_settings() -> RoomSettings {
        RoomSettings {
            subscribe_max_retries: 2,
            subscribe_backoff_ms: 1,
            ..RoomSettings::default()
        }
    }

    async fn recv_json(rx: &mut ClientReceiver) -> serde_json::Value {
        let payload = timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for payload")
            .expect("client queue closed");
        serde_json::from_slice(&payload).unwrap()
    }

    async fn wait_for_subscribers(broker: &InMemoryBroker, topic: &str, expected: usize) {
        timeout(WAIT, async {
            while broker.subscriber_count(topic) != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber count never reached expected value");
    }

    #[test]
    fn test_new_room_is_empty() {
        let room = Room::new("support-42").unwrap();
        assert_eq!(room.name().as_str(), "support-42");
        assert_eq!(room.client_count(), 0);
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let result = Room::new("");
        assert!(matches!(
            result,
            Err(RoomError::InvalidName(InvalidRoomName::Empty))
        ));
    }

    #[tokio::test]
    async fn test_message_reaches_every_client_including_sender() {
        let broker = Arc::new(InMemoryBroker::new());
        let room = Room::new("support-42").unwrap().run(broker.clone());

        let (customer, mut customer_rx) = ClientHandle::new(1, Role::Customer, 16);
        let (agent, mut agent_rx) = ClientHandle::new(2, Role::Agent, 16);
        room.attach(customer.clone()).await.unwrap();
        room.attach(agent.clone()).await.unwrap();

        room.broadcast(json!({"text": "hello"})).await.unwrap();

        assert_eq!(recv_json(&mut customer_rx).await, json!({"text": "hello"}));
        assert_eq!(recv_json(&mut agent_rx).await, json!({"text": "hello"}));
    }

    #[tokio::test]
    async fn test_full_client_does_not_stall_others() {
        let broker = Arc::new(InMemoryBroker::new());
        let room = Room::new("support-slow").unwrap().run(broker.clone());

        let (slow, mut slow_rx) = ClientHandle::new(1, Role::Customer, 2);
        let (fast, mut fast_rx) = ClientHandle::new(2, Role::Agent, 16);
        room.attach(slow).await.unwrap();
        room.attach(fast).await.unwrap();

        for i in 0..5 {
            room.broadcast(json!({ "seq": i })).await.unwrap();
        }

        for i in 0..5 {
            assert_eq!(recv_json(&mut fast_rx).await, json!({ "seq": i }));
        }

        // The slow client kept the oldest messages; newer ones were dropped.
        assert_eq!(recv_json(&mut slow_rx).await, json!({ "seq": 0 }));
        assert_eq!(recv_json(&mut slow_rx).await, json!({ "seq": 1 }));
        assert_eq!(slow_rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_last_detach_stops_room_and_subscription() {
        let broker = Arc::new(InMemoryBroker::new());
        let room = Room::new("support-7").unwrap().run(broker.clone());

        let (client, mut rx) = ClientHandle::new(1, Role::Customer, 16);
        room.attach(client.clone()).await.unwrap();
        assert_eq!(broker.subscriber_count("support-7"), 1);

        assert!(client.close());

        timeout(WAIT, room.closed()).await.expect("room did not stop");
        assert!(room.is_closed());
        assert_eq!(broker.subscriber_count("support-7"), 0);
        assert_eq!(rx.recv().await, None);
        let (late, _late_rx) = ClientHandle::new(2, Role::Agent, 16);
        assert_eq!(room.attach(late).await, Err(RoomError::Closed));
    }

    #[tokio::test]
    async fn test_detach_keeps_room_while_clients_remain() {
        let broker = Arc::new(InMemoryBroker::new());
        let room = Room::new("support-8").unwrap().run(broker.clone());

        let (first, _first_rx) = ClientHandle::new(1, Role::Customer, 16);
        let (second, mut second_rx) = ClientHandle::new(2, Role::Agent, 16);
        room.attach(first.clone()).await.unwrap();
        room.attach(second).await.unwrap();

        first.close();
        room.broadcast(json!({"text": "still here"})).await.unwrap();

        assert_eq!(recv_json(&mut second_rx).await, json!({"text": "still here"}));
        assert_eq!(room.client_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_closed_client_cannot_attach() {
        let broker = Arc::new(InMemoryBroker::new());
        let room = Room::new("support-9").unwrap().run(broker);

        let (client, _rx) = ClientHandle::new(1, Role::Customer, 16);
        client.close();

        assert_eq!(room.attach(client).await, Err(RoomError::ClientClosed));
    }

    #[tokio::test]
    async fn test_subscribe_failure_tears_room_down() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_available(false);

        let room = Room::with_settings("support-down", fast_settings())
            .unwrap()
            .run(broker.clone());
        let (client, mut rx) = ClientHandle::new(1, Role::Customer, 16);
        let attach = room.attach(client.clone());

        assert_eq!(timeout(WAIT, attach).await.unwrap(), Err(RoomError::Closed));
        timeout(WAIT, room.closed()).await.expect("room did not stop");
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_room_resubscribes_after_broker_disconnect() {
        let broker = Arc::new(InMemoryBroker::new());
        let room = Room::with_settings("support-flaky", fast_settings())
            .unwrap()
            .run(broker.clone());
        let (client, mut rx) = ClientHandle::new(1, Role::Customer, 16);
        room.attach(client).await.unwrap();

        broker.disconnect_topic("support-flaky");
        wait_for_subscribers(&broker, "support-flaky", 1).await;

        room.broadcast(json!({"text": "back"})).await.unwrap();
        assert_eq!(recv_json(&mut rx).await, json!({"text": "back"}));
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_stop_publishing() {
        let broker = Arc::new(InMemoryBroker::new());
        let room = Room::new("support-pub").unwrap().run(broker.clone());
        let (client, mut rx) = ClientHandle::new(1, Role::Customer, 16);
        room.attach(client).await.unwrap();

        broker.set_available(false);
        room.broadcast(json!({"text": "lost"})).await.unwrap();
        // Let the publish task consume the message while the broker is down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.set_available(true);
        room.broadcast(json!({"text": "delivered"})).await.unwrap();

        assert_eq!(recv_json(&mut rx).await, json!({"text": "delivered"}));
    }

    #[tokio::test]
    async fn test_room_without_clients_stops_and_unsubscribes() {
        let broker = Arc::new(InMemoryBroker::new());
        let settings = RoomSettings {
            idle_timeout_ms: 20,
            ..RoomSettings::default()
        };
        let room = Room::with_settings("support-empty", settings)
            .unwrap()
            .run(broker.clone());

        timeout(WAIT, room.closed()).await.expect("idle room kept running");
        assert_eq!(broker.subscriber_count("support-empty"), 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_does_not_stop_occupied_room() {
        let broker = Arc::new(InMemoryBroker::new());
        let settings = RoomSettings {
            idle_timeout_ms: 20,
            ..RoomSettings::default()
        };
        let room = Room::with_settings("support-busy", settings)
            .unwrap()
            .run(broker.clone());
        let (client, mut rx) = ClientHandle::new(1, Role::Customer, 16);
        room.attach(client).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(!room.is_closed());
        room.broadcast(json!({"text": "still open"})).await.unwrap();
        assert_eq!(recv_json(&mut rx).await, json!({"text": "still open"}));
    }

    #[tokio::test]
    async fn test_commands_are_served_while_resubscribing() {
        let broker = Arc::new(InMemoryBroker::new());
        let settings = RoomSettings {
            subscribe_backoff_ms: 200,
            ..RoomSettings::default()
        };
        let room = Room::with_settings("support-retry", settings)
            .unwrap()
            .run(broker.clone());
        let (first, mut first_rx) = ClientHandle::new(1, Role::Customer, 16);
        room.attach(first).await.unwrap();

        broker.set_available(false);
        broker.disconnect_topic("support-retry");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (second, mut second_rx) = ClientHandle::new(2, Role::Agent, 16);
        timeout(Duration::from_millis(100), room.attach(second))
            .await
            .expect("attach waited for the resubscribe backoff")
            .unwrap();
        assert_eq!(room.client_count().await.unwrap(), 2);

        broker.set_available(true);
        wait_for_subscribers(&broker, "support-retry", 1).await;
        room.broadcast(json!({"text": "back"})).await.unwrap();

        assert_eq!(recv_json(&mut first_rx).await, json!({"text": "back"}));
        assert_eq!(recv_json(&mut second_rx).await, json!({"text": "back"}));
    }
}
