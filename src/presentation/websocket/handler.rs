//! WebSocket Connection Handler
//!
//! Drives one support-chat connection: Hello, Identify, Ready, then the
//! request-agent / join / message / end-conversation opcodes.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use uuid::Uuid;

use super::client::{ClientHandle, ClientReceiver, Payload};
use super::directory::AssignmentNotice;
use super::messages::{
    events, ConversationEndedPayload, ErrorPayload, GatewayReceive, GatewaySend, HelloPayload,
    IdentifyPayload, JoinRoomPayload, MessageCreatePayload, OpCode, ReadyPayload, ReadyUser,
    RoomAssignedPayload, RoomJoinedPayload, RoomMatchedPayload, SendMessagePayload,
};
use super::room::{RoomError, RoomHandle};
use super::session::SessionState;
use crate::domain::{Role, User};
use crate::infrastructure::broker::{topics, Subscription};
use crate::infrastructure::metrics;
use crate::startup::AppState;

/// Frames buffered between the connection task and the socket writer.
const WRITER_QUEUE_CAPACITY: usize = 64;

/// Extra time a client gets beyond the advertised heartbeat interval.
const HEARTBEAT_GRACE_MS: u64 = 10_000;

/// JWT claims for token validation
#[derive(Debug, serde::Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

enum Outgoing {
    Frame(GatewaySend),
    /// Pre-encoded room traffic, forwarded as is
    Raw(Payload),
}

/// The socket writer has gone away.
#[derive(Debug)]
struct WriterClosed;

type SendResult = Result<(), WriterClosed>;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let max_message_size = state.settings.websocket.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    metrics::connection_opened();
    run_connection(socket, state).await;
    metrics::connection_closed();
}

async fn run_connection(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4().to_string();
    let mut session = SessionState::new(session_id.clone());

    tracing::debug!(session_id = %session_id, "New WebSocket connection");

    let (mut sink, mut stream) = socket.split();

    let heartbeat_interval_ms = state.settings.websocket.heartbeat_interval_ms;
    let hello = GatewaySend::op(
        OpCode::Hello,
        serde_json::to_value(HelloPayload {
            heartbeat_interval: heartbeat_interval_ms,
        })
        .ok(),
    );
    let hello = match serde_json::to_string(&hello) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode Hello: {}", e);
            return;
        }
    };
    if let Err(e) = sink.send(Message::Text(hello.into())).await {
        tracing::error!("Failed to send Hello: {}", e);
        return;
    }

    let (tx, mut rx) = mpsc::channel::<Outgoing>(WRITER_QUEUE_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(outgoing) = rx.recv().await {
            let text = match outgoing {
                Outgoing::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {}", e);
                        continue;
                    }
                },
                Outgoing::Raw(payload) => match String::from_utf8(payload) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Dropping non UTF-8 room payload: {}", e);
                        continue;
                    }
                },
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let identify = timeout(
        state.settings.websocket.identify_timeout(),
        wait_for_identify(&mut stream),
    )
    .await;

    let identify = match identify {
        Ok(Some(identify)) => identify,
        Ok(None) => {
            tracing::debug!(session_id = %session_id, "Connection closed before Identify");
            drop(tx);
            let _ = writer.await;
            return;
        }
        Err(_) => {
            tracing::debug!(session_id = %session_id, "Identify timeout");
            reject(tx, writer).await;
            return;
        }
    };

    let user = match identify_user(&identify.token, &state).await {
        Ok(user) => user,
        Err(e) => {
            tracing::debug!(session_id = %session_id, error = %e, "Identify rejected");
            reject(tx, writer).await;
            return;
        }
    };

    session.identify(user.id);

    let mut conn = Connection::new(state, session, user, tx);

    let ready = ReadyPayload {
        v: 1,
        user: ReadyUser {
            id: conn.user.id.to_string(),
            name: conn.user.name.clone(),
            role: conn.user.role(),
        },
        session_id: session_id.clone(),
        room: conn.user.room_name.clone(),
    };
    if conn.dispatch(events::READY, &ready).await.is_err() {
        drop(conn);
        let _ = writer.await;
        return;
    }

    tracing::info!(
        user_id = conn.user.id,
        role = %conn.user.role(),
        session_id = %session_id,
        "User connected and identified"
    );

    let mut notices = conn.subscribe_notices().await;

    let heartbeat_timeout_ms = heartbeat_interval_ms + HEARTBEAT_GRACE_MS;
    let mut heartbeat_check = interval(Duration::from_millis(heartbeat_timeout_ms));
    heartbeat_check.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if conn.handle_message(text.as_str()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(session_id = %session_id, "Connection closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %session_id, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }

            payload = next_room_payload(&mut conn.receiver) => {
                let result = match payload {
                    Some(payload) => conn.forward(payload).await,
                    None => conn.room_closed().await,
                };
                if result.is_err() {
                    break;
                }
            }

            notice = next_notice(&mut notices) => {
                match notice {
                    Some(payload) => {
                        if conn.handle_assignment(&payload).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        tracing::warn!(session_id = %session_id, "Assignment notices ended, resubscribing");
                        notices = conn.subscribe_notices().await;
                    }
                }
            }

            _ = heartbeat_check.tick() => {
                if !conn.session.is_alive(heartbeat_timeout_ms) {
                    tracing::info!(
                        session_id = %session_id,
                        "Heartbeat timeout, closing connection"
                    );
                    break;
                }
            }
        }
    }

    let user_id = conn.user.id;
    conn.disconnect().await;
    drop(conn);
    drop(notices);
    let _ = writer.await;

    tracing::info!(
        user_id = user_id,
        session_id = %session_id,
        "User disconnected"
    );
}

async fn wait_for_identify(stream: &mut SplitStream<WebSocket>) -> Option<IdentifyPayload> {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let Ok(frame) = serde_json::from_str::<GatewayReceive>(text.as_str()) else {
                    continue;
                };
                if OpCode::from_u8(frame.op) != Some(OpCode::Identify) {
                    continue;
                }
                if let Some(identify) = frame
                    .d
                    .and_then(|d| serde_json::from_value::<IdentifyPayload>(d).ok())
                {
                    return Some(identify);
                }
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => continue,
        }
    }
    None
}

async fn reject(tx: mpsc::Sender<Outgoing>, writer: JoinHandle<()>) {
    let _ = tx
        .send(Outgoing::Frame(GatewaySend::op(
            OpCode::InvalidSession,
            Some(json!(false)),
        )))
        .await;
    drop(tx);
    let _ = writer.await;
}

/// Validate JWT token and return user ID
fn validate_token(token: &str, secret: &str) -> Result<i64, String> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| format!("Invalid token: {}", e))?;

    token_data
        .claims
        .sub
        .parse::<i64>()
        .map_err(|e| format!("Invalid user ID in token: {}", e))
}

async fn identify_user(token: &str, state: &AppState) -> Result<User, String> {
    let user_id = validate_token(token, &state.settings.jwt.secret)?;
    state
        .users
        .find_by_id(user_id)
        .await
        .map_err(|e| format!("Database error: {}", e))?
        .ok_or_else(|| "User not found".to_string())
}

async fn next_room_payload(receiver: &mut Option<ClientReceiver>) -> Option<Payload> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_notice(subscription: &mut Option<Subscription>) -> Option<Payload> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

fn parse_payload<T: DeserializeOwned>(d: Option<serde_json::Value>) -> Result<T, ErrorPayload> {
    let d = d.ok_or_else(|| ErrorPayload::invalid_payload("Missing payload"))?;
    serde_json::from_value(d).map_err(|e| ErrorPayload::invalid_payload(e.to_string()))
}

struct Attachment {
    room: RoomHandle,
    client: ClientHandle,
}

/// State of one identified connection.
struct Connection {
    state: AppState,
    session: SessionState,
    user: User,
    tx: mpsc::Sender<Outgoing>,
    attachment: Option<Attachment>,
    receiver: Option<ClientReceiver>,
}

impl Connection {
    fn new(state: AppState, session: SessionState, user: User, tx: mpsc::Sender<Outgoing>) -> Self {
        Self {
            state,
            session,
            user,
            tx,
            attachment: None,
            receiver: None,
        }
    }

    async fn handle_message(&mut self, text: &str) -> SendResult {
        let frame: GatewayReceive = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                return self
                    .send_error(ErrorPayload::invalid_payload(format!("Invalid JSON: {}", e)))
                    .await
            }
        };

        match OpCode::from_u8(frame.op) {
            Some(OpCode::Heartbeat) => {
                self.session.heartbeat();
                tracing::trace!(session_id = %self.session.session_id, "Heartbeat received");
                self.send(GatewaySend::op(OpCode::HeartbeatAck, None)).await
            }
            Some(OpCode::RequestAgent) => self.request_agent().await,
            Some(OpCode::JoinRoom) => match parse_payload::<JoinRoomPayload>(frame.d) {
                Ok(payload) => self.join_room(&payload.room).await,
                Err(e) => self.send_error(e).await,
            },
            Some(OpCode::SendMessage) => match parse_payload::<SendMessagePayload>(frame.d) {
                Ok(payload) => self.send_message(payload.content).await,
                Err(e) => self.send_error(e).await,
            },
            Some(OpCode::EndConversation) => self.end_conversation().await,
            _ => {
                tracing::debug!(
                    session_id = %self.session.session_id,
                    op = frame.op,
                    "Unknown opcode"
                );
                Ok(())
            }
        }
    }

    async fn request_agent(&mut self) -> SendResult {
        if self.attachment.is_some() {
            return self.send_error(ErrorPayload::already_in_room()).await;
        }

        let (client, receiver) = self.new_client();
        let directory = self.state.directory.clone();
        match directory.create_room_for_match(&self.user, &client).await {
            Ok(matched) => {
                let payload = RoomMatchedPayload {
                    room: matched.room.name().to_string(),
                    agent_id: matched.allocation.agent.id.to_string(),
                    agent_name: matched.allocation.agent.name.clone(),
                };
                self.attach(matched.room, client, receiver);
                self.dispatch(events::ROOM_MATCHED, &payload).await
            }
            Err(e) => {
                tracing::debug!(user_id = self.user.id, error = %e, "Agent request failed");
                client.close();
                self.send_error((&e).into()).await
            }
        }
    }

    async fn join_room(&mut self, name: &str) -> SendResult {
        if self.attachment.is_some() {
            return self.send_error(ErrorPayload::already_in_room()).await;
        }

        let (client, receiver) = self.new_client();
        let directory = self.state.directory.clone();
        match directory.join_room(&self.user, &client, name).await {
            Ok(room) => {
                let payload = RoomJoinedPayload {
                    room: room.name().to_string(),
                };
                self.attach(room, client, receiver);
                self.dispatch(events::ROOM_JOINED, &payload).await
            }
            Err(e) => {
                tracing::debug!(user_id = self.user.id, room = name, error = %e, "Join failed");
                client.close();
                self.send_error((&e).into()).await
            }
        }
    }

    async fn send_message(&mut self, content: String) -> SendResult {
        let Some(attachment) = &self.attachment else {
            return self.send_error(ErrorPayload::not_in_room()).await;
        };
        if content.trim().is_empty() {
            return self
                .send_error(ErrorPayload::invalid_payload("Message content must not be empty"))
                .await;
        }

        let room = attachment.room.clone();
        let payload = MessageCreatePayload {
            room: room.name().to_string(),
            sender_id: self.user.id.to_string(),
            sender_role: self.user.role(),
            content,
            sent_at: chrono::Utc::now(),
        };
        self.broadcast(&room, events::MESSAGE_CREATE, &payload).await
    }

    async fn end_conversation(&mut self) -> SendResult {
        let Some(attachment) = &self.attachment else {
            return self.send_error(ErrorPayload::not_in_room()).await;
        };
        let room = attachment.room.clone();
        let name = room.name().to_string();

        let directory = self.state.directory.clone();
        if let Err(e) = directory.end_conversation(&self.user, &name).await {
            return self.send_error((&e).into()).await;
        }

        let payload = ConversationEndedPayload {
            room: name,
            ended_by: self.user.id.to_string(),
        };
        self.broadcast(&room, events::CONVERSATION_ENDED, &payload).await?;
        self.leave_room();
        self.dispatch(events::CONVERSATION_ENDED, &payload).await
    }

    /// Publish a dispatch frame to everyone in `room`.
    async fn broadcast<T: Serialize>(&mut self, room: &RoomHandle, t: &str, payload: &T) -> SendResult {
        let frame = GatewaySend::dispatch(t, payload).and_then(|frame| serde_json::to_value(&frame));
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(room = %room.name(), error = %e, "Failed to encode room event");
                return Ok(());
            }
        };

        if let Err(e) = room.broadcast(frame).await {
            if e == RoomError::Closed {
                self.leave_room();
            }
            return self.send_error((&e).into()).await;
        }
        Ok(())
    }

    /// Forward room traffic to the socket.
    async fn forward(&mut self, payload: Payload) -> SendResult {
        let ended = serde_json::from_slice::<GatewayReceive>(&payload)
            .ok()
            .and_then(|frame| frame.t)
            .as_deref()
            == Some(events::CONVERSATION_ENDED);

        self.tx
            .send(Outgoing::Raw(payload))
            .await
            .map_err(|_| WriterClosed)?;

        if ended {
            self.leave_room();
        }
        Ok(())
    }

    /// The room dropped this client, e.g. after losing its broker subscription.
    async fn room_closed(&mut self) -> SendResult {
        self.receiver = None;
        let Some(attachment) = self.attachment.take() else {
            return Ok(());
        };
        let room = attachment.room.name().to_string();
        self.session.room = None;

        tracing::warn!(user_id = self.user.id, room = %room, "Detached by room");
        self.send_error((&RoomError::Closed).into()).await
    }

    async fn handle_assignment(&mut self, payload: &[u8]) -> SendResult {
        let notice: AssignmentNotice = match serde_json::from_slice(payload) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!(user_id = self.user.id, error = %e, "Malformed assignment notice");
                return Ok(());
            }
        };

        self.dispatch(
            events::ROOM_ASSIGNED,
            &RoomAssignedPayload {
                room: notice.room.clone(),
                customer_id: notice.customer_id.to_string(),
            },
        )
        .await?;

        if self.attachment.is_none() {
            self.join_room(&notice.room).await?;
        }
        Ok(())
    }

    async fn subscribe_notices(&self) -> Option<Subscription> {
        if self.user.role() != Role::Agent {
            return None;
        }
        let topic = topics::agent(self.user.id);
        match self.state.directory.broker().subscribe(&topic).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                tracing::warn!(agent_id = self.user.id, error = %e, "Failed to subscribe to assignments");
                None
            }
        }
    }

    fn new_client(&self) -> (ClientHandle, ClientReceiver) {
        ClientHandle::new(
            self.user.id,
            self.user.role(),
            self.state.settings.rooms.queue_capacity(),
        )
    }

    fn attach(&mut self, room: RoomHandle, client: ClientHandle, receiver: ClientReceiver) {
        self.session.room = Some(room.name().to_string());
        self.attachment = Some(Attachment { room, client });
        self.receiver = Some(receiver);
    }

    fn leave_room(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            self.state.directory.leave(&attachment.client);
        }
        self.receiver = None;
        self.session.room = None;
    }

    /// Leave the current room. A departing agent is freed for new customers
    /// and the customer is told the conversation is over.
    async fn disconnect(&mut self) {
        let room = self.attachment.as_ref().map(|a| a.room.clone());
        if let Some(room) = room.filter(|_| self.user.role() == Role::Agent) {
            self.release_on_disconnect(&room).await;
        }
        self.leave_room();
    }

    async fn release_on_disconnect(&mut self, room: &RoomHandle) {
        let name = room.name().to_string();
        let released = self
            .state
            .directory
            .allocation()
            .release_agent(self.user.id, &name)
            .await;

        match released {
            Ok(true) => {
                tracing::info!(agent_id = self.user.id, room = %name, "Agent released on disconnect");
                let payload = ConversationEndedPayload {
                    room: name,
                    ended_by: self.user.id.to_string(),
                };
                // The socket may already be gone; only the room needs this.
                let _ = self.broadcast(room, events::CONVERSATION_ENDED, &payload).await;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(agent_id = self.user.id, room = %name, error = %e, "Failed to release agent"),
        }
    }

    async fn send(&self, frame: GatewaySend) -> SendResult {
        self.tx
            .send(Outgoing::Frame(frame))
            .await
            .map_err(|_| WriterClosed)
    }

    async fn dispatch<T: Serialize>(&mut self, t: &str, payload: &T) -> SendResult {
        match GatewaySend::dispatch(t, payload) {
            Ok(mut frame) => {
                frame.s = Some(self.session.next_sequence());
                self.send(frame).await
            }
            Err(e) => {
                tracing::error!(event = t, error = %e, "Failed to encode dispatch");
                Ok(())
            }
        }
    }

    async fn send_error(&mut self, error: ErrorPayload) -> SendResult {
        self.dispatch(events::ERROR, &error).await
    }
}
