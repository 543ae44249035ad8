//! WebSocket Message Types
//!
//! Gateway frames and payloads exchanged with support-chat clients.

use serde::{Deserialize, Serialize};

use super::directory::DirectoryError;
use super::room::RoomError;
use crate::application::services::AllocationError;
use crate::domain::Role;

/// Gateway opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Event dispatch
    Dispatch = 0,
    /// Heartbeat
    Heartbeat = 1,
    /// Identify
    Identify = 2,
    /// Customer asks for an agent
    RequestAgent = 3,
    /// Join an existing conversation
    JoinRoom = 4,
    /// Send a chat message to the current room
    SendMessage = 5,
    /// End the current conversation
    EndConversation = 6,
    /// Invalid session
    InvalidSession = 9,
    /// Hello
    Hello = 10,
    /// Heartbeat ACK
    HeartbeatAck = 11,
}

impl OpCode {
    pub fn from_u8(op: u8) -> Option<Self> {
        match op {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::RequestAgent),
            4 => Some(Self::JoinRoom),
            5 => Some(Self::SendMessage),
            6 => Some(Self::EndConversation),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }
}

/// Dispatch event names
pub mod events {
    pub const READY: &str = "READY";
    pub const ROOM_MATCHED: &str = "ROOM_MATCHED";
    pub const ROOM_ASSIGNED: &str = "ROOM_ASSIGNED";
    pub const ROOM_JOINED: &str = "ROOM_JOINED";
    pub const MESSAGE_CREATE: &str = "MESSAGE_CREATE";
    pub const CONVERSATION_ENDED: &str = "CONVERSATION_ENDED";
    pub const ERROR: &str = "ERROR";
}

/// Incoming gateway message
#[derive(Debug, Deserialize)]
pub struct GatewayReceive {
    pub op: u8,
    pub d: Option<serde_json::Value>,
    pub s: Option<u64>,
    pub t: Option<String>,
}

/// Outgoing gateway message
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySend {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewaySend {
    pub fn op(op: OpCode, d: Option<serde_json::Value>) -> Self {
        Self {
            op: op as u8,
            d,
            s: None,
            t: None,
        }
    }

    /// Dispatch frame for event `t`.
    pub fn dispatch<T: Serialize>(t: &str, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op: OpCode::Dispatch as u8,
            d: Some(serde_json::to_value(payload)?),
            s: None,
            t: Some(t.to_string()),
        })
    }
}

/// Hello payload (op 10)
#[derive(Debug, Serialize)]
pub struct HelloPayload {
    pub heartbeat_interval: u64,
}

/// Identify payload (op 2)
#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
}

/// Ready payload (dispatch READY)
#[derive(Debug, Serialize)]
pub struct ReadyPayload {
    pub v: u8,
    pub user: ReadyUser,
    pub session_id: String,
    /// Conversation the agent is already bound to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReadyUser {
    pub id: String,
    pub name: String,
    pub role: Role,
}

/// Join room payload (op 4)
#[derive(Debug, Deserialize)]
pub struct JoinRoomPayload {
    pub room: String,
}

/// Send message payload (op 5)
#[derive(Debug, Deserialize)]
pub struct SendMessagePayload {
    pub content: String,
}

/// Dispatch ROOM_MATCHED
#[derive(Debug, Serialize)]
pub struct RoomMatchedPayload {
    pub room: String,
    pub agent_id: String,
    pub agent_name: String,
}

/// Dispatch ROOM_ASSIGNED, sent to an agent when a customer is matched
#[derive(Debug, Serialize)]
pub struct RoomAssignedPayload {
    pub room: String,
    pub customer_id: String,
}

/// Dispatch ROOM_JOINED
#[derive(Debug, Serialize)]
pub struct RoomJoinedPayload {
    pub room: String,
}

/// Dispatch MESSAGE_CREATE
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCreatePayload {
    pub room: String,
    pub sender_id: String,
    pub sender_role: Role,
    pub content: String,
    pub sent_at: chrono::DateTime<chrono::Utc>,
}

/// Dispatch CONVERSATION_ENDED
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEndedPayload {
    pub room: String,
    pub ended_by: String,
}

/// Wire-level error codes
pub mod error_codes {
    pub const INTERNAL: u32 = 20000;
    pub const INVALID_PAYLOAD: u32 = 20001;
    pub const NO_AGENT_AVAILABLE: u32 = 20002;
    pub const NOT_A_CUSTOMER: u32 = 20003;
    pub const INVALID_ROOM: u32 = 20004;
    pub const ROOM_NOT_FOUND: u32 = 20005;
    pub const FORBIDDEN: u32 = 20006;
    pub const ROOM_CLOSED: u32 = 20007;
    pub const NOT_IN_ROOM: u32 = 20008;
    pub const ALREADY_IN_ROOM: u32 = 20009;
    pub const CONNECTION_CLOSED: u32 = 20010;
}

/// Dispatch ERROR
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub code: u32,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PAYLOAD, message)
    }

    pub fn not_in_room() -> Self {
        Self::new(error_codes::NOT_IN_ROOM, "Not in a room")
    }

    pub fn already_in_room() -> Self {
        Self::new(error_codes::ALREADY_IN_ROOM, "Already in a room")
    }
}

impl From<&RoomError> for ErrorPayload {
    fn from(err: &RoomError) -> Self {
        let code = match err {
            RoomError::InvalidName(_) => error_codes::INVALID_ROOM,
            RoomError::Closed => error_codes::ROOM_CLOSED,
            RoomError::ClientClosed => error_codes::CONNECTION_CLOSED,
            RoomError::NotFound => error_codes::ROOM_NOT_FOUND,
            RoomError::Forbidden => error_codes::FORBIDDEN,
        };
        Self::new(code, err.to_string())
    }
}

impl From<&AllocationError> for ErrorPayload {
    fn from(err: &AllocationError) -> Self {
        match err {
            AllocationError::NoAgentAvailable => {
                Self::new(error_codes::NO_AGENT_AVAILABLE, err.to_string())
            }
            AllocationError::NotACustomer => Self::new(error_codes::NOT_A_CUSTOMER, err.to_string()),
            AllocationError::RoomNotFound => Self::new(error_codes::ROOM_NOT_FOUND, err.to_string()),
            AllocationError::Forbidden => Self::new(error_codes::FORBIDDEN, err.to_string()),
            // Repository details stay in the logs
            AllocationError::Internal(_) => Self::new(error_codes::INTERNAL, "Internal error"),
        }
    }
}

impl From<&DirectoryError> for ErrorPayload {
    fn from(err: &DirectoryError) -> Self {
        match err {
            DirectoryError::Room(e) => e.into(),
            DirectoryError::Allocation(e) => e.into(),
        }
    }
}
