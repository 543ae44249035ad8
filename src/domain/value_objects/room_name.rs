//! Room name value object.
//!
//! The room name doubles as the broker topic, so it must be non-empty,
//! stable across processes and clear of the per-agent topic namespace.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a room name, matching the `rooms.name` column.
pub const MAX_ROOM_NAME_LENGTH: usize = 128;

/// Namespace of per-agent notification topics; no room may use it.
pub const AGENT_TOPIC_PREFIX: &str = "agent:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidRoomName {
    #[error("room name must not be empty")]
    Empty,

    #[error("room name must be at most {MAX_ROOM_NAME_LENGTH} characters")]
    TooLong,

    #[error("room name must not start with \"{AGENT_TOPIC_PREFIX}\"")]
    Reserved,
}

/// Validated room name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidRoomName> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(InvalidRoomName::Empty);
        }
        if name.len() > MAX_ROOM_NAME_LENGTH {
            return Err(InvalidRoomName::TooLong);
        }
        if name.starts_with(AGENT_TOPIC_PREFIX) {
            return Err(InvalidRoomName::Reserved);
        }
        Ok(Self(name))
    }

    /// Fresh, unique name for a conversation started by `customer_id`.
    pub fn for_customer(customer_id: i64) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("support-{}-{}", customer_id, &suffix[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomName {
    type Error = InvalidRoomName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomName> for String {
    fn from(name: RoomName) -> Self {
        name.0
    }
}

impl AsRef<str> for RoomName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
