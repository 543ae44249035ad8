//! # Value Objects
//!
//! Immutable, validated values used across the domain.

mod role;
mod room_name;

pub use role::Role;
pub use room_name::{InvalidRoomName, RoomName, AGENT_TOPIC_PREFIX};
