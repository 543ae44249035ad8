//! # Domain Entities
//!
//! - **User**: customer or support agent, including agent availability
//! - **RoomRecord**: persisted record of one support conversation
//!
//! Each entity has an associated repository trait. These traits are
//! implemented in the infrastructure layer, following the dependency
//! inversion principle.

mod room;
mod user;

pub use room::{RoomRecord, RoomRepository};
pub use user::{AgentRepository, User};

#[cfg(test)]
pub use room::MockRoomRepository;
#[cfg(test)]
pub use user::MockAgentRepository;
