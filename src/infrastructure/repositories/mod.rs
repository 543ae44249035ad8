//! Repository Implementations
//!
//! PostgreSQL and in-memory implementations of the domain repository traits.
//!
//! ## Available Repositories
//!
//! - **PgAgentRepository** - Agent availability and reservation (`users` table)
//! - **PgRoomRepository** - Conversation records (`rooms` table)
//! - **InMemoryAgentRepository / InMemoryRoomRepository** - Process-local stores
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use sqlx::PgPool;
//! use support_chat::infrastructure::repositories::{PgAgentRepository, PgRoomRepository};
//!
//! async fn setup_repositories(pool: PgPool) {
//!     let agents = PgAgentRepository::new(pool.clone());
//!     let rooms = PgRoomRepository::new(pool);
//! }
//! ```

pub mod memory;
pub mod room_repository;
pub mod user_repository;

pub use memory::{InMemoryAgentRepository, InMemoryRoomRepository};
pub use room_repository::PgRoomRepository;
pub use user_repository::PgAgentRepository;
