//! User entity and agent repository trait.
//!
//! Maps to the `users` table in the database schema. Customers and support
//! agents share the table; `is_support` separates them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::Role;
use crate::shared::error::AppError;

/// Represents a customer or support agent.
///
/// Maps to the `users` table:
/// - id: BIGINT PRIMARY KEY
/// - email: VARCHAR(255) NOT NULL UNIQUE
/// - name: VARCHAR(64) NOT NULL
/// - is_support: BOOLEAN NOT NULL DEFAULT FALSE
/// - is_free: BOOLEAN NOT NULL DEFAULT FALSE
/// - room_name: VARCHAR(128) NULL
/// - created_at: TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// - updated_at: TIMESTAMPTZ NOT NULL DEFAULT NOW()
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,

    pub email: String,

    pub name: String,

    /// True only for support agents
    pub is_support: bool,

    /// Agent is available for a new conversation
    pub is_free: bool,

    /// Conversation the agent is currently bound to
    pub room_name: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a customer account.
    pub fn customer(id: i64, email: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            email: email.into(),
            name: name.into(),
            is_support: false,
            is_free: false,
            room_name: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a support agent that is free for assignment.
    pub fn agent(id: i64, email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            is_support: true,
            is_free: true,
            ..Self::customer(id, email, name)
        }
    }

    pub fn role(&self) -> Role {
        Role::from_support_flag(self.is_support)
    }

    /// Whether this user can be picked by agent allocation.
    pub fn is_available_agent(&self) -> bool {
        self.is_support && self.is_free
    }

    /// Bind the agent to a room. Both fields change together.
    pub fn assign(&mut self, room_name: impl Into<String>) {
        self.is_free = false;
        self.room_name = Some(room_name.into());
        self.updated_at = Utc::now();
    }

    /// Make the agent available again.
    pub fn release(&mut self) {
        self.is_free = true;
        self.room_name = None;
        self.updated_at = Utc::now();
    }
}

/// Persistence contract used by agent allocation.
///
/// `reserve_agent` is the single linearization point that prevents two
/// allocations from binding the same agent: it must check and update the
/// agent in one atomic step.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Find a user by ID.
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, AppError>;

    /// Free agents ordered by `created_at`, then `id`.
    async fn list_free_agents(&self, limit: i64) -> Result<Vec<User>, AppError>;

    /// Atomically flip a free agent to busy and bind it to `room_name`.
    ///
    /// Returns `false` when the agent is no longer free.
    async fn reserve_agent(&self, agent_id: i64, room_name: &str) -> Result<bool, AppError>;

    /// Make the agent free again if it is still bound to `room_name`.
    async fn release_agent(&self, agent_id: i64, room_name: &str) -> Result<bool, AppError>;
}
