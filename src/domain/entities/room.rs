//! Room record entity and repository trait.
//!
//! Maps to the `rooms` table. A room record is the persisted side of a
//! conversation; the live broadcast state is held per process by the
//! websocket layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::value_objects::RoomName;
use crate::shared::error::AppError;

/// Persisted support conversation.
///
/// Maps to the `rooms` table:
/// - id: UUID PRIMARY KEY
/// - name: VARCHAR(128) NOT NULL UNIQUE
/// - customer_id: BIGINT NOT NULL REFERENCES users(id)
/// - agent_id: BIGINT NOT NULL REFERENCES users(id)
/// - created_at: TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// - closed_at: TIMESTAMPTZ NULL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: Uuid,
    pub name: String,
    pub customer_id: i64,
    pub agent_id: i64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl RoomRecord {
    pub fn new(name: &RoomName, customer_id: i64, agent_id: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            customer_id,
            agent_id,
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    /// Whether the user takes part in this conversation.
    pub fn is_participant(&self, user_id: i64) -> bool {
        self.customer_id == user_id || self.agent_id == user_id
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoomRepository: Send + Sync {
    /// Persist a new room record. Names are unique.
    async fn create(&self, room: &RoomRecord) -> Result<RoomRecord, AppError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<RoomRecord>, AppError>;

    /// Mark the room closed. Returns `false` if it was already closed or missing.
    async fn close(&self, name: &str) -> Result<bool, AppError>;
}
