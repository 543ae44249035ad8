//! Room Repository Implementation
//!
//! PostgreSQL implementation of the RoomRepository trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{RoomRecord, RoomRepository};
use crate::shared::error::AppError;

#[derive(Debug, sqlx::FromRow)]
struct RoomRow {
    id: Uuid,
    name: String,
    customer_id: i64,
    agent_id: i64,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl From<RoomRow> for RoomRecord {
    fn from(row: RoomRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            customer_id: row.customer_id,
            agent_id: row.agent_id,
            created_at: row.created_at,
            closed_at: row.closed_at,
        }
    }
}

/// PostgreSQL room repository implementation.
#[derive(Clone)]
pub struct PgRoomRepository {
    pool: PgPool,
}

impl PgRoomRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomRepository for PgRoomRepository {
    async fn create(&self, room: &RoomRecord) -> Result<RoomRecord, AppError> {
        let row = sqlx::query_as::<_, RoomRow>(
            r#"
            INSERT INTO rooms (id, name, customer_id, agent_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, customer_id, agent_id, created_at, closed_at
            "#,
        )
        .bind(room.id)
        .bind(&room.name)
        .bind(room.customer_id)
        .bind(room.agent_id)
        .bind(room.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(format!("Room {} already exists", room.name))
            }
            other => AppError::Database(other),
        })?;

        Ok(row.into())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<RoomRecord>, AppError> {
        let row = sqlx::query_as::<_, RoomRow>(
            r#"
            SELECT id, name, customer_id, agent_id, created_at, closed_at
            FROM rooms
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn close(&self, name: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE rooms SET closed_at = NOW() WHERE name = $1 AND closed_at IS NULL",
        )
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
