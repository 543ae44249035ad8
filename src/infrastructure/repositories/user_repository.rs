//! Agent Repository Implementation
//!
//! PostgreSQL implementation of the AgentRepository trait.
//! Maps between the `users` table and the domain User entity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::domain::{AgentRepository, User};
use crate::shared::error::AppError;

/// Database row representation of the users table.
#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    name: String,
    is_support: bool,
    is_free: bool,
    room_name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserRow {
    /// Convert database row to domain User entity.
    fn into_user(self) -> User {
        User {
            id: self.id,
            email: self.email,
            name: self.name,
            is_support: self.is_support,
            is_free: self.is_free,
            room_name: self.room_name,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// PostgreSQL agent repository implementation.
///
/// Reservation relies on a single conditional `UPDATE`: Postgres row locking
/// guarantees that of two concurrent reservations for the same agent only
/// one sees `is_free = TRUE` and affects a row.
#[derive(Clone)]
pub struct PgAgentRepository {
    pool: PgPool,
}

impl PgAgentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentRepository for PgAgentRepository {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, AppError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, name, is_support, is_free, room_name, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_user()))
    }

    async fn list_free_agents(&self, limit: i64) -> Result<Vec<User>, AppError> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, name, is_support, is_free, room_name, created_at, updated_at
            FROM users
            WHERE is_support AND is_free
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_user()).collect())
    }

    async fn reserve_agent(&self, agent_id: i64, room_name: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET is_free = FALSE, room_name = $2, updated_at = NOW()
            WHERE id = $1 AND is_support AND is_free
            "#,
        )
        .bind(agent_id)
        .bind(room_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_agent(&self, agent_id: i64, room_name: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET is_free = TRUE, room_name = NULL, updated_at = NOW()
            WHERE id = $1 AND is_support AND room_name = $2
            "#,
        )
        .bind(agent_id)
        .bind(room_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
