//! In-Memory Repositories
//!
//! Process-local implementations of the repository traits, used by the test
//! suite and for running a single node without PostgreSQL. Each operation
//! takes the store lock once, so reservation is as atomic here as the
//! conditional update is in SQL.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::domain::{AgentRepository, RoomRecord, RoomRepository, User};
use crate::shared::error::AppError;

/// Users keyed by id.
#[derive(Default)]
pub struct InMemoryAgentRepository {
    users: Mutex<HashMap<i64, User>>,
}

impl InMemoryAgentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let repo = Self::new();
        for user in users {
            repo.insert(user);
        }
        repo
    }

    pub fn insert(&self, user: User) {
        self.users.lock().insert(user.id, user);
    }

    /// Snapshot of a stored user.
    pub fn get(&self, id: i64) -> Option<User> {
        self.users.lock().get(&id).cloned()
    }
}

#[async_trait]
impl AgentRepository for InMemoryAgentRepository {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, AppError> {
        Ok(self.get(id))
    }

    async fn list_free_agents(&self, limit: i64) -> Result<Vec<User>, AppError> {
        let mut agents: Vec<User> = self
            .users
            .lock()
            .values()
            .filter(|u| u.is_available_agent())
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        agents.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(agents)
    }

    async fn reserve_agent(&self, agent_id: i64, room_name: &str) -> Result<bool, AppError> {
        let mut users = self.users.lock();
        match users.get_mut(&agent_id) {
            Some(agent) if agent.is_available_agent() => {
                agent.assign(room_name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_agent(&self, agent_id: i64, room_name: &str) -> Result<bool, AppError> {
        let mut users = self.users.lock();
        match users.get_mut(&agent_id) {
            Some(agent) if agent.is_support && agent.room_name.as_deref() == Some(room_name) => {
                agent.release();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Room records keyed by name.
#[derive(Default)]
pub struct InMemoryRoomRepository {
    rooms: Mutex<HashMap<String, RoomRecord>>,
}

impl InMemoryRoomRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RoomRepository for InMemoryRoomRepository {
    async fn create(&self, room: &RoomRecord) -> Result<RoomRecord, AppError> {
        let mut rooms = self.rooms.lock();
        if rooms.contains_key(&room.name) {
            return Err(AppError::Conflict(format!("Room {} already exists", room.name)));
        }
        rooms.insert(room.name.clone(), room.clone());
        Ok(room.clone())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<RoomRecord>, AppError> {
        Ok(self.rooms.lock().get(name).cloned())
    }

    async fn close(&self, name: &str) -> Result<bool, AppError> {
        let mut rooms = self.rooms.lock();
        match rooms.get_mut(name) {
            Some(room) if room.is_open() => {
                room.closed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn agent_created_at(id: i64, minutes_ago: i64) -> User {
        let mut agent = User::agent(id, format!("agent{}@example.com", id), "Agent");
        agent.created_at = Utc::now() - Duration::minutes(minutes_ago);
        agent
    }

    #[tokio::test]
    async fn test_free_agents_are_ordered_by_creation() {
        let repo = InMemoryAgentRepository::with_users([
            agent_created_at(3, 1),
            agent_created_at(1, 10),
            agent_created_at(2, 5),
            User::customer(9, "c@example.com", "Customer"),
        ]);

        let ids: Vec<i64> = repo
            .list_free_agents(10)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();

        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reserve_is_exclusive() {
        let repo = InMemoryAgentRepository::with_users([agent_created_at(1, 0)]);

        assert!(repo.reserve_agent(1, "room-a").await.unwrap());
        assert!(!repo.reserve_agent(1, "room-b").await.unwrap());

        let agent = repo.get(1).unwrap();
        assert!(!agent.is_free);
        assert_eq!(agent.room_name.as_deref(), Some("room-a"));
    }

    #[tokio::test]
    async fn test_release_requires_matching_room() {
        let repo = InMemoryAgentRepository::with_users([agent_created_at(1, 0)]);
        repo.reserve_agent(1, "room-a").await.unwrap();

        assert!(!repo.release_agent(1, "room-b").await.unwrap());
        assert!(repo.release_agent(1, "room-a").await.unwrap());
        assert!(repo.get(1).unwrap().is_free);
    }

    #[tokio::test]
    async fn test_room_names_are_unique() {
        let repo = InMemoryRoomRepository::new();
        let name = crate::domain::RoomName::new("support-1").unwrap();
        let record = RoomRecord::new(&name, 1, 2);

        repo.create(&record).await.unwrap();
        let second = repo.create(&RoomRecord::new(&name, 3, 4)).await;

        assert!(matches!(second, Err(AppError::Conflict(_))));
        assert!(repo.close("support-1").await.unwrap());
        assert!(!repo.close("support-1").await.unwrap());
    }
}
