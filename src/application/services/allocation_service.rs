//! Allocation Service
//!
//! Matches a customer with a free support agent.
//!
//! Many customers may ask for an agent at the same time while only a few
//! agents are free. The only step that decides who gets an agent is
//! `AgentRepository::reserve_agent`, a conditional update that succeeds for
//! exactly one caller per agent. Losing that race is an allocation conflict
//! and the next candidate is tried.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::{AgentRepository, Role, RoomName, RoomRecord, RoomRepository, User};
use crate::infrastructure::metrics;
use crate::shared::error::AppError;

/// Upper bound on candidates examined per allocation.
const FREE_AGENT_SCAN_LIMIT: i64 = 1000;

/// Allocation service trait
#[async_trait]
pub trait AllocationService: Send + Sync {
    /// Reserve one free agent for `customer` and persist the room record.
    ///
    /// All-or-nothing: on failure no agent stays reserved and no room
    /// record remains open.
    async fn allocate_agent(
        &self,
        customer: &User,
        room_name: &RoomName,
    ) -> Result<Allocation, AllocationError>;

    /// Free the agent bound to `room_name` and close the room record.
    async fn release_agent(&self, agent_id: i64, room_name: &str) -> Result<bool, AllocationError>;

    /// End a conversation on behalf of one of its participants.
    async fn end_conversation(
        &self,
        user: &User,
        room_name: &str,
    ) -> Result<RoomRecord, AllocationError>;

    /// Look up a persisted room.
    async fn get_room_by_name(&self, name: &str) -> Result<RoomRecord, AllocationError>;
}

/// A successful match.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// The agent as stored after reservation
    pub agent: User,
    pub room: RoomRecord,
}

/// Allocation service errors
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("No agent available")]
    NoAgentAvailable,

    #[error("Only customers can request an agent")]
    NotACustomer,

    #[error("Room not found")]
    RoomNotFound,

    #[error("Not a participant of this room")]
    Forbidden,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<AppError> for AllocationError {
    fn from(err: AppError) -> Self {
        AllocationError::Internal(err.to_string())
    }
}

impl From<AllocationError> for AppError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::NoAgentAvailable => AppError::Unavailable(err.to_string()),
            AllocationError::NotACustomer | AllocationError::Forbidden => {
                AppError::Forbidden(err.to_string())
            }
            AllocationError::RoomNotFound => AppError::NotFound(err.to_string()),
            AllocationError::Internal(msg) => AppError::Internal(msg),
        }
    }
}

/// AllocationService implementation
pub struct AllocationServiceImpl<A, R>
where
    A: AgentRepository,
    R: RoomRepository,
{
    agents: Arc<A>,
    rooms: Arc<R>,
}

impl<A, R> AllocationServiceImpl<A, R>
where
    A: AgentRepository,
    R: RoomRepository,
{
    pub fn new(agents: Arc<A>, rooms: Arc<R>) -> Self {
        Self { agents, rooms }
    }

    /// Undo a reservation whose room record could not be written.
    async fn compensate(&self, agent_id: i64, room_name: &RoomName) {
        match self.agents.release_agent(agent_id, room_name.as_str()).await {
            Ok(true) => debug!(agent_id, room = %room_name, "Reservation rolled back"),
            Ok(false) => warn!(agent_id, room = %room_name, "Reservation already gone on rollback"),
            Err(e) => warn!(
                agent_id,
                room = %room_name,
                error = %e,
                "Failed to roll back agent reservation"
            ),
        }
    }
}

#[async_trait]
impl<A, R> AllocationService for AllocationServiceImpl<A, R>
where
    A: AgentRepository + 'static,
    R: RoomRepository + 'static,
{
    async fn allocate_agent(
        &self,
        customer: &User,
        room_name: &RoomName,
    ) -> Result<Allocation, AllocationError> {
        if customer.role() != Role::Customer {
            return Err(AllocationError::NotACustomer);
        }

        let candidates = self.agents.list_free_agents(FREE_AGENT_SCAN_LIMIT).await?;

        for mut agent in candidates {
            if !self.agents.reserve_agent(agent.id, room_name.as_str()).await? {
                metrics::record_allocation("conflict");
                debug!(agent_id = agent.id, room = %room_name, "Agent taken concurrently, trying next");
                continue;
            }
            agent.assign(room_name.as_str());

            let record = RoomRecord::new(room_name, customer.id, agent.id);
            return match self.rooms.create(&record).await {
                Ok(room) => {
                    metrics::record_allocation("allocated");
                    info!(
                        agent_id = agent.id,
                        customer_id = customer.id,
                        room = %room_name,
                        "Agent allocated"
                    );
                    Ok(Allocation { agent, room })
                }
                Err(e) => {
                    metrics::record_allocation("error");
                    self.compensate(agent.id, room_name).await;
                    Err(e.into())
                }
            };
        }

        metrics::record_allocation("no_agent");
        debug!(customer_id = customer.id, "No free agent");
        Err(AllocationError::NoAgentAvailable)
    }

    async fn release_agent(&self, agent_id: i64, room_name: &str) -> Result<bool, AllocationError> {
        self.rooms.close(room_name).await?;
        let released = self.agents.release_agent(agent_id, room_name).await?;
        if released {
            info!(agent_id, room = %room_name, "Agent released");
        }
        Ok(released)
    }

    async fn end_conversation(
        &self,
        user: &User,
        room_name: &str,
    ) -> Result<RoomRecord, AllocationError> {
        let room = self.get_room_by_name(room_name).await?;
        if !room.is_participant(user.id) {
            return Err(AllocationError::Forbidden);
        }
        self.release_agent(room.agent_id, room_name).await?;
        Ok(room)
    }

    async fn get_room_by_name(&self, name: &str) -> Result<RoomRecord, AllocationError> {
        self.rooms
            .find_by_name(name)
            .await?
            .ok_or(AllocationError::RoomNotFound)
    }
}
