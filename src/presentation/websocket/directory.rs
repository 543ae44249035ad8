//! Room Directory
//!
//! Process-local index of running rooms, and the entry point for starting
//! and joining conversations.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::client::ClientHandle;
use super::room::{Room, RoomError, RoomHandle};
use crate::application::services::{Allocation, AllocationError, AllocationService};
use crate::config::RoomSettings;
use crate::domain::{RoomName, RoomRecord, User};
use crate::infrastructure::broker::{topics, Broker};

/// Attempts to attach before giving up on a room that keeps stopping.
const MAX_JOIN_ATTEMPTS: usize = 3;

/// Directory errors
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

/// Published on `agent:{id}` when an agent is matched to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentNotice {
    pub room: String,
    pub customer_id: i64,
}

/// Result of [`RoomDirectory::create_room_for_match`].
#[derive(Debug, Clone)]
pub struct MatchedRoom {
    pub room: RoomHandle,
    pub allocation: Allocation,
}

pub struct RoomDirectory {
    rooms: Arc<DashMap<String, RoomHandle>>,
    broker: Arc<dyn Broker>,
    allocation: Arc<dyn AllocationService>,
    settings: RoomSettings,
}

impl RoomDirectory {
    pub fn new(
        broker: Arc<dyn Broker>,
        allocation: Arc<dyn AllocationService>,
        settings: RoomSettings,
    ) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            broker,
            allocation,
            settings,
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn allocation(&self) -> &Arc<dyn AllocationService> {
        &self.allocation
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    /// Number of rooms running on this process.
    pub fn room_count(&self) -> usize {
        self.rooms.iter().filter(|r| !r.is_closed()).count()
    }

    /// The running local room named `name`, if any.
    pub fn local_room(&self, name: &str) -> Option<RoomHandle> {
        self.rooms
            .get(name)
            .map(|r| r.clone())
            .filter(|r| !r.is_closed())
    }

    /// Return the running room named `name`, starting one if needed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn get_or_create_room(&self, name: &str) -> Result<RoomHandle, RoomError> {
        let name = RoomName::new(name)?;

        let mut created = false;
        let handle = {
            let mut entry = self
                .rooms
                .entry(name.to_string())
                .or_insert_with(|| {
                    created = true;
                    self.start_room(&name)
                });
            if !created && entry.is_closed() {
                created = true;
                *entry = self.start_room(&name);
            }
            entry.clone()
        };

        if created {
            self.spawn_reaper(handle.clone());
        }
        Ok(handle)
    }

    /// Attach `client` to the room named `name`, restarting the room if it
    /// stopped between lookup and attach.
    pub async fn join(&self, name: &str, client: &ClientHandle) -> Result<RoomHandle, RoomError> {
        let mut last_error = RoomError::Closed;
        for _ in 0..MAX_JOIN_ATTEMPTS {
            let room = self.get_or_create_room(name)?;
            match room.attach(client.clone()).await {
                Ok(()) => return Ok(room),
                Err(RoomError::Closed) => {
                    debug!(room = name, "Room stopped during attach, retrying");
                    last_error = RoomError::Closed;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Start a conversation for `customer`: reserve an agent, attach the
    /// customer's client and notify the agent.
    pub async fn create_room_for_match(
        &self,
        customer: &User,
        client: &ClientHandle,
    ) -> Result<MatchedRoom, DirectoryError> {
        let name = RoomName::for_customer(customer.id);
        let allocation = self.allocation.allocate_agent(customer, &name).await?;
        let agent_id = allocation.agent.id;

        let room = match self.join(name.as_str(), client).await {
            Ok(room) => room,
            Err(e) => {
                warn!(room = %name, agent_id, error = %e, "Attach failed after allocation, releasing agent");
                if let Err(release_err) = self.allocation.release_agent(agent_id, name.as_str()).await {
                    warn!(room = %name, agent_id, error = %release_err, "Failed to release agent");
                }
                return Err(e.into());
            }
        };

        self.notify_agent(agent_id, &allocation.room).await;
        info!(room = %name, agent_id, customer_id = customer.id, "Conversation started");

        Ok(MatchedRoom { room, allocation })
    }

    /// Attach `user` to an existing conversation they participate in.
    pub async fn join_room(
        &self,
        user: &User,
        client: &ClientHandle,
        name: &str,
    ) -> Result<RoomHandle, DirectoryError> {
        RoomName::new(name).map_err(RoomError::from)?;

        let record = match self.allocation.get_room_by_name(name).await {
            Ok(record) => record,
            Err(AllocationError::RoomNotFound) => return Err(RoomError::NotFound.into()),
            Err(e) => return Err(e.into()),
        };
        if !record.is_participant(user.id) {
            return Err(RoomError::Forbidden.into());
        }
        if !record.is_open() {
            return Err(RoomError::Closed.into());
        }

        let room = self.join(name, client).await?;
        debug!(room = name, user_id = user.id, role = %user.role(), "Joined room");
        Ok(room)
    }

    /// Close `client`, detaching it from its room.
    pub fn leave(&self, client: &ClientHandle) -> bool {
        client.close()
    }

    /// End the conversation on behalf of `user` and free its agent.
    pub async fn end_conversation(
        &self,
        user: &User,
        name: &str,
    ) -> Result<RoomRecord, DirectoryError> {
        let record = self.allocation.end_conversation(user, name).await?;
        info!(room = name, agent_id = record.agent_id, ended_by = user.id, "Conversation ended");
        Ok(record)
    }

    fn start_room(&self, name: &RoomName) -> RoomHandle {
        // Name already validated.
        let room = Room::from_name(name.clone(), self.settings.clone());
        room.run(self.broker.clone())
    }

    /// Remove the directory entry once the room stops, unless it has
    /// already been replaced.
    fn spawn_reaper(&self, handle: RoomHandle) {
        let rooms: Weak<DashMap<String, RoomHandle>> = Arc::downgrade(&self.rooms);
        tokio::spawn(async move {
            handle.closed().await;
            if let Some(rooms) = rooms.upgrade() {
                rooms.remove_if(handle.name().as_str(), |_, current| current.id() == handle.id());
            }
        });
    }

    async fn notify_agent(&self, agent_id: i64, room: &RoomRecord) {
        let notice = AssignmentNotice {
            room: room.name.clone(),
            customer_id: room.customer_id,
        };
        let payload = match serde_json::to_vec(&notice) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(agent_id, error = %e, "Failed to encode assignment notice");
                return;
            }
        };
        if let Err(e) = self.broker.publish(&topics::agent(agent_id), payload).await {
            warn!(agent_id, room = %room.name, error = %e, "Failed to notify agent");
        }
    }
}
