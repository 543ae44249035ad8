//! Client Handle
//!
//! Per-attachment state of one participant in one room: a bounded outbound
//! queue drained by the connection's writer, the participant's role, and a
//! weak link back to the room's command channel.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use super::room::RoomCommand;
use crate::domain::Role;

/// Raw payload as received from the broker.
pub type Payload = Vec<u8>;

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// Queue full; the new message was discarded.
    Dropped,
    /// Client already closed.
    Closed,
}

struct RoomLink {
    name: String,
    commands: mpsc::WeakUnboundedSender<RoomCommand>,
}

struct ClientInner {
    id: Uuid,
    user_id: i64,
    role: Role,
    sender: Mutex<Option<mpsc::Sender<Payload>>>,
    room: Mutex<Option<RoomLink>>,
}

/// Cloneable handle to one client's outbound queue.
///
/// The room keeps a clone for fan-out; the connection keeps one to close
/// it. Whoever calls [`ClientHandle::close`] first wins, later calls are
/// no-ops.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

/// Receiving half of a client's outbound queue.
pub struct ClientReceiver {
    rx: mpsc::Receiver<Payload>,
}

impl ClientHandle {
    /// Create a client whose outbound queue holds at most `capacity` payloads.
    pub fn new(user_id: i64, role: Role, capacity: usize) -> (Self, ClientReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            inner: Arc::new(ClientInner {
                id: Uuid::new_v4(),
                user_id,
                role,
                sender: Mutex::new(Some(tx)),
                room: Mutex::new(None),
            }),
        };
        (handle, ClientReceiver { rx })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn user_id(&self) -> i64 {
        self.inner.user_id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Name of the room this client is attached to, if any.
    pub fn room_name(&self) -> Option<String> {
        self.inner.room.lock().as_ref().map(|link| link.name.clone())
    }

    /// Enqueue a payload without waiting.
    pub fn send(&self, payload: Payload) -> SendOutcome {
        let sender = self.inner.sender.lock();
        match sender.as_ref() {
            None => SendOutcome::Closed,
            Some(tx) => match tx.try_send(payload) {
                Ok(()) => SendOutcome::Accepted,
                Err(TrySendError::Full(_)) => SendOutcome::Dropped,
                Err(TrySendError::Closed(_)) => SendOutcome::Closed,
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sender.lock().is_none()
    }

    /// Close the client: release the queue and detach from the room.
    ///
    /// Returns `true` only for the call that actually closed it. Never
    /// waits on the room or the broker.
    pub fn close(&self) -> bool {
        let Some(sender) = self.inner.sender.lock().take() else {
            return false;
        };
        drop(sender);

        let link = self.inner.room.lock().take();
        if let Some(commands) = link.and_then(|link| link.commands.upgrade()) {
            let _ = commands.send(RoomCommand::Detach {
                client_id: self.inner.id,
            });
        }

        tracing::debug!(client_id = %self.inner.id, user_id = self.inner.user_id, "Client closed");
        true
    }

    pub(crate) fn bind_room(&self, name: &str, commands: mpsc::WeakUnboundedSender<RoomCommand>) {
        *self.inner.room.lock() = Some(RoomLink {
            name: name.to_string(),
            commands,
        });
    }

    pub(crate) fn unbind_room(&self) {
        self.inner.room.lock().take();
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.inner.id)
            .field("user_id", &self.inner.user_id)
            .field("role", &self.inner.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClientReceiver {
    /// Next payload; `None` once the client is closed and the queue drained.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_send_until_full_then_drop() {
        let (client, mut rx) = ClientHandle::new(1, Role::Customer, 2);

        assert_eq!(client.send(b"a".to_vec()), SendOutcome::Accepted);
        assert_eq!(client.send(b"b".to_vec()), SendOutcome::Accepted);
        assert_eq!(client.send(b"c".to_vec()), SendOutcome::Dropped);

        assert_eq!(rx.try_recv(), Some(b"a".to_vec()));
        assert_eq!(rx.try_recv(), Some(b"b".to_vec()));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn test_receiver_wakes_on_send() {
        let (client, mut rx) = ClientHandle::new(1, Role::Customer, 4);
        let mut recv = tokio_test::task::spawn(rx.recv());

        tokio_test::assert_pending!(recv.poll());
        client.send(b"hi".to_vec());

        assert!(recv.is_woken());
        assert_eq!(tokio_test::assert_ready!(recv.poll()), Some(b"hi".to_vec()));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (client, _rx) = ClientHandle::new(1, Role::Agent, 4);
        let other = client.clone();

        assert!(client.close());
        assert!(!other.close());
        assert!(!client.close());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_close_ends_receiver_after_drain() {
        let (client, mut rx) = ClientHandle::new(1, Role::Customer, 4);
        client.send(b"last".to_vec());
        client.close();

        assert_eq!(rx.recv().await, Some(b"last".to_vec()));
        assert_eq!(rx.recv().await, None);
        assert_eq!(client.send(b"late".to_vec()), SendOutcome::Closed);
    }

    #[test]
    fn test_concurrent_close_runs_once() {
        let (client, _rx) = ClientHandle::new(1, Role::Customer, 4);

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let client = client.clone();
                    scope.spawn(move || client.close())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });

        assert_eq!(winners, 1);
    }

    #[test]
    fn test_close_sends_detach_to_live_room() {
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let (client, _rx) = ClientHandle::new(7, Role::Customer, 4);
        client.bind_room("support-7", commands.downgrade());
        assert_eq!(client.room_name().as_deref(), Some("support-7"));

        client.close();

        match command_rx.try_recv() {
            Ok(RoomCommand::Detach { client_id }) => assert_eq!(client_id, client.id()),
            _ => panic!("expected a detach command"),
        }
        assert!(client.room_name().is_none());
    }

    #[test]
    fn test_weak_link_does_not_keep_room_alive() {
        let (commands, command_rx) = mpsc::unbounded_channel::<RoomCommand>();
        let (client, _rx) = ClientHandle::new(7, Role::Customer, 4);
        client.bind_room("support-7", commands.downgrade());

        drop(commands);
        drop(command_rx);

        // Nothing to detach from; closing still succeeds.
        assert!(client.close());
    }
}
