//! WebSocket Gateway
//!
//! Real-time conversations over WebSocket connections.
//!
//! - **client**: per-attachment outbound queue with drop-newest backpressure
//! - **room**: single-owner room task bridging local clients and the broker
//! - **directory**: room lookup, agent matching and joins
//! - **handler**: the connection protocol (Hello, Identify, opcodes)

pub mod client;
pub mod directory;
pub mod handler;
pub mod messages;
pub mod room;
pub mod session;

pub use client::{ClientHandle, ClientReceiver, Payload, SendOutcome};
pub use directory::{AssignmentNotice, DirectoryError, MatchedRoom, RoomDirectory};
pub use handler::ws_handler;
pub use messages::{GatewayReceive, GatewaySend, OpCode};
pub use room::{BroadcastMessage, Room, RoomError, RoomHandle};
pub use session::SessionState;
