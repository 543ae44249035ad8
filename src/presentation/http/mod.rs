//! HTTP Layer
//!
//! Route wiring and operational endpoints. Conversations themselves run
//! over the WebSocket gateway.

pub mod handlers;
pub mod routes;
