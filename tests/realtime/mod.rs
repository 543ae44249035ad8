//! Real-time engine tests
//!
//! Each `Node` is a room directory standing in for one server process; nodes
//! share an in-process broker and in-memory repositories.

mod allocation_tests;
mod room_tests;
