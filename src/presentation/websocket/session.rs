//! WebSocket Session Management

use std::time::Instant;

/// WebSocket session state
#[derive(Debug)]
pub struct SessionState {
    pub user_id: i64,
    pub session_id: String,
    pub sequence: u64,
    pub last_heartbeat: Instant,
    pub identified: bool,
    /// Room the connection is currently attached to
    pub room: Option<String>,
}

impl SessionState {
    pub fn new(session_id: String) -> Self {
        Self {
            user_id: 0,
            session_id,
            sequence: 0,
            last_heartbeat: Instant::now(),
            identified: false,
            room: None,
        }
    }

    pub fn identify(&mut self, user_id: i64) {
        self.user_id = user_id;
        self.identified = true;
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_alive(&self, timeout_ms: u64) -> bool {
        self.last_heartbeat.elapsed().as_millis() < timeout_ms as u128
    }
}
