//! Minimal in-memory session tracking.
//!
//! Keyed by the MCP connection/session id with a `"default"` singleton
//! fallback. Never persisted — state resets with the server process.

use std::collections::HashMap;

pub const DEFAULT_SESSION_ID: &str = "default";

#[derive(Debug)]
pub struct SessionState {
    pub session_id: String,
    pub turn_count: u64,
    pub writes_this_turn: u64,
}

impl SessionState {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            turn_count: 0,
            writes_this_turn: 0,
        }
    }

    /// Start a new turn; per-turn counters reset. Returns the new count.
    pub fn increment_turn(&mut self) -> u64 {
        self.turn_count += 1;
        self.writes_this_turn = 0;
        self.turn_count
    }

    pub fn record_write(&mut self) {
        self.writes_this_turn += 1;
    }
}

/// In-memory session registry.
#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: HashMap<String, SessionState>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, session_id: &str) -> &mut SessionState {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(session_id))
    }

    /// MCP context id when available, else the default singleton.
    pub fn resolve_session_id(mcp_context_id: Option<&str>) -> String {
        match mcp_context_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => DEFAULT_SESSION_ID.to_string(),
        }
    }

    pub fn reset(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
