//! Typed lifecycle notifications emitted by the session registry

use super::types::{SessionId, SessionStatus};

/// Closed set of registry lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created {
        session_id: SessionId,
    },
    Updated {
        session_id: SessionId,
        status: SessionStatus,
    },
    /// Status changed into a terminal state (complete or error)
    Completed {
        session_id: SessionId,
        status: SessionStatus,
    },
    EntryAdded {
        session_id: SessionId,
        index: usize,
    },
    EntryUpdated {
        session_id: SessionId,
        index: usize,
    },
    Removed {
        session_id: SessionId,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Created { session_id }
            | SessionEvent::Updated { session_id, .. }
            | SessionEvent::Completed { session_id, .. }
            | SessionEvent::EntryAdded { session_id, .. }
            | SessionEvent::EntryUpdated { session_id, .. }
            | SessionEvent::Removed { session_id } => session_id,
        }
    }
}
