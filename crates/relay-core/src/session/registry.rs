//! Session registry - authoritative in-memory store of sessions
//!
//! Holds every tracked session, its entry log, and the child → parent side
//! table. All mutation is synchronous; callers share the registry through
//! [`SharedRegistry`] and never hold the lock across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::events::SessionEvent;
use super::types::{
    AgentSession, AgentSessionEntry, EntryPatch, RegistryState, SessionId, SessionPatch,
};
use crate::error::{Error, Result};

/// Registry shared between the lifecycle engine and platform adapters
pub type SharedRegistry = Arc<parking_lot::Mutex<SessionRegistry>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Authoritative store of sessions, entries and parent/child links
pub struct SessionRegistry {
    sessions: HashMap<SessionId, AgentSession>,
    entries: HashMap<SessionId, Vec<AgentSessionEntry>>,
    /// child id -> parent id
    child_to_parent: HashMap<SessionId, SessionId>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions: HashMap::new(),
            entries: HashMap::new(),
            child_to_parent: HashMap::new(),
            events,
        }
    }

    /// Wrap a registry for sharing
    pub fn shared(self) -> SharedRegistry {
        Arc::new(parking_lot::Mutex::new(self))
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Insert a new session. Never overwrites an existing one.
    pub fn create_session(&mut self, session: AgentSession) -> Result<()> {
        if self.sessions.contains_key(&session.id) {
            return Err(Error::DuplicateSession(session.id));
        }

        let session_id = session.id.clone();
        debug!(session_id = %session_id, status = %session.status, "Creating session");
        self.sessions.insert(session_id.clone(), session);
        self.emit(SessionEvent::Created { session_id });
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Option<&AgentSession> {
        self.sessions.get(session_id)
    }

    /// All sessions, oldest first
    pub fn get_all_sessions(&self) -> Vec<&AgentSession> {
        let mut sessions: Vec<&AgentSession> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Merge a partial update into a session and bump `updated_at`
    ///
    /// Emits `Completed` when the status changes into a terminal state.
    pub fn update_session(&mut self, session_id: &str, patch: SessionPatch) -> Result<&AgentSession> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let old_status = session.status;
        patch.apply(session);
        session.updated_at = advance(session.updated_at);
        let new_status = session.status;

        self.emit(SessionEvent::Updated {
            session_id: session_id.to_string(),
            status: new_status,
        });
        if old_status != new_status && new_status.is_terminal() {
            info!(session_id = %session_id, status = %new_status, "Session reached terminal state");
            self.emit(SessionEvent::Completed {
                session_id: session_id.to_string(),
                status: new_status,
            });
        }

        self.sessions
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Append an entry to a session's log, returning its index
    pub fn add_entry(&mut self, session_id: &str, entry: AgentSessionEntry) -> Result<usize> {
        self.touch(session_id)?;

        let entries = self.entries.entry(session_id.to_string()).or_default();
        entries.push(entry);
        let index = entries.len() - 1;

        self.emit(SessionEvent::EntryAdded {
            session_id: session_id.to_string(),
            index,
        });
        Ok(index)
    }

    /// Patch an existing entry in place; the log length never changes
    pub fn update_entry(&mut self, session_id: &str, index: usize, patch: EntryPatch) -> Result<()> {
        if !self.sessions.contains_key(session_id) {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }

        let entry = self
            .entries
            .get_mut(session_id)
            .and_then(|entries| entries.get_mut(index))
            .ok_or_else(|| Error::EntryNotFound {
                session_id: session_id.to_string(),
                index,
            })?;
        patch.apply(entry);

        self.touch(session_id)?;
        self.emit(SessionEvent::EntryUpdated {
            session_id: session_id.to_string(),
            index,
        });
        Ok(())
    }

    /// Entries for a session in append order (empty if none)
    pub fn get_entries(&self, session_id: &str) -> &[AgentSessionEntry] {
        self.entries
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Link a child session to its parent
    pub fn set_parent_session(&mut self, child_id: &str, parent_id: &str) -> Result<()> {
        for id in [child_id, parent_id] {
            if !self.sessions.contains_key(id) {
                return Err(Error::SessionNotFound(id.to_string()));
            }
        }
        self.child_to_parent
            .insert(child_id.to_string(), parent_id.to_string());
        Ok(())
    }

    pub fn get_parent_session_id(&self, child_id: &str) -> Option<&SessionId> {
        self.child_to_parent.get(child_id)
    }

    /// Children of a parent session, sorted by id
    pub fn get_child_session_ids(&self, parent_id: &str) -> Vec<SessionId> {
        let mut children: Vec<SessionId> = self
            .child_to_parent
            .iter()
            .filter(|(_, parent)| parent.as_str() == parent_id)
            .map(|(child, _)| child.clone())
            .collect();
        children.sort();
        children
    }

    /// Dump the full registry state
    pub fn serialize_state(&self) -> RegistryState {
        RegistryState {
            sessions: self
                .sessions
                .iter()
                .map(|(id, session)| (id.clone(), session.clone()))
                .collect(),
            entries: self
                .entries
                .iter()
                .map(|(id, entries)| (id.clone(), entries.clone()))
                .collect(),
            child_to_parent_map: self
                .child_to_parent
                .iter()
                .map(|(child, parent)| (child.clone(), parent.clone()))
                .collect(),
        }
    }

    /// Replace the registry contents with a previously serialized state
    pub fn restore_state(&mut self, state: RegistryState) {
        self.sessions = state.sessions.into_iter().collect();
        self.entries = state.entries.into_iter().collect();
        self.child_to_parent = state.child_to_parent_map.into_iter().collect();
        info!(
            sessions = self.sessions.len(),
            links = self.child_to_parent.len(),
            "Restored session registry"
        );
    }

    /// Remove sessions not updated within `max_age`, returning their ids
    pub fn cleanup(&mut self, max_age: Duration) -> Vec<SessionId> {
        self.cleanup_at(Utc::now(), max_age)
    }

    /// Like [`cleanup`](Self::cleanup) with an explicit notion of "now"
    pub fn cleanup_at(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<SessionId> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return Vec::new();
        };

        let mut expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| session.updated_at < cutoff)
            .map(|session| session.id.clone())
            .collect();
        expired.sort();

        for session_id in &expired {
            self.remove_session(session_id);
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "Cleaned up expired sessions");
        }
        expired
    }

    fn remove_session(&mut self, session_id: &str) -> Option<AgentSession> {
        let removed = self.sessions.remove(session_id)?;
        self.entries.remove(session_id);
        self.child_to_parent
            .retain(|child, parent| child != session_id && parent != session_id);
        self.emit(SessionEvent::Removed {
            session_id: session_id.to_string(),
        });
        Some(removed)
    }

    fn touch(&mut self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        session.updated_at = advance(session.updated_at);
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Next `updated_at`: the current time, or 1ms past the previous value if the
/// clock has not moved beyond it.
fn advance(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + chrono::Duration::milliseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{EntryType, SessionStatus, SessionType, Workspace};

    fn session(id: &str) -> AgentSession {
        AgentSession::new(id, SessionType::Delegated, Workspace::new(format!("/tmp/{id}")))
    }

    #[test]
    fn test_create_and_get_returns_equal_session() {
        let mut registry = SessionRegistry::new();
        let created = session("s1").with_thread_key("T1");

        registry.create_session(created.clone()).unwrap();

        assert_eq!(registry.get_session("s1"), Some(&created));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_create_rejects_duplicate_ids() {
        let mut registry = SessionRegistry::new();
        registry.create_session(session("s1")).unwrap();

        let result = registry.create_session(session("s1").with_status(SessionStatus::Running));

        assert!(matches!(result, Err(Error::DuplicateSession(id)) if id == "s1"));
        assert_eq!(registry.get_session("s1").unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn test_update_missing_session_is_not_found() {
        let mut registry = SessionRegistry::new();
        let result = registry.update_session("ghost", SessionPatch::status(SessionStatus::Running));
        assert!(matches!(result, Err(Error::SessionNotFound(_))));
    }

    #[test]
    fn test_update_strictly_advances_updated_at() {
        let mut registry = SessionRegistry::new();
        let future = Utc::now() + chrono::Duration::hours(1);
        registry
            .create_session(session("s1").with_updated_at(future))
            .unwrap();

        let first = registry
            .update_session("s1", SessionPatch::status(SessionStatus::Running))
            .unwrap()
            .updated_at;
        let second = registry
            .update_session("s1", SessionPatch::default())
            .unwrap()
            .updated_at;

        assert!(first > future);
        assert!(second > first);
    }

    #[test]
    fn test_completed_emitted_on_terminal_transition_only() {
        let mut registry = SessionRegistry::new();
        let mut events = registry.subscribe();
        registry.create_session(session("s1")).unwrap();

        registry
            .update_session("s1", SessionPatch::status(SessionStatus::Running))
            .unwrap();
        registry
            .update_session("s1", SessionPatch::status(SessionStatus::Complete))
            .unwrap();
        // Same terminal state again: no second completion
        registry
            .update_session("s1", SessionPatch::status(SessionStatus::Complete))
            .unwrap();
        registry
            .update_session("s1", SessionPatch::status(SessionStatus::Running))
            .unwrap();
        registry
            .update_session("s1", SessionPatch::status(SessionStatus::Error))
            .unwrap();

        let mut completions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Completed { status, .. } = event {
                completions.push(status);
            }
        }
        assert_eq!(completions, vec![SessionStatus::Complete, SessionStatus::Error]);
    }

    #[test]
    fn test_lifecycle_events_reach_subscribers() {
        let mut registry = SessionRegistry::new();
        let mut events = registry.subscribe();
        registry.create_session(session("s1")).unwrap();
        let index = registry.add_entry("s1", AgentSessionEntry::user("hi")).unwrap();
        registry
            .update_entry("s1", index, EntryPatch::append(" there"))
            .unwrap();
        registry.cleanup_at(Utc::now() + chrono::Duration::days(1), Duration::from_secs(3600));

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        let id = "s1".to_string();
        assert_eq!(
            received,
            vec![
                SessionEvent::Created { session_id: id.clone() },
                SessionEvent::EntryAdded { session_id: id.clone(), index: 0 },
                SessionEvent::EntryUpdated { session_id: id.clone(), index: 0 },
                SessionEvent::Removed { session_id: id },
            ]
        );
    }

    #[test]
    fn test_entries_preserve_order_and_update_keeps_length() {
        let mut registry = SessionRegistry::new();
        registry.create_session(session("s1")).unwrap();

        registry.add_entry("s1", AgentSessionEntry::user("do it")).unwrap();
        registry
            .add_entry("s1", AgentSessionEntry::new(EntryType::Thought, "thinking"))
            .unwrap();
        let index = registry
            .add_entry("s1", AgentSessionEntry::response("Par"))
            .unwrap();
        assert_eq!(index, 2);

        registry
            .update_entry("s1", index, EntryPatch::append("tial"))
            .unwrap();

        let entries = registry.get_entries("s1");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].entry_type, EntryType::User);
        assert_eq!(entries[1].entry_type, EntryType::Thought);
        assert_eq!(entries[2].content, "Partial");
    }

    #[test]
    fn test_update_entry_out_of_range() {
        let mut registry = SessionRegistry::new();
        registry.create_session(session("s1")).unwrap();
        registry.add_entry("s1", AgentSessionEntry::user("hi")).unwrap();

        let result = registry.update_entry("s1", 5, EntryPatch::content("x"));

        assert!(matches!(result, Err(Error::EntryNotFound { index: 5, .. })));
        assert_eq!(registry.get_entries("s1")[0].content, "hi");
    }

    #[test]
    fn test_add_entry_to_missing_session() {
        let mut registry = SessionRegistry::new();
        let result = registry.add_entry("ghost", AgentSessionEntry::user("hi"));
        assert!(matches!(result, Err(Error::SessionNotFound(_))));
        assert!(registry.get_entries("ghost").is_empty());
    }

    #[test]
    fn test_parent_child_links() {
        let mut registry = SessionRegistry::new();
        for id in ["parent", "child-a", "child-b"] {
            registry.create_session(session(id)).unwrap();
        }

        registry.set_parent_session("child-b", "parent").unwrap();
        registry.set_parent_session("child-a", "parent").unwrap();

        assert_eq!(
            registry.get_parent_session_id("child-a").map(String::as_str),
            Some("parent")
        );
        assert_eq!(
            registry.get_child_session_ids("parent"),
            vec!["child-a".to_string(), "child-b".to_string()]
        );
        assert!(matches!(
            registry.set_parent_session("child-a", "ghost"),
            Err(Error::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_serialize_restore_round_trip() {
        let mut registry = SessionRegistry::new();
        registry.create_session(session("parent")).unwrap();
        registry.create_session(session("child")).unwrap();
        registry.set_parent_session("child", "parent").unwrap();
        registry.add_entry("child", AgentSessionEntry::user("hello")).unwrap();
        registry
            .update_session("parent", SessionPatch::status(SessionStatus::Complete))
            .unwrap();

        let state = registry.serialize_state();
        let mut restored = SessionRegistry::new();
        restored.restore_state(state.clone());

        assert_eq!(restored.serialize_state(), state);
        assert_eq!(restored.get_session("parent"), registry.get_session("parent"));
        assert_eq!(restored.get_entries("child"), registry.get_entries("child"));
        assert_eq!(
            restored.get_parent_session_id("child").map(String::as_str),
            Some("parent")
        );
    }

    #[test]
    fn test_cleanup_removes_exactly_expired_sessions() {
        let mut registry = SessionRegistry::new();
        let now = Utc::now();
        let old = now - chrono::Duration::hours(48);
        let fresh = now - chrono::Duration::hours(1);

        registry.create_session(session("old").with_updated_at(old)).unwrap();
        registry.create_session(session("fresh").with_updated_at(fresh)).unwrap();
        registry.create_session(session("child").with_updated_at(fresh)).unwrap();
        registry.set_parent_session("child", "old").unwrap();

        let removed = registry.cleanup_at(now, Duration::from_secs(24 * 3600));

        assert_eq!(removed, vec!["old".to_string()]);
        assert!(registry.get_session("old").is_none());
        assert!(registry.get_session("fresh").is_some());
        assert!(registry.get_session("child").is_some());
        assert!(registry.get_parent_session_id("child").is_none());
    }

    #[test]
    fn test_cleanup_keeps_entries_of_survivors() {
        let mut registry = SessionRegistry::new();
        let now = Utc::now();
        registry.create_session(session("keep")).unwrap();
        registry.add_entry("keep", AgentSessionEntry::user("hi")).unwrap();
        registry
            .create_session(session("drop").with_updated_at(now - chrono::Duration::days(10)))
            .unwrap();

        registry.cleanup_at(now, Duration::from_secs(3600));

        assert_eq!(registry.get_entries("keep").len(), 1);
        assert!(registry.get_entries("drop").is_empty());
    }
}
