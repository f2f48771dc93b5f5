//! Session module - registry of tracked agent sessions
//!
//! - `SessionRegistry`: authoritative in-memory store of sessions, entry logs
//!   and parent/child links
//! - `SessionEvent`: typed lifecycle notifications from the registry
//! - `AgentSession` / `AgentSessionEntry`: the tracked data
//!
//! # Example Usage
//!
//! ```ignore
//! use relay_core::session::{AgentSession, SessionRegistry, SessionType, Workspace};
//!
//! let registry = SessionRegistry::new().shared();
//! let mut events = registry.lock().subscribe();
//!
//! registry
//!     .lock()
//!     .create_session(AgentSession::new("s1", SessionType::Chat, Workspace::new("/tmp/w")))?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

mod events;
mod registry;
mod types;

pub use events::SessionEvent;
pub use registry::{SessionRegistry, SharedRegistry};
pub use types::{
    AgentSession, AgentSessionEntry, EntryPatch, EntryType, IssueContext, Metadata,
    RegistryState, ResumeTokens, SessionId, SessionPatch, SessionStatus, SessionType, ThreadKey,
    Workspace,
};
