//! Relay Core - Session orchestration for coding agents
//!
//! This crate provides the core functionality for agent-relay:
//! - Session registry with lifecycle events
//! - Lifecycle engine choosing create, resume, inject or busy per message
//! - Snapshot persistence with schema migration
//! - Correlation of out-of-band questions with their answers
//! - Repository configuration and diffing

pub mod activity;
pub mod backend;
pub mod config;
pub mod config_diff;
pub mod engine;
pub mod error;
pub mod pending;
pub mod persistence;
pub mod session;
pub mod workspace;

pub use activity::{ActivityContent, ActivityId, ActivitySignal, ActivitySink, ActivitySinks};
pub use backend::{
    AgentBackend, BackendCapabilities, BackendCompletion, BackendEvent, BackendFactory,
    BackendKind, BackendLaunch, BackendMessage, BackendRegistry, BackendSessionInfo,
};
pub use config::{Config, ConfigManager, RepositoryConfig};
pub use config_diff::{RepositoryDiff, diff_repositories};
pub use engine::{Decision, EngineBuilder, InboundMessage, SessionLifecycleEngine};
pub use error::{BackendError, Error, Result};
pub use pending::{CorrelationOutcome, PendingAnswer, PendingCorrelationTable};
pub use persistence::{PersistedSnapshot, PersistenceStore};
pub use session::{
    AgentSession, AgentSessionEntry, EntryType, SessionEvent, SessionId, SessionRegistry,
    SessionStatus, SessionType, SharedRegistry, Workspace,
};
pub use workspace::{DirectWorkspaceProvider, WorkspaceProvider, WorkspaceRequest};
