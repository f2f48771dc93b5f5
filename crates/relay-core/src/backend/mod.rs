//! Backend interface for agent execution engines
//!
//! A backend runs agent turns for one session in one workspace. Concrete
//! drivers (subprocess or SDK clients) live outside this crate; the core only
//! talks to them through [`AgentBackend`] and receives their output as
//! [`BackendEvent`]s on the channel handed over at construction.
//!
//! Backends are selected by name through a [`BackendFactory`]. A name that
//! does not map to a [`BackendKind`], or a kind without an installed driver,
//! yields [`Error::BackendNotAvailable`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::RepositoryConfig;
use crate::error::{BackendError, Error, Result};
use crate::session::{EntryType, Metadata, SessionId, Workspace};

/// Supported backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Claude,
    Codex,
    Gemini,
    Cursor,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Claude,
        BackendKind::Codex,
        BackendKind::Gemini,
        BackendKind::Cursor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::Codex => "codex",
            BackendKind::Gemini => "gemini",
            BackendKind::Cursor => "cursor",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "claude" | "claude-code" => Ok(BackendKind::Claude),
            "codex" | "openai-codex" => Ok(BackendKind::Codex),
            "gemini" | "google" => Ok(BackendKind::Gemini),
            "cursor" | "cursor-agent" => Ok(BackendKind::Cursor),
            _ => Err(Error::BackendNotAvailable {
                backend: s.to_string(),
            }),
        }
    }
}

/// What a backend can do beyond a single prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendCapabilities {
    /// Accepts further input while a turn is running
    pub supports_streaming_input: bool,
}

/// Returned by a successful start or resume
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSessionInfo {
    /// Opaque handle letting a later process continue this conversation
    pub resume_token: Option<String>,
}

impl BackendSessionInfo {
    pub fn with_resume_token(token: impl Into<String>) -> Self {
        Self {
            resume_token: Some(token.into()),
        }
    }
}

/// Output produced by a backend during a turn
///
/// Partial messages carry deltas that are appended to the entry currently
/// being streamed. A non-partial message of the same type that follows them
/// carries the full text and replaces the accumulated content.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendMessage {
    pub entry_type: EntryType,
    pub content: String,
    pub partial: bool,
    pub metadata: Option<Metadata>,
}

impl BackendMessage {
    pub fn new(entry_type: EntryType, content: impl Into<String>) -> Self {
        Self {
            entry_type,
            content: content.into(),
            partial: false,
            metadata: None,
        }
    }

    pub fn thought(content: impl Into<String>) -> Self {
        Self::new(EntryType::Thought, content)
    }

    pub fn action(content: impl Into<String>) -> Self {
        Self::new(EntryType::Action, content)
    }

    pub fn response(content: impl Into<String>) -> Self {
        Self::new(EntryType::Response, content)
    }

    /// A streamed fragment of a response
    pub fn response_delta(content: impl Into<String>) -> Self {
        Self {
            partial: true,
            ..Self::new(EntryType::Response, content)
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Final outcome of a backend turn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendCompletion {
    /// Final result text, if the backend produced one
    pub result: Option<String>,
    pub resume_token: Option<String>,
}

/// Events emitted by a running backend
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Message(BackendMessage),
    Error(BackendError),
    Complete(BackendCompletion),
}

pub type BackendEventSender = mpsc::UnboundedSender<BackendEvent>;
pub type BackendEventReceiver = mpsc::UnboundedReceiver<BackendEvent>;

/// Everything a driver needs to run a session
#[derive(Debug, Clone)]
pub struct BackendLaunch {
    pub session_id: SessionId,
    pub workspace: Workspace,
    /// Set when continuing a prior conversation
    pub resume_token: Option<String>,
    pub repository: Option<RepositoryConfig>,
    pub events: BackendEventSender,
}

/// Narrow interface to an agent execution engine
///
/// Implementations use interior mutability; the engine shares them behind an
/// `Arc` and never holds a lock while awaiting them.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> BackendCapabilities;

    /// Run a single prompt
    async fn start(&self, prompt: &str) -> std::result::Result<BackendSessionInfo, BackendError>;

    /// Start a turn that keeps accepting input via `add_stream_message`
    async fn start_streaming(
        &self,
        prompt: &str,
    ) -> std::result::Result<BackendSessionInfo, BackendError> {
        let _ = prompt;
        Err(BackendError::NotStreaming)
    }

    async fn add_stream_message(&self, text: &str) -> std::result::Result<(), BackendError> {
        let _ = text;
        Err(BackendError::NotStreaming)
    }

    /// Signal that no more streamed input will follow
    ///
    /// The engine calls this before `stop` whenever `is_streaming` holds.
    async fn complete_stream(&self) -> std::result::Result<(), BackendError> {
        Ok(())
    }

    async fn stop(&self) -> std::result::Result<(), BackendError>;

    fn is_running(&self) -> bool;

    fn is_streaming(&self) -> bool {
        false
    }
}

/// Constructs backends by kind
pub trait BackendFactory: Send + Sync {
    /// Build a backend for `launch`, or `BackendNotAvailable` if no driver is installed
    fn create(&self, kind: BackendKind, launch: BackendLaunch) -> Result<Arc<dyn AgentBackend>>;

    /// Resolve a backend by name, then build it
    fn create_by_name(&self, name: &str, launch: BackendLaunch) -> Result<Arc<dyn AgentBackend>> {
        let kind: BackendKind = name.parse()?;
        self.create(kind, launch)
    }
}

/// Constructor for one backend kind
pub type BackendConstructor =
    Arc<dyn Fn(BackendLaunch) -> Result<Arc<dyn AgentBackend>> + Send + Sync>;

/// Registry of installed backend drivers
#[derive(Default, Clone)]
pub struct BackendRegistry {
    constructors: HashMap<BackendKind, BackendConstructor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver for a backend kind, replacing any previous one
    pub fn register<F>(&mut self, kind: BackendKind, constructor: F)
    where
        F: Fn(BackendLaunch) -> Result<Arc<dyn AgentBackend>> + Send + Sync + 'static,
    {
        self.constructors.insert(kind, Arc::new(constructor));
    }

    pub fn is_registered(&self, kind: BackendKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Installed kinds in declaration order
    pub fn kinds(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| self.is_registered(*kind))
            .collect()
    }
}

impl BackendFactory for BackendRegistry {
    fn create(&self, kind: BackendKind, launch: BackendLaunch) -> Result<Arc<dyn AgentBackend>> {
        let constructor = self
            .constructors
            .get(&kind)
            .ok_or_else(|| Error::BackendNotAvailable {
                backend: kind.to_string(),
            })?;
        constructor(launch)
    }
}
