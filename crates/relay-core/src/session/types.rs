//! Session types for the orchestration core
//!
//! These types describe a tracked unit of agent work (`AgentSession`), its
//! ordered activity log (`AgentSessionEntry`), and the partial updates the
//! registry applies to them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::BackendKind;

/// Unique identifier for a session (globally unique across repositories)
pub type SessionId = String;

/// Stable identifier grouping all messages of one conversation
pub type ThreadKey = String;

/// Free-form session metadata
pub type Metadata = Map<String, Value>;

/// How a session came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    /// Work item delegated from an issue tracker
    #[default]
    Delegated,
    /// Conversation started from a chat mention
    Chat,
}

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Running,
    Complete,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Running => "running",
            SessionStatus::Complete => "complete",
            SessionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "running" => Ok(SessionStatus::Running),
            "complete" | "completed" => Ok(SessionStatus::Complete),
            "error" => Ok(SessionStatus::Error),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// Work item a delegated session is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueContext {
    /// Which issue tracker owns the work item (e.g. "linear", "github")
    pub tracker_id: String,
    pub work_item_id: String,
    /// Human-readable identifier such as `ENG-42`
    pub work_item_identifier: String,
}

impl IssueContext {
    pub fn new(
        tracker_id: impl Into<String>,
        work_item_id: impl Into<String>,
        work_item_identifier: impl Into<String>,
    ) -> Self {
        Self {
            tracker_id: tracker_id.into(),
            work_item_id: work_item_id.into(),
            work_item_identifier: work_item_identifier.into(),
        }
    }
}

/// Directory a session's backend works in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub path: PathBuf,
    #[serde(default)]
    pub is_worktree: bool,
}

impl Workspace {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_worktree: false,
        }
    }

    pub fn worktree(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_worktree: true,
        }
    }
}

/// Resume tokens, one named slot per supported backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gemini: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl ResumeTokens {
    pub fn get(&self, kind: BackendKind) -> Option<&str> {
        self.slot(kind).as_deref()
    }

    pub fn set(&mut self, kind: BackendKind, token: impl Into<String>) {
        *self.slot_mut(kind) = Some(token.into());
    }

    pub fn clear(&mut self, kind: BackendKind) {
        *self.slot_mut(kind) = None;
    }

    fn slot(&self, kind: BackendKind) -> &Option<String> {
        match kind {
            BackendKind::Claude => &self.claude,
            BackendKind::Codex => &self.codex,
            BackendKind::Gemini => &self.gemini,
            BackendKind::Cursor => &self.cursor,
        }
    }

    fn slot_mut(&mut self, kind: BackendKind) -> &mut Option<String> {
        match kind {
            BackendKind::Claude => &mut self.claude,
            BackendKind::Codex => &mut self.codex,
            BackendKind::Gemini => &mut self.gemini,
            BackendKind::Cursor => &mut self.cursor,
        }
    }
}

/// One tracked unit of agent work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub id: SessionId,
    /// Identifier the originating platform uses for this session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_session_id: Option<String>,
    #[serde(rename = "type", default)]
    pub session_type: SessionType,
    #[serde(default)]
    pub status: SessionStatus,
    /// Chat sessions have no work item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_context: Option<IssueContext>,
    pub workspace: Workspace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_key: Option<ThreadKey>,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub resume_tokens: ResumeTokens,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentSession {
    /// Create a new active session with the given id and workspace
    pub fn new(id: impl Into<SessionId>, session_type: SessionType, workspace: Workspace) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            external_session_id: None,
            session_type,
            status: SessionStatus::Active,
            issue_context: None,
            workspace,
            repository_id: None,
            thread_key: None,
            backend: BackendKind::default(),
            resume_tokens: ResumeTokens::default(),
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_external_session_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_session_id = Some(external_id.into());
        self
    }

    pub fn with_issue_context(mut self, issue_context: IssueContext) -> Self {
        self.issue_context = Some(issue_context);
        self
    }

    pub fn with_repository(mut self, repository_id: impl Into<String>) -> Self {
        self.repository_id = Some(repository_id.into());
        self
    }

    pub fn with_thread_key(mut self, thread_key: impl Into<ThreadKey>) -> Self {
        self.thread_key = Some(thread_key.into());
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Resume token for the backend this session runs on
    pub fn resume_token(&self) -> Option<&str> {
        self.resume_tokens.get(self.backend)
    }
}

/// Kind of an entry in a session's activity log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Inbound prompt from the user
    User,
    Thought,
    Action,
    Response,
    Error,
    /// Out-of-band question posted to the user
    Elicitation,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::User => "user",
            EntryType::Thought => "thought",
            EntryType::Action => "action",
            EntryType::Response => "response",
            EntryType::Error => "error",
            EntryType::Elicitation => "elicitation",
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a session's ordered activity log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSessionEntry {
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl AgentSessionEntry {
    pub fn new(entry_type: EntryType, content: impl Into<String>) -> Self {
        Self {
            entry_type,
            content: content.into(),
            metadata: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(EntryType::User, content)
    }

    pub fn response(content: impl Into<String>) -> Self {
        Self::new(EntryType::Response, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(EntryType::Error, content)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Partial update merged into a session by the registry
///
/// Unset fields are left as they are; `metadata` is merged key by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub external_session_id: Option<String>,
    pub issue_context: Option<IssueContext>,
    pub workspace: Option<Workspace>,
    pub thread_key: Option<ThreadKey>,
    pub backend: Option<BackendKind>,
    pub resume_token: Option<(BackendKind, String)>,
    pub metadata: Metadata,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_resume_token(mut self, kind: BackendKind, token: impl Into<String>) -> Self {
        self.resume_token = Some((kind, token.into()));
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_thread_key(mut self, thread_key: impl Into<ThreadKey>) -> Self {
        self.thread_key = Some(thread_key.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub(crate) fn apply(self, session: &mut AgentSession) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(external_id) = self.external_session_id {
            session.external_session_id = Some(external_id);
        }
        if let Some(issue_context) = self.issue_context {
            session.issue_context = Some(issue_context);
        }
        if let Some(workspace) = self.workspace {
            session.workspace = workspace;
        }
        if let Some(thread_key) = self.thread_key {
            session.thread_key = Some(thread_key);
        }
        if let Some(backend) = self.backend {
            session.backend = backend;
        }
        if let Some((kind, token)) = self.resume_token {
            session.resume_tokens.set(kind, token);
        }
        session.metadata.extend(self.metadata);
    }
}

/// In-place patch for an existing entry, used for streaming accretion
///
/// `type` and `content` can be replaced but never cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryPatch {
    pub entry_type: Option<EntryType>,
    pub content: Option<String>,
    /// Text appended after `content` has been applied
    pub append: Option<String>,
    pub metadata: Option<Metadata>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl EntryPatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn append(text: impl Into<String>) -> Self {
        Self {
            append: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, entry_type: EntryType) -> Self {
        self.entry_type = Some(entry_type);
        self
    }

    pub(crate) fn apply(self, entry: &mut AgentSessionEntry) {
        if let Some(entry_type) = self.entry_type {
            entry.entry_type = entry_type;
        }
        if let Some(content) = self.content {
            entry.content = content;
        }
        if let Some(text) = self.append {
            entry.content.push_str(&text);
        }
        if let Some(metadata) = self.metadata {
            entry.metadata.get_or_insert_with(Metadata::new).extend(metadata);
        }
        if let Some(timestamp) = self.timestamp {
            entry.timestamp = Some(timestamp);
        }
    }
}

/// Full registry dump, as persisted in a snapshot
///
/// Live backend handles are never part of this state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryState {
    #[serde(default)]
    pub sessions: BTreeMap<SessionId, AgentSession>,
    #[serde(default)]
    pub entries: BTreeMap<SessionId, Vec<AgentSessionEntry>>,
    #[serde(default)]
    pub child_to_parent_map: BTreeMap<SessionId, SessionId>,
}
