//! Inbound messages and the decisions taken for them

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::session::{IssueContext, SessionId, SessionType, ThreadKey};

/// A normalized event from a platform adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub thread_key: ThreadKey,
    /// Platform the message came from; selects the activity sink
    pub platform: String,
    pub text: String,
    pub session_type: SessionType,
    #[serde(default)]
    pub repository_id: Option<String>,
    #[serde(default)]
    pub issue_context: Option<IssueContext>,
    #[serde(default)]
    pub external_session_id: Option<String>,
    /// Overrides the repository and global backend choice
    #[serde(default)]
    pub backend: Option<BackendKind>,
    /// Links the session created for this message to a parent
    #[serde(default)]
    pub parent_session_id: Option<SessionId>,
}

impl InboundMessage {
    /// Message from a chat conversation
    pub fn chat(
        thread_key: impl Into<ThreadKey>,
        platform: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            thread_key: thread_key.into(),
            platform: platform.into(),
            text: text.into(),
            session_type: SessionType::Chat,
            repository_id: None,
            issue_context: None,
            external_session_id: None,
            backend: None,
            parent_session_id: None,
        }
    }

    /// Message about a work item delegated from an issue tracker
    pub fn delegated(
        thread_key: impl Into<ThreadKey>,
        platform: impl Into<String>,
        text: impl Into<String>,
        issue_context: IssueContext,
    ) -> Self {
        Self {
            session_type: SessionType::Delegated,
            issue_context: Some(issue_context),
            ..Self::chat(thread_key, platform, text)
        }
    }

    pub fn with_repository(mut self, repository_id: impl Into<String>) -> Self {
        self.repository_id = Some(repository_id.into());
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_external_session_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_session_id = Some(external_id.into());
        self
    }

    pub fn with_parent(mut self, parent_session_id: impl Into<SessionId>) -> Self {
        self.parent_session_id = Some(parent_session_id.into());
        self
    }
}

/// What the engine did with an inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "camelCase")]
pub enum Decision {
    /// New session and fresh backend
    Created { session_id: SessionId },
    /// Pushed into a live backend's input stream
    Injected { session_id: SessionId },
    /// A backend is already working on this thread; nothing was started
    Busy { session_id: SessionId },
    /// Backend reconstructed from the stored resume token
    Resumed { session_id: SessionId },
    /// Resolved the session's open question
    Answered { session_id: SessionId },
}

impl Decision {
    pub fn session_id(&self) -> &str {
        match self {
            Decision::Created { session_id }
            | Decision::Injected { session_id }
            | Decision::Busy { session_id }
            | Decision::Resumed { session_id }
            | Decision::Answered { session_id } => session_id,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Created { .. } => "created",
            Decision::Injected { .. } => "injected",
            Decision::Busy { .. } => "busy",
            Decision::Resumed { .. } => "resumed",
            Decision::Answered { .. } => "answered",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.session_id())
    }
}
