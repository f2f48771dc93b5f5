//! Activity sinks - publishing session activity to the originating platform
//!
//! Each platform (issue tracker, chat service) registers one sink. The engine
//! posts thoughts, actions, responses, errors and elicitation requests to the
//! sink of the platform a session came from.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::session::EntryType;

/// Identity of a posted activity, as assigned by the platform
pub type ActivityId = String;

/// Content of one activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActivityContent {
    Thought {
        body: String,
    },
    Action {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parameter: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    Response {
        body: String,
    },
    Error {
        body: String,
    },
    Elicitation {
        body: String,
    },
}

impl ActivityContent {
    pub fn thought(body: impl Into<String>) -> Self {
        Self::Thought { body: body.into() }
    }

    pub fn response(body: impl Into<String>) -> Self {
        Self::Response { body: body.into() }
    }

    pub fn error(body: impl Into<String>) -> Self {
        Self::Error { body: body.into() }
    }

    pub fn elicitation(body: impl Into<String>) -> Self {
        Self::Elicitation { body: body.into() }
    }

    pub fn entry_type(&self) -> EntryType {
        match self {
            ActivityContent::Thought { .. } => EntryType::Thought,
            ActivityContent::Action { .. } => EntryType::Action,
            ActivityContent::Response { .. } => EntryType::Response,
            ActivityContent::Error { .. } => EntryType::Error,
            ActivityContent::Elicitation { .. } => EntryType::Elicitation,
        }
    }

    /// Main text of the activity
    pub fn body(&self) -> &str {
        match self {
            ActivityContent::Thought { body }
            | ActivityContent::Response { body }
            | ActivityContent::Error { body }
            | ActivityContent::Elicitation { body } => body,
            ActivityContent::Action { action, .. } => action,
        }
    }
}

/// Hint to the platform about how to present an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivitySignal {
    /// The session waits for the user's answer
    AwaitingInput,
    /// The session was stopped
    Stop,
}

/// Per-platform activity publisher
#[async_trait]
pub trait ActivitySink: Send + Sync {
    /// Platform name matching `InboundMessage::platform`
    fn platform(&self) -> &str;

    async fn post_activity(
        &self,
        session_id: &str,
        content: ActivityContent,
        signal: Option<ActivitySignal>,
    ) -> Result<ActivityId>;
}

/// Sinks keyed by platform name
#[derive(Default, Clone)]
pub struct ActivitySinks {
    sinks: HashMap<String, Arc<dyn ActivitySink>>,
}

impl ActivitySinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink under its platform name, replacing any previous one
    pub fn register(&mut self, sink: Arc<dyn ActivitySink>) {
        self.sinks.insert(sink.platform().to_string(), sink);
    }

    pub fn with(mut self, sink: Arc<dyn ActivitySink>) -> Self {
        self.register(sink);
        self
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn ActivitySink>> {
        self.sinks.get(platform).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}
