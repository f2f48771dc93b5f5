//! Backend event handling
//!
//! Each backend gets one pump task that applies its events in arrival order.
//! Events are tagged with the backend's generation; once a backend's live
//! handle is gone (completed, failed, aborted or replaced) its late events
//! no longer touch the session.

use tracing::{debug, info, warn};

use super::{LiveBackend, SessionLifecycleEngine};
use crate::activity::ActivityContent;
use crate::backend::{BackendCompletion, BackendEvent, BackendEventReceiver, BackendMessage};
use crate::error::Result;
use crate::session::{
    AgentSessionEntry, EntryPatch, EntryType, SessionId, SessionPatch, SessionRegistry,
    SessionStatus,
};

impl SessionLifecycleEngine {
    pub(super) fn spawn_event_pump(
        &self,
        session_id: SessionId,
        generation: u64,
        mut events: BackendEventReceiver,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                engine.on_backend_event(&session_id, generation, event).await;
            }
            debug!(session_id = %session_id, generation, "Backend event stream closed");
        });
    }

    async fn on_backend_event(&self, session_id: &str, generation: u64, event: BackendEvent) {
        match event {
            BackendEvent::Message(message) => self.on_message(session_id, generation, message).await,
            BackendEvent::Error(error) => self.fail_session(session_id, generation, &error).await,
            BackendEvent::Complete(completion) => {
                self.complete_session(session_id, generation, completion)
                    .await
            }
        }
    }

    async fn on_message(&self, session_id: &str, generation: u64, message: BackendMessage) {
        {
            let mut state = self.inner.state.lock();
            let Some(live) = state
                .live
                .get_mut(session_id)
                .filter(|live| live.generation == generation)
            else {
                debug!(session_id = %session_id, "Ignoring message from a replaced backend");
                return;
            };
            let mut registry = self.inner.registry.lock();
            if let Err(e) = record_message(&mut registry, live, session_id, &message) {
                warn!(session_id = %session_id, "Failed to record backend message: {}", e);
                return;
            }
            if !message.partial && message.entry_type == EntryType::Response {
                live.posted_response = Some(message.content.clone());
            }
        }

        if !message.partial {
            self.post(session_id, activity_for(&message), None).await;
        }
        self.persist().await;
    }

    async fn complete_session(
        &self,
        session_id: &str,
        generation: u64,
        completion: BackendCompletion,
    ) {
        let Some(live) = self.inner.state.lock().take_live(session_id, generation) else {
            debug!(session_id = %session_id, "Ignoring completion from a replaced backend");
            return;
        };

        let unposted_result = {
            let mut registry = self.inner.registry.lock();
            let Some(kind) = registry.get_session(session_id).map(|session| session.backend) else {
                warn!(session_id = %session_id, "Completed session is no longer registered");
                return;
            };

            // Text still streaming in counts as the result when none is given
            let streamed = match live.partial {
                Some((EntryType::Response, index)) => registry
                    .get_entries(session_id)
                    .get(index)
                    .map(|entry| entry.content.clone()),
                _ => None,
            };
            let result = completion.result.or(streamed);

            let last_response = registry
                .get_entries(session_id)
                .iter()
                .rev()
                .find(|entry| entry.entry_type == EntryType::Response)
                .map(|entry| entry.content.clone());
            if let Some(result) = &result
                && last_response.as_deref() != Some(result.as_str())
                && let Err(e) = registry.add_entry(session_id, AgentSessionEntry::response(result))
            {
                warn!(session_id = %session_id, "Failed to record final result: {}", e);
            }

            let mut patch = SessionPatch::status(SessionStatus::Complete);
            if let Some(token) = completion.resume_token {
                patch = patch.with_resume_token(kind, token);
            }
            if let Err(e) = registry.update_session(session_id, patch) {
                warn!(session_id = %session_id, "Failed to mark session complete: {}", e);
            }
            result.filter(|result| live.posted_response.as_deref() != Some(result.as_str()))
        };
        info!(session_id = %session_id, "Session completed");

        self.inner.pending.cancel(session_id);
        if let Some(result) = unposted_result {
            self.post(session_id, ActivityContent::response(result), None)
                .await;
        }
        self.report_undelivered(session_id, live).await;
        self.persist().await;
    }
}

/// Append a backend message, or fold it into the entry being streamed
fn record_message(
    registry: &mut SessionRegistry,
    live: &mut LiveBackend,
    session_id: &str,
    message: &BackendMessage,
) -> Result<()> {
    match live.partial {
        Some((entry_type, index)) if entry_type == message.entry_type => {
            let patch = if message.partial {
                EntryPatch::append(&message.content)
            } else {
                live.partial = None;
                EntryPatch {
                    metadata: message.metadata.clone(),
                    ..EntryPatch::content(&message.content)
                }
            };
            registry.update_entry(session_id, index, patch)
        }
        _ => {
            let mut entry = AgentSessionEntry::new(message.entry_type, &message.content);
            entry.metadata = message.metadata.clone();
            let index = registry.add_entry(session_id, entry)?;
            live.partial = message.partial.then_some((message.entry_type, index));
            Ok(())
        }
    }
}

fn activity_for(message: &BackendMessage) -> ActivityContent {
    let content = message.content.clone();
    match message.entry_type {
        EntryType::Action => {
            let field = |key: &str| {
                message
                    .metadata
                    .as_ref()
                    .and_then(|metadata| metadata.get(key))
                    .and_then(|value| value.as_str())
                    .map(str::to_string)
            };
            ActivityContent::Action {
                action: content,
                parameter: field("parameter"),
                result: field("result"),
            }
        }
        EntryType::Response => ActivityContent::response(content),
        EntryType::Error => ActivityContent::error(content),
        EntryType::Elicitation => ActivityContent::elicitation(content),
        EntryType::Thought | EntryType::User => ActivityContent::thought(content),
    }
}
