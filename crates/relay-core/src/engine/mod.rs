//! Session lifecycle engine
//!
//! Turns inbound messages into session actions. For each message the engine
//! looks up the thread's session and picks exactly one of:
//!
//! | Session | Backend alive | Streams input | Decision |
//! |---------|---------------|---------------|----------|
//! | none    | -             | -             | create   |
//! | yes     | yes           | yes           | inject   |
//! | yes     | yes           | no            | busy     |
//! | yes     | no (token)    | -             | resume   |
//! | yes     | no, no token  | -             | create   |
//!
//! A session with an open question takes the message as the answer instead.
//!
//! The decision and the bookkeeping it implies happen under the engine's
//! state lock with no `.await` in between, so a second message on the same
//! thread always observes the first one's effect. This table is the only
//! thing keeping two backends off one workspace.

mod events;
mod message;

pub use message::{Decision, InboundMessage};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activity::{ActivityContent, ActivitySignal, ActivitySink, ActivitySinks};
use crate::backend::{
    AgentBackend, BackendEventReceiver, BackendFactory, BackendKind, BackendLaunch,
};
use crate::config::RepositoryConfig;
use crate::config_diff::{self, RepositoryDiff};
use crate::error::{BackendError, Error, Result};
use crate::pending::{CorrelationOutcome, PendingCorrelationTable};
use crate::persistence::PersistenceStore;
use crate::session::{
    AgentSession, AgentSessionEntry, EntryType, SessionId, SessionPatch, SessionRegistry,
    SessionStatus, SharedRegistry, ThreadKey,
};
use crate::workspace::{WorkspaceProvider, WorkspaceRequest};

/// Session metadata key naming the platform a session came from
pub const PLATFORM_KEY: &str = "platform";
/// Session metadata key set when a session is aborted
pub const STOP_REASON_KEY: &str = "stopReason";
/// Session metadata key holding the last backend error
pub const LAST_ERROR_KEY: &str = "lastError";

const BUSY_NOTICE: &str =
    "Still working on the previous request in this thread. Please wait until it finishes.";
const STOPPED_NOTICE: &str = "Session stopped";

enum ThreadSlot {
    /// Creation in flight; the id is already assigned
    Reserved(SessionId),
    Bound(SessionId),
}

enum LivePhase {
    /// `start` has not returned yet; streamed input is held back
    Starting { queued: Vec<String> },
    Ready,
}

struct LiveBackend {
    backend: Arc<dyn AgentBackend>,
    /// Distinguishes this backend's events from those of an earlier one
    generation: u64,
    phase: LivePhase,
    /// Entry receiving streamed deltas
    partial: Option<(EntryType, usize)>,
    /// Last response text published to the platform
    posted_response: Option<String>,
}

impl LiveBackend {
    fn starting(backend: Arc<dyn AgentBackend>, generation: u64) -> Self {
        Self {
            backend,
            generation,
            phase: LivePhase::Starting { queued: Vec::new() },
            partial: None,
            posted_response: None,
        }
    }
}

#[derive(Default)]
struct EngineState {
    threads: HashMap<ThreadKey, ThreadSlot>,
    live: HashMap<SessionId, LiveBackend>,
    repositories: HashMap<String, RepositoryConfig>,
}

impl EngineState {
    fn reserve(&mut self, thread_key: &str) -> Action {
        let session_id = Uuid::new_v4().to_string();
        self.threads.insert(
            thread_key.to_string(),
            ThreadSlot::Reserved(session_id.clone()),
        );
        Action::Create { session_id }
    }

    /// Drop a creation reservation that never turned into a session
    fn release(&mut self, thread_key: &str, session_id: &str) {
        if matches!(self.threads.get(thread_key), Some(ThreadSlot::Reserved(id)) if id == session_id)
        {
            self.threads.remove(thread_key);
        }
    }

    /// Remove the live handle if it still belongs to `generation`
    fn take_live(&mut self, session_id: &str, generation: u64) -> Option<LiveBackend> {
        match self.live.get(session_id) {
            Some(live) if live.generation == generation => self.live.remove(session_id),
            _ => None,
        }
    }
}

enum Action {
    Create {
        session_id: SessionId,
    },
    Inject {
        session_id: SessionId,
        backend: Arc<dyn AgentBackend>,
    },
    Queued {
        session_id: SessionId,
    },
    Busy {
        session_id: SessionId,
    },
    Resume {
        session_id: SessionId,
        kind: BackendKind,
        backend: Arc<dyn AgentBackend>,
        generation: u64,
        events: BackendEventReceiver,
    },
    Answered {
        session_id: SessionId,
    },
}

struct EngineInner {
    registry: SharedRegistry,
    store: Arc<PersistenceStore>,
    pending: Arc<PendingCorrelationTable>,
    backends: Arc<dyn BackendFactory>,
    workspaces: Arc<dyn WorkspaceProvider>,
    sinks: ActivitySinks,
    default_backend: BackendKind,
    state: parking_lot::Mutex<EngineState>,
    generations: AtomicU64,
    /// Orders snapshot capture with the write that follows it
    save_lock: tokio::sync::Mutex<()>,
}

/// Builder for [`SessionLifecycleEngine`]
pub struct EngineBuilder {
    store: Arc<PersistenceStore>,
    backends: Arc<dyn BackendFactory>,
    workspaces: Arc<dyn WorkspaceProvider>,
    registry: Option<SharedRegistry>,
    pending: Option<Arc<PendingCorrelationTable>>,
    sinks: ActivitySinks,
    default_backend: BackendKind,
    repositories: Vec<RepositoryConfig>,
}

impl EngineBuilder {
    /// Share an existing registry with platform adapters
    pub fn registry(mut self, registry: SharedRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn pending(mut self, pending: Arc<PendingCorrelationTable>) -> Self {
        self.pending = Some(pending);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ActivitySink>) -> Self {
        self.sinks.register(sink);
        self
    }

    pub fn sinks(mut self, sinks: ActivitySinks) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn default_backend(mut self, kind: BackendKind) -> Self {
        self.default_backend = kind;
        self
    }

    pub fn repositories(mut self, repositories: Vec<RepositoryConfig>) -> Self {
        self.repositories = repositories;
        self
    }

    pub fn build(self) -> Result<SessionLifecycleEngine> {
        config_diff::validate_repositories(&self.repositories)?;

        let state = EngineState {
            repositories: self
                .repositories
                .into_iter()
                .map(|repo| (repo.id.clone(), repo))
                .collect(),
            ..Default::default()
        };

        Ok(SessionLifecycleEngine {
            inner: Arc::new(EngineInner {
                registry: self.registry.unwrap_or_else(|| SessionRegistry::new().shared()),
                store: self.store,
                pending: self.pending.unwrap_or_default(),
                backends: self.backends,
                workspaces: self.workspaces,
                sinks: self.sinks,
                default_backend: self.default_backend,
                state: parking_lot::Mutex::new(state),
                generations: AtomicU64::new(1),
                save_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }
}

/// Decides and drives the lifecycle of every session
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SessionLifecycleEngine {
    inner: Arc<EngineInner>,
}

impl SessionLifecycleEngine {
    pub fn builder(
        store: Arc<PersistenceStore>,
        backends: Arc<dyn BackendFactory>,
        workspaces: Arc<dyn WorkspaceProvider>,
    ) -> EngineBuilder {
        EngineBuilder {
            store,
            backends,
            workspaces,
            registry: None,
            pending: None,
            sinks: ActivitySinks::new(),
            default_backend: BackendKind::default(),
            repositories: Vec::new(),
        }
    }

    pub fn registry(&self) -> SharedRegistry {
        self.inner.registry.clone()
    }

    pub fn pending(&self) -> Arc<PendingCorrelationTable> {
        self.inner.pending.clone()
    }

    /// Whether a backend is currently held for the session
    pub fn is_live(&self, session_id: &str) -> bool {
        self.inner.state.lock().live.contains_key(session_id)
    }

    /// Session bound to a thread, if its creation has completed
    pub fn session_for_thread(&self, thread_key: &str) -> Option<SessionId> {
        match self.inner.state.lock().threads.get(thread_key) {
            Some(ThreadSlot::Bound(id)) => Some(id.clone()),
            _ => None,
        }
    }

    /// Repositories currently installed, sorted by id
    pub fn repositories(&self) -> Vec<RepositoryConfig> {
        let mut repositories: Vec<RepositoryConfig> =
            self.inner.state.lock().repositories.values().cloned().collect();
        repositories.sort_by(|a, b| a.id.cmp(&b.id));
        repositories
    }

    /// Route an inbound message to its session
    pub async fn handle_message(&self, message: InboundMessage) -> Result<Decision> {
        let action = self.decide(&message)?;

        match action {
            Action::Create { session_id } => {
                let result = self.create(&session_id, &message).await;
                if result.is_err() {
                    self.inner
                        .state
                        .lock()
                        .release(&message.thread_key, &session_id);
                }
                result.map(|()| Decision::Created { session_id })
            }
            Action::Inject { session_id, backend } => {
                self.persist().await;
                backend.add_stream_message(&message.text).await?;
                debug!(session_id = %session_id, "Injected message into live backend");
                Ok(Decision::Injected { session_id })
            }
            Action::Queued { session_id } => {
                self.persist().await;
                debug!(session_id = %session_id, "Queued message until backend has started");
                Ok(Decision::Injected { session_id })
            }
            Action::Busy { session_id } => {
                info!(
                    session_id = %session_id,
                    thread_key = %message.thread_key,
                    "Backend busy, not starting another one"
                );
                self.post_to(
                    Some(&message.platform),
                    &session_id,
                    ActivityContent::thought(BUSY_NOTICE),
                    None,
                )
                .await;
                Ok(Decision::Busy { session_id })
            }
            Action::Resume {
                session_id,
                kind,
                backend,
                generation,
                events,
            } => {
                info!(session_id = %session_id, backend = %kind, "Resuming session");
                self.spawn_event_pump(session_id.clone(), generation, events);
                self.persist().await;
                self.start_backend(&session_id, kind, backend, generation, &message.text)
                    .await?;
                Ok(Decision::Resumed { session_id })
            }
            Action::Answered { session_id } => {
                self.persist().await;
                Ok(Decision::Answered { session_id })
            }
        }
    }

    fn decide(&self, message: &InboundMessage) -> Result<Action> {
        let mut state = self.inner.state.lock();

        let session_id = match state.threads.get(&message.thread_key) {
            Some(ThreadSlot::Reserved(id)) => {
                return Ok(Action::Busy {
                    session_id: id.clone(),
                });
            }
            Some(ThreadSlot::Bound(id)) => id.clone(),
            None => return Ok(state.reserve(&message.thread_key)),
        };

        let mut registry = self.inner.registry.lock();
        let Some(session) = registry.get_session(&session_id) else {
            debug!(thread_key = %message.thread_key, "Thread points at a removed session");
            return Ok(state.reserve(&message.thread_key));
        };
        let kind = session.backend;
        let resume_token = session.resume_token().map(str::to_string);
        let workspace = session.workspace.clone();
        let repository_id = session.repository_id.clone();

        if self.inner.pending.is_pending(&session_id)
            && self.inner.pending.resolve(&session_id, message.text.clone())
        {
            record(
                &mut registry,
                &session_id,
                AgentSessionEntry::user(&message.text).with_metadata("elicitationAnswer", true),
            );
            info!(session_id = %session_id, "Message answered pending question");
            return Ok(Action::Answered { session_id });
        }

        enum Liveness {
            Queue,
            Inject(Arc<dyn AgentBackend>),
            Busy,
            Dead,
        }
        let liveness = state.live.get_mut(&session_id).map(|live| {
            let streams = live.backend.capabilities().supports_streaming_input;
            match &mut live.phase {
                LivePhase::Starting { queued } if streams => {
                    queued.push(message.text.clone());
                    Liveness::Queue
                }
                LivePhase::Starting { .. } => Liveness::Busy,
                LivePhase::Ready if live.backend.is_running() => {
                    if streams && live.backend.is_streaming() {
                        Liveness::Inject(live.backend.clone())
                    } else {
                        Liveness::Busy
                    }
                }
                LivePhase::Ready => Liveness::Dead,
            }
        });

        match liveness {
            Some(Liveness::Queue) => {
                record(&mut registry, &session_id, AgentSessionEntry::user(&message.text));
                return Ok(Action::Queued { session_id });
            }
            Some(Liveness::Inject(backend)) => {
                record(&mut registry, &session_id, AgentSessionEntry::user(&message.text));
                return Ok(Action::Inject {
                    session_id,
                    backend,
                });
            }
            Some(Liveness::Busy) => return Ok(Action::Busy { session_id }),
            Some(Liveness::Dead) => {
                debug!(session_id = %session_id, "Backend no longer running, dropping handle");
                state.live.remove(&session_id);
            }
            None => {}
        }

        let Some(resume_token) = resume_token else {
            info!(
                session_id = %session_id,
                thread_key = %message.thread_key,
                "Session has no live backend and no resume token, creating a new one"
            );
            return Ok(state.reserve(&message.thread_key));
        };

        let repository = match &repository_id {
            Some(id) => Some(
                state
                    .repositories
                    .get(id)
                    .filter(|repo| repo.is_active)
                    .cloned()
                    .ok_or_else(|| Error::RepositoryNotFound(id.clone()))?,
            ),
            None => None,
        };
        let (events_tx, events) = mpsc::unbounded_channel();
        let backend = self.inner.backends.create(
            kind,
            BackendLaunch {
                session_id: session_id.clone(),
                workspace,
                resume_token: Some(resume_token),
                repository,
                events: events_tx,
            },
        )?;

        let generation = self.next_generation();
        state
            .live
            .insert(session_id.clone(), LiveBackend::starting(backend.clone(), generation));
        record(&mut registry, &session_id, AgentSessionEntry::user(&message.text));
        let patch = SessionPatch::status(SessionStatus::Running)
            .with_metadata(PLATFORM_KEY, message.platform.clone());
        if let Err(e) = registry.update_session(&session_id, patch) {
            warn!(session_id = %session_id, "Failed to mark session running: {}", e);
        }

        Ok(Action::Resume {
            session_id,
            kind,
            backend,
            generation,
            events,
        })
    }

    async fn create(&self, session_id: &str, message: &InboundMessage) -> Result<()> {
        let repository = self.repository_for(message)?;
        let kind = match message.backend {
            Some(kind) => kind,
            None => repository
                .as_ref()
                .map(RepositoryConfig::backend_kind)
                .transpose()?
                .flatten()
                .unwrap_or(self.inner.default_backend),
        };

        let workspace = self
            .inner
            .workspaces
            .allocate(WorkspaceRequest {
                session_id,
                thread_key: &message.thread_key,
                session_type: message.session_type,
                repository: repository.as_ref(),
                issue_context: message.issue_context.as_ref(),
            })
            .await?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let backend = self.inner.backends.create(
            kind,
            BackendLaunch {
                session_id: session_id.to_string(),
                workspace: workspace.clone(),
                resume_token: None,
                repository: repository.clone(),
                events: events_tx,
            },
        )?;
        let generation = self.next_generation();

        {
            let mut state = self.inner.state.lock();
            let mut registry = self.inner.registry.lock();

            let mut session = AgentSession::new(session_id, message.session_type, workspace)
                .with_thread_key(&message.thread_key)
                .with_backend(kind);
            session
                .metadata
                .insert(PLATFORM_KEY.to_string(), Value::from(message.platform.clone()));
            if let Some(issue_context) = &message.issue_context {
                session = session.with_issue_context(issue_context.clone());
            }
            if let Some(repository) = &repository {
                session = session.with_repository(&repository.id);
            }
            if let Some(external_id) = &message.external_session_id {
                session = session.with_external_session_id(external_id);
            }

            registry.create_session(session)?;
            record(&mut registry, session_id, AgentSessionEntry::user(&message.text));
            if let Some(parent_id) = &message.parent_session_id
                && let Err(e) = registry.set_parent_session(session_id, parent_id)
            {
                warn!(session_id = %session_id, parent = %parent_id, "Failed to link parent session: {}", e);
            }

            state.threads.insert(
                message.thread_key.clone(),
                ThreadSlot::Bound(session_id.to_string()),
            );
            state
                .live
                .insert(session_id.to_string(), LiveBackend::starting(backend.clone(), generation));
        }

        info!(
            session_id = %session_id,
            thread_key = %message.thread_key,
            backend = %kind,
            "Created session"
        );
        self.spawn_event_pump(session_id.to_string(), generation, events);
        self.persist().await;
        self.start_backend(session_id, kind, backend, generation, &message.text)
            .await
    }

    fn repository_for(&self, message: &InboundMessage) -> Result<Option<RepositoryConfig>> {
        let Some(id) = &message.repository_id else {
            return Ok(None);
        };
        self.inner
            .state
            .lock()
            .repositories
            .get(id)
            .filter(|repo| repo.is_active)
            .cloned()
            .map(Some)
            .ok_or_else(|| Error::RepositoryNotFound(id.clone()))
    }

    /// Start (or resume) a backend, then flush any input queued meanwhile
    async fn start_backend(
        &self,
        session_id: &str,
        kind: BackendKind,
        backend: Arc<dyn AgentBackend>,
        generation: u64,
        prompt: &str,
    ) -> Result<()> {
        let streams = backend.capabilities().supports_streaming_input;
        let started = if streams {
            backend.start_streaming(prompt).await
        } else {
            backend.start(prompt).await
        };

        let info = match started {
            Ok(info) => info,
            Err(e) => {
                self.fail_session(session_id, generation, &e).await;
                return Err(e.into());
            }
        };

        let queued = {
            let mut state = self.inner.state.lock();
            let mut registry = self.inner.registry.lock();

            let mut patch = SessionPatch::default();
            if let Some(token) = &info.resume_token {
                patch = patch.with_resume_token(kind, token.clone());
            }
            let queued = match state.live.get_mut(session_id) {
                Some(live) if live.generation == generation => {
                    patch = patch.with_status(SessionStatus::Running);
                    match std::mem::replace(&mut live.phase, LivePhase::Ready) {
                        LivePhase::Starting { queued } => queued,
                        LivePhase::Ready => Vec::new(),
                    }
                }
                // Finished before start returned
                _ => Vec::new(),
            };
            if let Err(e) = registry.update_session(session_id, patch) {
                warn!(session_id = %session_id, "Failed to record backend start: {}", e);
            }
            queued
        };

        for text in &queued {
            if let Err(e) = backend.add_stream_message(text).await {
                warn!(session_id = %session_id, "Failed to deliver queued message: {}", e);
            }
        }
        debug!(
            session_id = %session_id,
            backend = %kind,
            flushed = queued.len(),
            "Backend started"
        );
        self.persist().await;
        Ok(())
    }

    /// Ask the session's user a question and wait for the answer
    ///
    /// Unlike other activity, a failure to post the question is returned,
    /// since the posted activity is what the answer correlates to.
    pub async fn request_elicitation(
        &self,
        session_id: &str,
        question: &str,
        cancel: CancellationToken,
    ) -> Result<CorrelationOutcome> {
        let platform = {
            let registry = self.inner.registry.lock();
            let session = registry
                .get_session(session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            platform_of(session)
        };
        if cancel.is_cancelled() {
            debug!(session_id = %session_id, "Question cancelled before it was asked");
            return Ok(CorrelationOutcome::Cancelled);
        }
        let sink = platform
            .as_deref()
            .and_then(|platform| self.inner.sinks.get(platform))
            .ok_or_else(|| {
                Error::Activity(format!("No activity sink for session {}", session_id))
            })?;

        // Open first so an answer racing the post is not lost
        let answer = self.inner.pending.open(session_id, question, &cancel);
        if cancel.is_cancelled() {
            return Ok(answer.await);
        }
        let activity_id = match sink
            .post_activity(
                session_id,
                ActivityContent::elicitation(question),
                Some(ActivitySignal::AwaitingInput),
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.inner.pending.cancel(session_id);
                return Err(e);
            }
        };

        {
            let mut registry = self.inner.registry.lock();
            record(
                &mut registry,
                session_id,
                AgentSessionEntry::new(EntryType::Elicitation, question)
                    .with_metadata("activityId", activity_id),
            );
        }
        self.persist().await;

        let outcome = answer.await;
        debug!(session_id = %session_id, outcome = ?outcome, "Question closed");
        Ok(outcome)
    }

    /// Answer a session's open question directly
    pub async fn answer_elicitation(&self, session_id: &str, answer: &str) -> bool {
        if !self.inner.pending.resolve(session_id, answer) {
            return false;
        }
        {
            let mut registry = self.inner.registry.lock();
            record(
                &mut registry,
                session_id,
                AgentSessionEntry::user(answer).with_metadata("elicitationAnswer", true),
            );
        }
        self.persist().await;
        true
    }

    /// Stop a session's backend and mark it as errored; history is kept
    pub async fn abort_session(&self, session_id: &str) -> Result<()> {
        let removed = {
            let mut state = self.inner.state.lock();
            if !self.inner.registry.lock().contains(session_id) {
                return Err(Error::SessionNotFound(session_id.to_string()));
            }
            state.live.remove(session_id)
        };

        if let Some(live) = removed {
            stop_backend(session_id, live.backend.as_ref()).await;
        }
        self.inner.pending.cancel(session_id);

        {
            let mut registry = self.inner.registry.lock();
            record(&mut registry, session_id, AgentSessionEntry::error(STOPPED_NOTICE));
            let patch = SessionPatch::status(SessionStatus::Error)
                .with_metadata(STOP_REASON_KEY, "cancelled");
            registry.update_session(session_id, patch)?;
        }
        info!(session_id = %session_id, "Session aborted");

        self.post(
            session_id,
            ActivityContent::response(STOPPED_NOTICE),
            Some(ActivitySignal::Stop),
        )
        .await;
        self.persist().await;
        Ok(())
    }

    /// Install a new repository list
    ///
    /// Live sessions of removed repositories are aborted; every other session
    /// is left alone. An invalid list is rejected and nothing changes.
    pub async fn apply_repositories(
        &self,
        repositories: Vec<RepositoryConfig>,
    ) -> Result<RepositoryDiff> {
        config_diff::validate_repositories(&repositories)?;

        let (diff, doomed) = {
            let mut state = self.inner.state.lock();
            let current: Vec<RepositoryConfig> = state.repositories.values().cloned().collect();
            let diff = config_diff::diff_repositories(&current, &repositories);
            state.repositories = repositories
                .into_iter()
                .map(|repo| (repo.id.clone(), repo))
                .collect();

            let removed = diff.removed_ids();
            let registry = self.inner.registry.lock();
            let mut doomed: Vec<SessionId> = state
                .live
                .keys()
                .filter(|id| {
                    registry
                        .get_session(id)
                        .and_then(|session| session.repository_id.as_deref())
                        .is_some_and(|repo| removed.contains(repo))
                })
                .cloned()
                .collect();
            doomed.sort();
            (diff, doomed)
        };

        for session_id in &doomed {
            if let Err(e) = self.abort_session(session_id).await {
                warn!(session_id = %session_id, "Failed to abort session of removed repository: {}", e);
            }
        }
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            aborted = doomed.len(),
            "Applied repository configuration"
        );
        Ok(diff)
    }

    /// Load persisted sessions and rebuild the thread index
    ///
    /// Returns the number of restored sessions; no snapshot means a cold start.
    pub async fn restore(&self) -> usize {
        let Some(snapshot) = self.inner.store.load().await else {
            info!("No persisted sessions, starting cold");
            return 0;
        };

        let mut state = self.inner.state.lock();
        let mut registry = self.inner.registry.lock();
        registry.restore_state(snapshot);

        state.threads.clear();
        // Oldest first, so the newest session wins a shared thread key
        for session in registry.get_all_sessions() {
            if let Some(thread_key) = &session.thread_key {
                state
                    .threads
                    .insert(thread_key.clone(), ThreadSlot::Bound(session.id.clone()));
            }
        }
        registry.len()
    }

    /// Remove sessions idle for longer than `max_age`
    pub async fn sweep(&self, max_age: Duration) -> Vec<SessionId> {
        let (removed, stale): (Vec<SessionId>, Vec<(SessionId, LiveBackend)>) = {
            let mut state = self.inner.state.lock();
            let removed = self.inner.registry.lock().cleanup(max_age);
            state
                .threads
                .retain(|_, slot| !matches!(slot, ThreadSlot::Bound(id) if removed.contains(id)));
            let stale = removed
                .iter()
                .filter_map(|id| state.live.remove_entry(id))
                .collect();
            (removed, stale)
        };

        for (session_id, live) in stale {
            stop_backend(&session_id, live.backend.as_ref()).await;
        }
        for session_id in &removed {
            self.inner.pending.cancel(session_id);
        }
        if !removed.is_empty() {
            self.persist().await;
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the handle is aborted
    pub fn spawn_cleanup_sweep(&self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = engine.sweep(max_age).await;
                debug!(removed = removed.len(), "Cleanup sweep finished");
            }
        })
    }

    /// Stop every live backend, cancel open questions and save a final snapshot
    pub async fn shutdown(&self) -> Result<()> {
        let live: Vec<(SessionId, LiveBackend)> =
            self.inner.state.lock().live.drain().collect();

        let stops = live
            .iter()
            .map(|(session_id, live)| stop_backend(session_id, live.backend.as_ref()));
        join_all(stops).await;
        let cancelled = self.inner.pending.cancel_all();

        let _guard = self.inner.save_lock.lock().await;
        let state = self.inner.registry.lock().serialize_state();
        self.inner.store.save(&state).await?;
        info!(stopped = live.len(), cancelled, "Engine shut down");
        Ok(())
    }

    /// Save the registry; failures are logged and never fail the caller
    async fn persist(&self) {
        let _guard = self.inner.save_lock.lock().await;
        let state = self.inner.registry.lock().serialize_state();
        if let Err(e) = self.inner.store.save(&state).await {
            error!("Failed to save sessions: {}", e);
        }
    }

    async fn post(
        &self,
        session_id: &str,
        content: ActivityContent,
        signal: Option<ActivitySignal>,
    ) {
        let platform = self
            .inner
            .registry
            .lock()
            .get_session(session_id)
            .and_then(platform_of);
        self.post_to(platform.as_deref(), session_id, content, signal)
            .await;
    }

    /// Publish activity; failures are logged and never block the session
    async fn post_to(
        &self,
        platform: Option<&str>,
        session_id: &str,
        content: ActivityContent,
        signal: Option<ActivitySignal>,
    ) {
        let Some(sink) = platform.and_then(|platform| self.inner.sinks.get(platform)) else {
            debug!(session_id = %session_id, "No activity sink for session, not posting");
            return;
        };
        if let Err(e) = sink.post_activity(session_id, content, signal).await {
            warn!(
                session_id = %session_id,
                platform = sink.platform(),
                "Failed to post activity: {}", e
            );
        }
    }

    fn next_generation(&self) -> u64 {
        self.inner.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Mark a session errored after its backend failed
    async fn fail_session(&self, session_id: &str, generation: u64, error: &BackendError) {
        let Some(live) = self.inner.state.lock().take_live(session_id, generation) else {
            debug!(session_id = %session_id, "Ignoring error from a replaced backend");
            return;
        };
        warn!(session_id = %session_id, "Backend failed: {}", error);

        {
            let mut registry = self.inner.registry.lock();
            record(&mut registry, session_id, AgentSessionEntry::error(error.to_string()));
            let patch = SessionPatch::status(SessionStatus::Error)
                .with_metadata(LAST_ERROR_KEY, error.to_string());
            if let Err(e) = registry.update_session(session_id, patch) {
                warn!(session_id = %session_id, "Failed to mark session errored: {}", e);
            }
        }
        self.inner.pending.cancel(session_id);

        if live.backend.is_running() {
            stop_backend(session_id, live.backend.as_ref()).await;
        }
        self.post(
            session_id,
            ActivityContent::error(format!("The agent stopped with an error: {}", error)),
            None,
        )
        .await;
        self.report_undelivered(session_id, live).await;
        self.persist().await;
    }

    /// Tell the sender about queued input a backend ended without receiving
    async fn report_undelivered(&self, session_id: &str, live: LiveBackend) {
        let LivePhase::Starting { queued } = live.phase else {
            return;
        };
        if queued.is_empty() {
            return;
        }
        warn!(
            session_id = %session_id,
            undelivered = queued.len(),
            "Backend ended before queued input was delivered"
        );
        self.post(
            session_id,
            ActivityContent::thought(format!(
                "The agent finished before it read {} queued message(s). Send them again to continue.",
                queued.len()
            )),
            None,
        )
        .await;
    }
}

/// Close a streaming backend's input, then stop it; failures are logged
async fn stop_backend(session_id: &str, backend: &dyn AgentBackend) {
    if backend.is_streaming()
        && let Err(e) = backend.complete_stream().await
    {
        warn!(session_id = %session_id, "Failed to close backend input stream: {}", e);
    }
    if let Err(e) = backend.stop().await {
        warn!(session_id = %session_id, "Failed to stop backend: {}", e);
    }
}

fn platform_of(session: &AgentSession) -> Option<String> {
    session
        .metadata
        .get(PLATFORM_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Append an entry; the session is known to exist
fn record(registry: &mut SessionRegistry, session_id: &str, entry: AgentSessionEntry) {
    if let Err(e) = registry.add_entry(session_id, entry) {
        warn!(session_id = %session_id, "Failed to record entry: {}", e);
    }
}
