//! Shared fixtures for engine integration tests
//!
//! - `ScriptedBackend` / `ScriptedFactory`: in-memory backends that replay a
//!   fixed list of events when started, optionally held at start until opened
//! - `RecordingSink`: activity sink that remembers every post
//! - `GatedWorkspaces`: workspace provider that blocks until opened

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::activity::{ActivityContent, ActivityId, ActivitySignal, ActivitySink};
use relay_core::backend::{
    AgentBackend, BackendCapabilities, BackendCompletion, BackendEvent, BackendEventSender,
    BackendFactory, BackendKind, BackendLaunch, BackendMessage, BackendSessionInfo,
};
use relay_core::config::RepositoryConfig;
use relay_core::engine::SessionLifecycleEngine;
use relay_core::error::{BackendError, Error, Result};
use relay_core::persistence::PersistenceStore;
use relay_core::session::{SessionStatus, Workspace};
use relay_core::workspace::{DirectWorkspaceProvider, WorkspaceProvider, WorkspaceRequest};
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub const PLATFORM: &str = "linear";

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Start(String),
    StartStreaming(String),
    AddStreamMessage(String),
    CompleteStream,
    Stop,
}

pub struct ScriptedBackend {
    kind: BackendKind,
    streams: bool,
    events: BackendEventSender,
    script: Vec<BackendEvent>,
    start_result: std::result::Result<BackendSessionInfo, BackendError>,
    running: AtomicBool,
    streaming: AtomicBool,
    calls: Mutex<Vec<BackendCall>>,
    start_gate: Option<Arc<Semaphore>>,
}

impl ScriptedBackend {
    /// Send an event as if the backend produced it
    pub fn emit(&self, event: BackendEvent) {
        if matches!(event, BackendEvent::Complete(_) | BackendEvent::Error(_)) {
            self.running.store(false, Ordering::SeqCst);
            self.streaming.store(false, Ordering::SeqCst);
        }
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    async fn begin(
        &self,
        call: BackendCall,
        streaming: bool,
    ) -> std::result::Result<BackendSessionInfo, BackendError> {
        self.calls.lock().push(call);
        if let Some(gate) = &self.start_gate {
            let _permit = gate.acquire().await;
        }
        let info = self.start_result.clone()?;
        self.running.store(true, Ordering::SeqCst);
        self.streaming.store(streaming, Ordering::SeqCst);
        for event in &self.script {
            self.emit(event.clone());
        }
        Ok(info)
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_streaming_input: self.streams,
        }
    }

    async fn start(&self, prompt: &str) -> std::result::Result<BackendSessionInfo, BackendError> {
        self.begin(BackendCall::Start(prompt.to_string()), false)
            .await
    }

    async fn start_streaming(
        &self,
        prompt: &str,
    ) -> std::result::Result<BackendSessionInfo, BackendError> {
        if !self.streams {
            return Err(BackendError::NotStreaming);
        }
        self.begin(BackendCall::StartStreaming(prompt.to_string()), true)
            .await
    }

    async fn add_stream_message(&self, text: &str) -> std::result::Result<(), BackendError> {
        self.calls.lock().push(BackendCall::AddStreamMessage(text.to_string()));
        if self.streaming.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::NotStreaming)
        }
    }

    async fn complete_stream(&self) -> std::result::Result<(), BackendError> {
        self.calls.lock().push(BackendCall::CompleteStream);
        self.streaming.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> std::result::Result<(), BackendError> {
        self.calls.lock().push(BackendCall::Stop);
        self.running.store(false, Ordering::SeqCst);
        self.streaming.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub kind: BackendKind,
    pub session_id: String,
    pub workspace: Workspace,
    pub resume_token: Option<String>,
    pub repository_id: Option<String>,
}

/// Builds scripted backends; each launch takes the next queued script
#[derive(Default)]
pub struct ScriptedFactory {
    streams: bool,
    unavailable: Vec<BackendKind>,
    scripts: Mutex<VecDeque<Vec<BackendEvent>>>,
    start_infos: Mutex<VecDeque<BackendSessionInfo>>,
    start_failures: Mutex<VecDeque<BackendError>>,
    launches: Mutex<Vec<LaunchRecord>>,
    backends: Mutex<Vec<Arc<ScriptedBackend>>>,
    start_gate: Option<Arc<Semaphore>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backends accept streamed input
    pub fn streaming(mut self) -> Self {
        self.streams = true;
        self
    }

    /// Backends block inside start until `open_start` is called
    pub fn gated_start(mut self) -> Self {
        self.start_gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn open_start(&self) {
        if let Some(gate) = &self.start_gate {
            gate.add_permits(1024);
        }
    }

    pub fn unavailable(mut self, kind: BackendKind) -> Self {
        self.unavailable.push(kind);
        self
    }

    /// Events the next launched backend emits on start
    pub fn script(mut self, events: Vec<BackendEvent>) -> Self {
        self.scripts.get_mut().push_back(events);
        self
    }

    /// Session info the next launched backend returns from start
    pub fn start_info(mut self, info: BackendSessionInfo) -> Self {
        self.start_infos.get_mut().push_back(info);
        self
    }

    pub fn fail_start(mut self, error: BackendError) -> Self {
        self.start_failures.get_mut().push_back(error);
        self
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    pub fn backend(&self, index: usize) -> Arc<ScriptedBackend> {
        self.backends.lock()[index].clone()
    }

    pub fn last_backend(&self) -> Arc<ScriptedBackend> {
        let backends = self.backends.lock();
        backends[backends.len() - 1].clone()
    }
}

impl BackendFactory for ScriptedFactory {
    fn create(&self, kind: BackendKind, launch: BackendLaunch) -> Result<Arc<dyn AgentBackend>> {
        if self.unavailable.contains(&kind) {
            return Err(Error::BackendNotAvailable {
                backend: kind.to_string(),
            });
        }

        self.launches.lock().push(LaunchRecord {
            kind,
            session_id: launch.session_id.clone(),
            workspace: launch.workspace.clone(),
            resume_token: launch.resume_token.clone(),
            repository_id: launch.repository.as_ref().map(|repo| repo.id.clone()),
        });

        let start_result = match self.start_failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(self.start_infos.lock().pop_front().unwrap_or_default()),
        };
        let backend = Arc::new(ScriptedBackend {
            kind,
            streams: self.streams,
            events: launch.events,
            script: self.scripts.lock().pop_front().unwrap_or_default(),
            start_result,
            running: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            start_gate: self.start_gate.clone(),
        });
        self.backends.lock().push(backend.clone());
        Ok(backend)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub session_id: String,
    pub content: ActivityContent,
    pub signal: Option<ActivitySignal>,
}

pub struct RecordingSink {
    platform: String,
    fail: AtomicBool,
    posts: Mutex<Vec<Post>>,
}

impl RecordingSink {
    pub fn new(platform: &str) -> Self {
        Self {
            platform: platform.to_string(),
            fail: AtomicBool::new(false),
            posts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn posts(&self) -> Vec<Post> {
        self.posts.lock().clone()
    }

    pub fn posts_for(&self, session_id: &str) -> Vec<Post> {
        self.posts()
            .into_iter()
            .filter(|post| post.session_id == session_id)
            .collect()
    }
}

#[async_trait]
impl ActivitySink for RecordingSink {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn post_activity(
        &self,
        session_id: &str,
        content: ActivityContent,
        signal: Option<ActivitySignal>,
    ) -> Result<ActivityId> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Activity("platform unreachable".to_string()));
        }
        let mut posts = self.posts.lock();
        posts.push(Post {
            session_id: session_id.to_string(),
            content,
            signal,
        });
        Ok(format!("activity-{}", posts.len()))
    }
}

/// Holds every allocation until `open` is called
pub struct GatedWorkspaces {
    inner: DirectWorkspaceProvider,
    gate: Semaphore,
    waiting: AtomicUsize,
}

impl GatedWorkspaces {
    pub fn new(scratch_root: &std::path::Path) -> Self {
        Self {
            inner: DirectWorkspaceProvider::new(scratch_root),
            gate: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        self.gate.add_permits(1024);
    }
}

#[async_trait]
impl WorkspaceProvider for GatedWorkspaces {
    async fn allocate(&self, request: WorkspaceRequest<'_>) -> Result<Workspace> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| Error::Workspace(e.to_string()))?;
        self.inner.allocate(request).await
    }
}

pub fn repository(id: &str) -> RepositoryConfig {
    RepositoryConfig::new(id, id.to_uppercase(), format!("/srv/repos/{id}"), "main")
}

pub struct Harness {
    pub engine: SessionLifecycleEngine,
    pub factory: Arc<ScriptedFactory>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<PersistenceStore>,
    pub state_dir: TempDir,
    pub scratch_dir: TempDir,
}

impl Harness {
    pub fn new(factory: ScriptedFactory) -> Self {
        let scratch_dir = TempDir::new().unwrap();
        let workspaces = Arc::new(DirectWorkspaceProvider::new(scratch_dir.path()));
        Self::build(factory, workspaces, scratch_dir)
    }

    pub fn with_workspaces(factory: ScriptedFactory, workspaces: Arc<dyn WorkspaceProvider>) -> Self {
        Self::build(factory, workspaces, TempDir::new().unwrap())
    }

    fn build(
        factory: ScriptedFactory,
        workspaces: Arc<dyn WorkspaceProvider>,
        scratch_dir: TempDir,
    ) -> Self {
        let state_dir = TempDir::new().unwrap();
        let store = Arc::new(PersistenceStore::new(state_dir.path()));
        let factory = Arc::new(factory);
        let sink = Arc::new(RecordingSink::new(PLATFORM));

        let engine = SessionLifecycleEngine::builder(store.clone(), factory.clone(), workspaces)
            .sink(sink.clone())
            .repositories(vec![repository("web"), repository("api")])
            .build()
            .unwrap();

        Self {
            engine,
            factory,
            sink,
            store,
            state_dir,
            scratch_dir,
        }
    }

    /// A fresh engine over the same state directory, as after a restart
    pub fn restart(&self, factory: ScriptedFactory) -> (SessionLifecycleEngine, Arc<ScriptedFactory>) {
        let factory = Arc::new(factory);
        let engine = SessionLifecycleEngine::builder(
            Arc::new(PersistenceStore::new(self.state_dir.path())),
            factory.clone(),
            Arc::new(DirectWorkspaceProvider::new(self.scratch_dir.path())),
        )
        .sink(self.sink.clone())
        .repositories(vec![repository("web"), repository("api")])
        .build()
        .unwrap();
        (engine, factory)
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.engine
            .registry()
            .lock()
            .get_session(session_id)
            .map(|session| session.status)
    }

    pub async fn wait_for_status(&self, session_id: &str, status: SessionStatus) {
        let engine = self.engine.clone();
        let session_id = session_id.to_string();
        wait_until(move || {
            engine
                .registry()
                .lock()
                .get_session(&session_id)
                .map(|session| session.status)
                == Some(status)
        })
        .await;
    }
}

/// Poll until `condition` holds, failing the test after a few seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached in time");
}

pub fn response(text: &str) -> BackendEvent {
    BackendEvent::Message(BackendMessage::response(text))
}

pub fn complete(result: Option<&str>, resume_token: Option<&str>) -> BackendEvent {
    BackendEvent::Complete(BackendCompletion {
        result: result.map(str::to_string),
        resume_token: resume_token.map(str::to_string),
    })
}
