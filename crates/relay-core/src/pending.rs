//! Pending correlation table for out-of-band questions
//!
//! While a session waits for a user's answer, its question is held here
//! until the answer arrives, the caller's cancellation token fires, or a newer
//! question for the same session replaces it. Each entry ends in exactly one
//! of those outcomes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::SessionId;

/// Terminal outcome of a pending question
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationOutcome {
    Answered(String),
    Cancelled,
    /// A newer question for the same session took its place
    Replaced,
}

impl CorrelationOutcome {
    pub fn answer(&self) -> Option<&str> {
        match self {
            CorrelationOutcome::Answered(answer) => Some(answer),
            _ => None,
        }
    }
}

/// Snapshot of an open question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuestion {
    pub session_id: SessionId,
    pub question: String,
    pub opened_at: DateTime<Utc>,
}

struct PendingEntry {
    ticket: u64,
    question: String,
    opened_at: DateTime<Utc>,
    responder: oneshot::Sender<CorrelationOutcome>,
    cancel_listener: Option<JoinHandle<()>>,
}

impl PendingEntry {
    fn finish(self, outcome: CorrelationOutcome) {
        if let Some(listener) = self.cancel_listener {
            listener.abort();
        }
        // The waiter may have gone away
        let _ = self.responder.send(outcome);
    }
}

type EntryMap = parking_lot::Mutex<HashMap<SessionId, PendingEntry>>;

/// Future resolving to the outcome of one question
///
/// Dropping it does not close the question; it stays answerable until
/// resolved, cancelled or replaced.
pub struct PendingAnswer {
    session_id: SessionId,
    rx: oneshot::Receiver<CorrelationOutcome>,
}

impl PendingAnswer {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Future for PendingAnswer {
    type Output = CorrelationOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(CorrelationOutcome::Cancelled))
    }
}

/// At most one open question per session
pub struct PendingCorrelationTable {
    entries: Arc<EntryMap>,
    next_ticket: AtomicU64,
}

impl Default for PendingCorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCorrelationTable {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Open a question for `session_id`
    ///
    /// Must be called within a Tokio runtime. An already cancelled token
    /// yields `Cancelled` immediately and registers nothing. A question
    /// already open for the session is resolved as `Replaced` first.
    pub fn open(
        &self,
        session_id: impl Into<SessionId>,
        question: impl Into<String>,
        cancel: &CancellationToken,
    ) -> PendingAnswer {
        let session_id = session_id.into();
        let (responder, rx) = oneshot::channel();

        if cancel.is_cancelled() {
            debug!(session_id = %session_id, "Cancellation already requested, not opening question");
            let _ = responder.send(CorrelationOutcome::Cancelled);
            return PendingAnswer { session_id, rx };
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let entry = PendingEntry {
            ticket,
            question: question.into(),
            opened_at: Utc::now(),
            responder,
            cancel_listener: None,
        };
        let replaced = self.entries.lock().insert(session_id.clone(), entry);
        if let Some(previous) = replaced {
            debug!(session_id = %session_id, "Replacing pending question");
            previous.finish(CorrelationOutcome::Replaced);
        }

        // Registered after insertion so a cancellation can never miss the entry
        let listener = tokio::spawn(cancel_on_signal(
            Arc::downgrade(&self.entries),
            session_id.clone(),
            ticket,
            cancel.clone(),
        ));
        let mut entries = self.entries.lock();
        match entries.get_mut(&session_id) {
            Some(entry) if entry.ticket == ticket => entry.cancel_listener = Some(listener),
            _ => listener.abort(),
        }

        PendingAnswer { session_id, rx }
    }

    /// Answer the open question for a session
    ///
    /// Returns whether a question was open. A miss is expected for stale or
    /// duplicate deliveries and is only logged.
    pub fn resolve(&self, session_id: &str, answer: impl Into<String>) -> bool {
        let entry = self.entries.lock().remove(session_id);
        match entry {
            Some(entry) => {
                debug!(session_id = %session_id, "Resolving pending question");
                entry.finish(CorrelationOutcome::Answered(answer.into()));
                true
            }
            None => {
                warn!(session_id = %session_id, "No pending question for answer, dropping it");
                false
            }
        }
    }

    /// Cancel the open question for a session, if any
    pub fn cancel(&self, session_id: &str) -> bool {
        let entry = self.entries.lock().remove(session_id);
        entry
            .map(|entry| entry.finish(CorrelationOutcome::Cancelled))
            .is_some()
    }

    /// Cancel every open question, returning how many there were
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            entry.finish(CorrelationOutcome::Cancelled);
        }
        count
    }

    pub fn is_pending(&self, session_id: &str) -> bool {
        self.entries.lock().contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<PendingQuestion> {
        self.entries.lock().get(session_id).map(|entry| PendingQuestion {
            session_id: session_id.to_string(),
            question: entry.question.clone(),
            opened_at: entry.opened_at,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Drop for PendingCorrelationTable {
    fn drop(&mut self) {
        for (_, entry) in self.entries.lock().drain() {
            entry.finish(CorrelationOutcome::Cancelled);
        }
    }
}

async fn cancel_on_signal(
    entries: Weak<EntryMap>,
    session_id: SessionId,
    ticket: u64,
    cancel: CancellationToken,
) {
    cancel.cancelled().await;
    let Some(entries) = entries.upgrade() else {
        return;
    };

    let entry = {
        let mut entries = entries.lock();
        match entries.get(&session_id) {
            Some(entry) if entry.ticket == ticket => entries.remove(&session_id),
            _ => None,
        }
    };
    if let Some(mut entry) = entry {
        debug!(session_id = %session_id, "Pending question cancelled");
        // This task is the listener; nothing to abort
        entry.cancel_listener = None;
        let _ = entry.responder.send(CorrelationOutcome::Cancelled);
    }
}
