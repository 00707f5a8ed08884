//! Job state machine and the handle callers observe a job through.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::download::error::JobFailure;
use crate::download::model::{JobId, RequestId, SessionId};

/// Lifecycle of a job.
///
/// `Queued -> Fetching -> (Muxing) -> Delivering -> Completed`; `Failed`
/// and `Cancelled` are reachable from every non-terminal state. The only
/// backward edge is `Fetching -> Queued` after a rate limit.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Queued,
    Fetching,
    Muxing,
    Delivering,
    Completed,
    Failed(JobFailure),
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed(_) | JobState::Cancelled)
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Fetching => "fetching",
            JobState::Muxing => "muxing",
            JobState::Delivering => "delivering",
            JobState::Completed => "completed",
            JobState::Failed(_) => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, next: &JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, JobState::Failed(_) | JobState::Cancelled) => true,
            (JobState::Queued, JobState::Fetching) => true,
            // Rate-limit requeue
            (JobState::Fetching, JobState::Queued) => true,
            (JobState::Fetching, JobState::Muxing | JobState::Delivering) => true,
            (JobState::Muxing, JobState::Delivering) => true,
            (JobState::Delivering, JobState::Completed) => true,
            _ => false,
        }
    }
}

/// Final outcome message sent to the chat, once per job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub job: JobId,
    pub state: JobState,
    pub message: String,
}

impl JobReport {
    pub fn for_state(job: JobId, state: JobState) -> Self {
        let message = match &state {
            JobState::Completed => "✅ Done!".to_string(),
            JobState::Failed(failure) => failure.user_message(),
            JobState::Cancelled => "🚫 Download cancelled.".to_string(),
            other => format!("Job is {}", other.name()),
        };
        Self { job, state, message }
    }
}

/// Owner side of a job's state: validates transitions and records history.
pub(crate) struct JobCell {
    id: JobId,
    state_tx: watch::Sender<JobState>,
    history: Arc<Mutex<Vec<JobState>>>,
}

impl JobCell {
    pub(crate) fn new(id: JobId) -> Self {
        let (state_tx, _) = watch::channel(JobState::Queued);
        Self {
            id,
            state_tx,
            history: Arc::new(Mutex::new(vec![JobState::Queued])),
        }
    }

    pub(crate) fn state(&self) -> JobState {
        self.state_tx.borrow().clone()
    }

    /// Moves to `next` if the state machine allows it.
    pub(crate) fn transition(&self, next: JobState) -> bool {
        let mut from = None;
        self.state_tx.send_if_modified(|current| {
            if !current.can_transition_to(&next) {
                return false;
            }
            from = Some(current.name());
            *current = next.clone();
            self.history
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(next.clone());
            true
        });

        match from {
            Some(from) => {
                match &next {
                    JobState::Failed(failure) => {
                        log::warn!("Job {}: {} -> failed ({})", self.id, from, failure)
                    }
                    _ => log::info!("Job {}: {} -> {}", self.id, from, next.name()),
                }
                true
            }
            None => {
                log::warn!("Job {}: rejected transition {} -> {}", self.id, self.state().name(), next.name());
                false
            }
        }
    }

    pub(crate) fn handle(&self, request: RequestId, session: SessionId, cancel: CancellationToken) -> JobHandle {
        JobHandle {
            id: self.id,
            request,
            session,
            state_rx: self.state_tx.subscribe(),
            history: Arc::clone(&self.history),
            cancel,
        }
    }
}

/// Caller-side view of a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    request: RequestId,
    session: SessionId,
    state_rx: watch::Receiver<JobState>,
    history: Arc<Mutex<Vec<JobState>>>,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn state(&self) -> JobState {
        self.state_rx.borrow().clone()
    }

    /// Every state the job has been in, in order.
    pub fn history(&self) -> Vec<JobState> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the terminal state.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state_rx.clone();
        if let Ok(state) = rx.wait_for(JobState::is_terminal).await {
            return state.clone();
        }
        // Sender gone: the queue was dropped mid-job
        let last = rx.borrow().clone();
        last
    }
}
