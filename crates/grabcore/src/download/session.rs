//! Session/request tracker.
//!
//! Binds a chat session and a request to their single non-terminal job.
//! `bind` is atomic per key, so two concurrent selections from the same
//! session can't both get through.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::download::error::SubmitError;
use crate::download::model::{JobId, RequestId, SessionId};

#[derive(Debug, Default)]
pub struct SessionTracker {
    by_session: DashMap<SessionId, JobId>,
    by_request: DashMap<RequestId, JobId>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims both bindings for `job`, or neither.
    pub fn bind(&self, session: SessionId, request: RequestId, job: JobId) -> Result<(), SubmitError> {
        match self.by_session.entry(session) {
            Entry::Occupied(existing) => return Err(SubmitError::SessionBusy(existing.get().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(job);
            }
        }
        match self.by_request.entry(request) {
            Entry::Occupied(existing) => {
                let active = existing.get().to_string();
                drop(existing);
                self.by_session.remove_if(&session, |_, j| *j == job);
                Err(SubmitError::RequestActive(active))
            }
            Entry::Vacant(slot) => {
                slot.insert(job);
                Ok(())
            }
        }
    }

    /// Releases the bindings of `job`. Bindings owned by other jobs are kept.
    pub fn release(&self, session: SessionId, request: RequestId, job: JobId) {
        self.by_session.remove_if(&session, |_, j| *j == job);
        self.by_request.remove_if(&request, |_, j| *j == job);
    }

    pub fn active_job(&self, session: SessionId) -> Option<JobId> {
        self.by_session.get(&session).map(|j| *j)
    }

    pub fn job_for_request(&self, request: RequestId) -> Option<JobId> {
        self.by_request.get(&request).map(|j| *j)
    }

    pub fn len(&self) -> usize {
        self.by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }
}
