//! Per-job progress forwarding.
//!
//! Stages report raw progress through a [`ProgressReporter`] (cheap and
//! synchronous, so it can be called from fetch and tool callbacks). The
//! reporter applies the throttle itself, so only updates that will be shown
//! enter the channel. A single forwarder task per job drains the channel and
//! sends the updates to the chat transport in order.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::download::delivery::ChatTransport;
use crate::download::model::{JobId, SessionId};

/// Share of the overall bar given to fetching when a mux step follows.
const FETCH_SHARE_WITH_PROCESSING: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum ProgressStage {
    Fetching,
    Muxing,
}

/// One progress notification for a chat session.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub job: JobId,
    pub stage: ProgressStage,
    /// Overall job progress in `[0, 1]`
    pub fraction: f64,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
}

impl ProgressUpdate {
    pub fn percent(&self) -> u8 {
        (self.fraction.clamp(0.0, 1.0) * 100.0).round() as u8
    }
}

/// Throttle policy: forward when progress moved by `min_step` or
/// `min_interval` elapsed since the last forwarded update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressThrottle {
    pub min_step: f64,
    pub min_interval: Duration,
}

impl ProgressThrottle {
    fn should_send(&self, last: Option<&(ProgressUpdate, Instant)>, next: &ProgressUpdate, now: Instant) -> bool {
        let Some((prev, sent_at)) = last else {
            return true;
        };
        if next.fraction < prev.fraction {
            return false;
        }
        if next.stage != prev.stage {
            return true;
        }
        if next.fraction <= prev.fraction && prev.fraction > 0.0 {
            return false;
        }
        next.fraction - prev.fraction >= self.min_step
            || now.duration_since(*sent_at) >= self.min_interval
            || (next.fraction >= 1.0 && prev.fraction < 1.0)
    }
}

/// Producer side handed to the pipeline stages.
#[derive(Clone)]
pub struct ProgressReporter {
    job: JobId,
    tx: mpsc::UnboundedSender<ProgressUpdate>,
    fetch_share: f64,
    throttle: ProgressThrottle,
    /// Last update let through, shared by all clones
    last: Arc<Mutex<Option<(ProgressUpdate, Instant)>>>,
}

impl ProgressReporter {
    /// Fetch progress; `fraction` covers the whole fetch (all streams).
    pub fn fetching(&self, fraction: f64, bytes_done: u64, bytes_total: Option<u64>) {
        self.send(ProgressUpdate {
            job: self.job,
            stage: ProgressStage::Fetching,
            fraction: fraction.clamp(0.0, 1.0) * self.fetch_share,
            bytes_done,
            bytes_total,
        });
    }

    /// Tool progress of the mux/transcode step.
    pub fn muxing(&self, fraction: f64) {
        self.send(ProgressUpdate {
            job: self.job,
            stage: ProgressStage::Muxing,
            fraction: self.fetch_share + fraction.clamp(0.0, 1.0) * (1.0 - self.fetch_share),
            bytes_done: 0,
            bytes_total: None,
        });
    }

    fn send(&self, update: ProgressUpdate) {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if !self.throttle.should_send(last.as_ref(), &update, now) {
            return;
        }
        // The forwarder only goes away once the job is finished
        if self.tx.send(update.clone()).is_ok() {
            *last = Some((update, now));
        }
    }
}

/// Starts the forwarder of `job`. The task ends once every reporter clone
/// is dropped and the backlog is drained.
pub fn spawn_forwarder(
    job: JobId,
    session: SessionId,
    needs_processing: bool,
    transport: Arc<dyn ChatTransport>,
    throttle: ProgressThrottle,
) -> (ProgressReporter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
    let reporter = ProgressReporter {
        job,
        tx,
        fetch_share: if needs_processing { FETCH_SHARE_WITH_PROCESSING } else { 1.0 },
        throttle,
        last: Arc::new(Mutex::new(None)),
    };

    let handle = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            if let Err(e) = transport.send_progress(session, &update).await {
                log::debug!("Progress update for job {} not delivered: {}", job, e);
            }
        }
    });

    (reporter, handle)
}
