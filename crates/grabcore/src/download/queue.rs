//! Job queue and worker pool.
//!
//! `submit` registers a job and puts it in the admission queue. A single
//! dispatcher task admits jobs as slots free up and spawns one worker per
//! admitted job; the worker owns the job until it is terminal (or handed
//! back to the queue after a rate limit).
//!
//! Terminal bookkeeping happens in one place (`finish`), in this order:
//! temp directory purged, admission slot released, session bindings
//! released, progress drained, final report sent, terminal state published.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::conversion::{check_mux_compatibility, MediaTool, ProcessingError, Processor, StreamFile};
use crate::core::config::{self, PipelineConfig};
use crate::core::metrics;
use crate::download::admission::{Admission, AdmissionController};
use crate::download::delivery::{ChatTransport, DeliveryAdapter};
use crate::download::error::{FetchError, JobFailure, SubmitError};
use crate::download::fetcher::Fetcher;
use crate::download::job::{JobCell, JobHandle, JobReport, JobState};
use crate::download::model::{DeliveredArtifact, FormatKind, JobId, Request, SessionId, UserId};
use crate::download::progress::{spawn_forwarder, ProgressReporter, ProgressThrottle};
use crate::download::selection::{Selection, StreamRole};
use crate::download::session::SessionTracker;
use crate::download::source::StreamSource;
use crate::download::workspace::{self, JobWorkspace};

/// External collaborators of the pipeline.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn StreamSource>,
    pub tool: Arc<dyn MediaTool>,
    pub transport: Arc<dyn ChatTransport>,
}

struct JobEntry {
    id: JobId,
    request: Request,
    selection: Selection,
    cell: JobCell,
    cancel: CancellationToken,
    requeues: AtomicU32,
    finished: AtomicBool,
    reporter: Mutex<Option<ProgressReporter>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl JobEntry {
    fn user(&self) -> UserId {
        self.request.user
    }

    fn session(&self) -> SessionId {
        self.request.session
    }

    fn reporter(&self) -> Option<ProgressReporter> {
        self.reporter.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Why the fetch/process phase stopped early.
enum Stop {
    Failed(JobFailure),
    Cancelled,
    RateLimited(Option<Duration>),
}

impl From<ProcessingError> for Stop {
    fn from(err: ProcessingError) -> Self {
        match err {
            ProcessingError::Cancelled => Stop::Cancelled,
            other => Stop::Failed(JobFailure::Processing(other)),
        }
    }
}

impl From<FetchError> for Stop {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => Stop::Cancelled,
            FetchError::QuotaOrRateLimited { retry_after } => Stop::RateLimited(retry_after),
            other => Stop::Failed(JobFailure::Fetch(other)),
        }
    }
}

/// What a worker run ended with.
enum RunOutcome {
    Terminal(JobState),
    Requeued,
}

struct QueueInner {
    config: PipelineConfig,
    admission: AdmissionController,
    sessions: SessionTracker,
    jobs: DashMap<JobId, Arc<JobEntry>>,
    fetcher: Fetcher,
    processor: Processor,
    delivery: DeliveryAdapter,
    transport: Arc<dyn ChatTransport>,
    shutdown: CancellationToken,
}

/// Cloneable handle to the running queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    /// Purges leftovers in the temp root and starts the dispatcher.
    pub async fn start(config: PipelineConfig, collaborators: Collaborators) -> std::io::Result<Self> {
        workspace::purge_all(&config.temp_dir).await?;

        let inner = Arc::new(QueueInner {
            admission: AdmissionController::new(config.max_concurrent, config.max_per_user),
            sessions: SessionTracker::new(),
            jobs: DashMap::new(),
            fetcher: Fetcher::new(collaborators.source, config.fetch_retry.clone()),
            processor: Processor::new(collaborators.tool, config.duration_tolerance_secs),
            delivery: DeliveryAdapter::new(
                Arc::clone(&collaborators.transport),
                config.max_delivery_size,
                config.delivery_retry_delay,
            ),
            transport: collaborators.transport,
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(dispatch_loop(Arc::clone(&inner)));
        log::info!(
            "Job queue started (global limit {}, per-user limit {}, temp dir {})",
            inner.config.max_concurrent,
            inner.config.max_per_user,
            inner.config.temp_dir.display()
        );
        Ok(Self { inner })
    }

    /// Registers a job for `request` and queues it for admission.
    pub fn submit(&self, request: Request, selection: Selection) -> Result<JobHandle, SubmitError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        selection.validate()?;

        let id = JobId::new();
        inner.sessions.bind(request.session, request.id, id)?;

        let cancel = inner.shutdown.child_token();
        let cell = JobCell::new(id);
        let handle = cell.handle(request.id, request.session, cancel.clone());
        let (reporter, forwarder) = spawn_forwarder(
            id,
            request.session,
            selection.needs_processing(),
            Arc::clone(&inner.transport),
            ProgressThrottle {
                min_step: inner.config.progress_min_step,
                min_interval: inner.config.progress_min_interval,
            },
        );

        let entry = Arc::new(JobEntry {
            id,
            selection,
            cell,
            cancel: cancel.clone(),
            requeues: AtomicU32::new(0),
            finished: AtomicBool::new(false),
            reporter: Mutex::new(Some(reporter)),
            forwarder: Mutex::new(Some(forwarder)),
            request,
        });
        inner.jobs.insert(id, Arc::clone(&entry));
        // Bound check and enqueue happen under one admission lock
        if !inner
            .admission
            .try_enqueue(entry.user(), id, inner.config.max_queue_size)
        {
            log::warn!(
                "Queue full, rejecting request {} from session {}",
                entry.request.id,
                entry.session()
            );
            inner.jobs.remove(&id);
            inner.sessions.release(entry.session(), entry.request.id, id);
            return Err(SubmitError::QueueFull(inner.config.max_queue_size));
        }
        log::info!(
            "Job {} submitted: session={} user={} url={} selection={}",
            id,
            entry.session(),
            entry.user(),
            entry.request.url,
            entry.selection.describe()
        );
        metrics::record_submitted();
        metrics::update_queue_depth(inner.admission.queued_len());

        tokio::spawn(watch_cancellation(Arc::clone(inner), entry, handle.clone()));
        Ok(handle)
    }

    pub fn get(&self, job: JobId) -> Option<JobHandle> {
        self.inner
            .jobs
            .get(&job)
            .map(|e| e.cell.handle(e.request.id, e.session(), e.cancel.clone()))
    }

    /// Active (non-terminal) job of `session`.
    pub fn active_job(&self, session: SessionId) -> Option<JobHandle> {
        self.inner.sessions.active_job(session).and_then(|id| self.get(id))
    }

    /// Requests cancellation of `job`. Returns false for unknown jobs.
    pub fn cancel(&self, job: JobId) -> bool {
        match self.inner.jobs.get(&job) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels the active job of `session`, if any.
    pub fn cancel_session(&self, session: SessionId) -> Option<JobId> {
        let job = self.inner.sessions.active_job(session)?;
        self.cancel(job).then_some(job)
    }

    /// 1-based admission position of the session's queued job.
    pub fn queue_position(&self, session: SessionId) -> Option<usize> {
        let job = self.inner.sessions.active_job(session)?;
        self.inner.admission.position(job)
    }

    pub fn queued_len(&self) -> usize {
        self.inner.admission.queued_len()
    }

    pub fn active_len(&self) -> usize {
        self.inner.admission.active_len()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Stops the dispatcher, cancels every job and waits up to `grace` for
    /// them to finish.
    pub async fn shutdown(&self, grace: Duration) {
        log::info!("Shutting down job queue ({} job(s) in flight)", self.inner.jobs.len());
        self.inner.shutdown.cancel();
        let deadline = Instant::now() + grace;
        while !self.inner.jobs.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !self.inner.jobs.is_empty() {
            log::warn!("{} job(s) still running after shutdown grace period", self.inner.jobs.len());
        }
    }
}

async fn dispatch_loop(inner: Arc<QueueInner>) {
    loop {
        while let Some(admission) = inner.admission.try_admit() {
            log::debug!("Admitted job {} for user {}", admission.job, admission.user);
            tokio::spawn(run_worker(Arc::clone(&inner), admission));
        }
        metrics::update_queue_depth(inner.admission.queued_len());
        metrics::update_active_jobs(inner.admission.active_len());

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.admission.changed() => {}
            _ = tokio::time::sleep(inner.config.dispatch_interval) => {}
        }
    }
    log::info!("Dispatcher stopped");
}

/// Finalizes jobs that are cancelled while waiting for a slot.
async fn watch_cancellation(inner: Arc<QueueInner>, entry: Arc<JobEntry>, handle: JobHandle) {
    tokio::select! {
        _ = entry.cancel.cancelled() => {
            if inner.admission.remove(entry.user(), entry.id) {
                log::info!("Job {} cancelled while queued", entry.id);
                finish(&inner, &entry, JobState::Cancelled, false).await;
            }
        }
        _ = handle.wait() => {}
    }
}

async fn run_worker(inner: Arc<QueueInner>, admission: Admission) {
    let entry = inner.jobs.get(&admission.job).map(|e| Arc::clone(e.value()));
    let Some(entry) = entry else {
        log::warn!("Admitted unknown job {}", admission.job);
        inner.admission.release(admission.user);
        return;
    };

    match execute(&inner, &entry).await {
        RunOutcome::Terminal(state) => finish(&inner, &entry, state, true).await,
        RunOutcome::Requeued => {
            // The queued-job watcher is gone once the token fired during the run
            if entry.cancel.is_cancelled() && inner.admission.remove(entry.user(), entry.id) {
                log::info!("Job {} cancelled while being requeued", entry.id);
                finish(&inner, &entry, JobState::Cancelled, false).await;
            }
        }
    }
}

/// Carries one admitted job as far as it goes in this run.
async fn execute(inner: &QueueInner, entry: &JobEntry) -> RunOutcome {
    let timeout = inner.config.job_timeout;
    let deadline = Instant::now() + timeout;
    let cancel = &entry.cancel;
    if cancel.is_cancelled() {
        return RunOutcome::Terminal(JobState::Cancelled);
    }
    if !entry.cell.transition(JobState::Fetching) {
        return RunOutcome::Terminal(JobState::Failed(JobFailure::Internal(format!(
            "job could not start from state {}",
            entry.cell.state().name()
        ))));
    }

    // Fail fast before any byte is fetched
    if entry.selection.needs_processing() {
        if let Err(e) = inner.processor.ensure_available().await {
            log::error!("Job {}: {}", entry.id, e);
            return RunOutcome::Terminal(JobState::Failed(JobFailure::Processing(e)));
        }
    }
    if let Selection::Split { video, audio } = &entry.selection {
        if let Err(e) = check_mux_compatibility(
            &video.container,
            video.video_codec.as_deref().unwrap_or("unknown"),
            audio.audio_codec.as_deref().unwrap_or("unknown"),
        ) {
            return RunOutcome::Terminal(JobState::Failed(JobFailure::Processing(e)));
        }
    }

    let workspace = match JobWorkspace::create(&inner.config.temp_dir, entry.id).await {
        Ok(ws) => ws,
        Err(e) => {
            return RunOutcome::Terminal(JobState::Failed(JobFailure::Internal(format!(
                "temp directory: {}",
                e
            ))))
        }
    };

    // The deadline counts from admission and covers Fetching and Muxing
    let work = fetch_and_process(inner, entry, &workspace);
    let artifact = match tokio::time::timeout_at(deadline, work).await {
        Ok(Ok(artifact)) => artifact,
        Ok(Err(Stop::Cancelled)) => return RunOutcome::Terminal(JobState::Cancelled),
        Ok(Err(Stop::Failed(failure))) => return RunOutcome::Terminal(JobState::Failed(failure)),
        Ok(Err(Stop::RateLimited(retry_after))) => return requeue(inner, entry, &workspace, retry_after).await,
        Err(_) => {
            log::warn!("Job {} exceeded its {:?} deadline", entry.id, timeout);
            return RunOutcome::Terminal(JobState::Failed(JobFailure::Timeout(timeout.as_secs())));
        }
    };

    if cancel.is_cancelled() {
        return RunOutcome::Terminal(JobState::Cancelled);
    }
    if !entry.cell.transition(JobState::Delivering) {
        return RunOutcome::Terminal(JobState::Failed(JobFailure::Internal("delivery refused".to_string())));
    }
    match inner.delivery.deliver(&artifact, entry.session()).await {
        Ok(()) => RunOutcome::Terminal(JobState::Completed),
        Err(e) => RunOutcome::Terminal(JobState::Failed(JobFailure::Delivery(e))),
    }
}

/// Fetches every stream of the selection, then builds the artifact.
async fn fetch_and_process(
    inner: &QueueInner,
    entry: &JobEntry,
    workspace: &JobWorkspace,
) -> Result<DeliveredArtifact, Stop> {
    let reporter = entry.reporter();
    let streams = entry.selection.fetch_list();

    // Weight each stream by its estimated size so the bar moves evenly
    let weights: Vec<f64> = {
        let sizes: Vec<Option<u64>> = streams.iter().map(|(_, f)| f.estimated_size).collect();
        if sizes.iter().all(Option::is_some) && sizes.iter().flatten().sum::<u64>() > 0 {
            let total = sizes.iter().flatten().sum::<u64>() as f64;
            sizes.iter().map(|s| s.unwrap_or(0) as f64 / total).collect()
        } else {
            vec![1.0 / streams.len().max(1) as f64; streams.len()]
        }
    };

    let mut video = None;
    let mut audio = None;
    let mut done_share = 0.0;
    let mut done_bytes = 0u64;
    for ((role, format), &weight) in streams.iter().zip(&weights) {
        let dest = workspace.input_path(*role, &format.container);
        let (base_share, base_bytes) = (done_share, done_bytes);
        let stream_reporter = reporter.as_ref();
        let on_progress = move |received: u64, total: Option<u64>| {
            if let Some(reporter) = stream_reporter {
                let part = match total {
                    Some(t) if t > 0 => (received as f64 / t as f64).min(1.0),
                    _ => 0.0,
                };
                reporter.fetching(base_share + part * weight, base_bytes + received, total);
            }
        };
        let path = inner.fetcher.fetch(format, &dest, &on_progress, &entry.cancel).await?;
        done_share += weight;
        done_bytes += fs_err::tokio::metadata(&path).await.map(|m| m.len()).unwrap_or(0);

        let file = StreamFile {
            path,
            container: format.container.clone(),
            video_codec: format.video_codec.clone(),
            audio_codec: format.audio_codec.clone(),
            duration_secs: format.duration_secs,
            audio_only: format.kind == FormatKind::AudioOnly,
        };
        match role {
            StreamRole::Video => video = Some(file),
            StreamRole::Audio => audio = Some(file),
        }
    }

    if entry.cancel.is_cancelled() {
        return Err(Stop::Cancelled);
    }
    let processing = entry.selection.needs_processing();
    if processing && !entry.cell.transition(JobState::Muxing) {
        return Err(Stop::Failed(JobFailure::Internal("mux step refused".to_string())));
    }

    let started = std::time::Instant::now();
    let mux_reporter = reporter.as_ref();
    let on_tool_progress = move |fraction: f64| {
        if let Some(reporter) = mux_reporter {
            reporter.muxing(fraction);
        }
    };
    let artifact = inner
        .processor
        .process(
            video,
            audio,
            entry.selection.target(),
            entry.request.title.as_deref(),
            workspace.dir(),
            &on_tool_progress,
            &entry.cancel,
        )
        .await?;
    if processing {
        metrics::record_stage_duration("mux", started.elapsed().as_secs_f64());
    }
    Ok(DeliveredArtifact {
        uploader: entry.request.uploader.clone(),
        resolution: entry.selection.resolution_label(),
        ..artifact
    })
}

/// Puts a rate-limited job back in the queue, or fails it once the
/// requeue budget is spent.
async fn requeue(
    inner: &QueueInner,
    entry: &JobEntry,
    workspace: &JobWorkspace,
    retry_after: Option<Duration>,
) -> RunOutcome {
    let count = entry.requeues.fetch_add(1, Ordering::SeqCst) + 1;
    if count > inner.config.max_requeues {
        log::warn!("Job {} rate limited {} times, giving up", entry.id, count);
        return RunOutcome::Terminal(JobState::Failed(JobFailure::Fetch(FetchError::QuotaOrRateLimited {
            retry_after,
        })));
    }

    if entry.cancel.is_cancelled() {
        return RunOutcome::Terminal(JobState::Cancelled);
    }
    workspace.purge().await;
    if !entry.cell.transition(JobState::Queued) {
        // Cancelled or otherwise finished meanwhile
        return RunOutcome::Terminal(JobState::Cancelled);
    }

    let cooldown = retry_after
        .unwrap_or(inner.config.rate_limit_cooldown)
        .min(config::download::max_rate_limit_cooldown());
    log::info!(
        "Job {} rate limited, back in queue for {:?} (requeue {}/{})",
        entry.id,
        cooldown,
        count,
        inner.config.max_requeues
    );
    metrics::record_requeue();
    let now = Instant::now();
    let not_before = now.checked_add(cooldown).unwrap_or(now);
    inner.admission.requeue_with_cooldown(entry.user(), entry.id, not_before);
    RunOutcome::Requeued
}

/// Terminal bookkeeping. Runs at most once per job.
async fn finish(inner: &QueueInner, entry: &JobEntry, state: JobState, holds_slot: bool) {
    if entry.finished.swap(true, Ordering::SeqCst) {
        return;
    }

    JobWorkspace::at(&inner.config.temp_dir, entry.id).purge().await;
    if holds_slot {
        inner.admission.release(entry.user());
    }
    inner.sessions.release(entry.session(), entry.request.id, entry.id);

    // Drain progress before the final message so nothing arrives after it
    let reporter = entry.reporter.lock().unwrap_or_else(|e| e.into_inner()).take();
    drop(reporter);
    let forwarder = entry.forwarder.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(forwarder) = forwarder {
        if let Err(e) = forwarder.await {
            log::warn!("Progress forwarder of job {} ended abnormally: {}", entry.id, e);
        }
    }

    let report = JobReport::for_state(entry.id, state.clone());
    if let Err(e) = inner.transport.send_report(entry.session(), &report).await {
        log::error!("Final report for job {} not delivered: {}", entry.id, e);
    }

    let (outcome, reason) = match &state {
        JobState::Completed => ("completed", "none"),
        JobState::Failed(failure) => ("failed", failure.category()),
        _ => ("cancelled", "none"),
    };
    metrics::record_finished(outcome, reason);

    if !entry.cell.transition(state) {
        log::error!("Job {} could not reach its terminal state", entry.id);
    }
    inner.jobs.remove(&entry.id);
    metrics::update_queue_depth(inner.admission.queued_len());
    metrics::update_active_jobs(inner.admission.active_len());
}
