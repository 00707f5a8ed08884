//! Shared fakes for the pipeline integration tests.
//!
//! Every external collaborator of the pipeline has a scripted stand-in here:
//! the extraction backend, the byte source, the media tool and the chat
//! transport.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use grabcore::conversion::{Invocation, MediaTool, ProcessingError, ProcessingResult, ToolProgress};
use grabcore::core::config::PipelineConfig;
use grabcore::core::retry::RetryConfig;
use grabcore::download::resolver::{ExtractionBackend, RawMedia};
use grabcore::download::{
    ByteStream, ChatTransport, Collaborators, DeliveredArtifact, FetchError, FormatKind, FormatOption, JobHandle,
    JobQueue,
    JobReport, ProgressUpdate, Request, ResolutionError, SessionId, StreamSource, TransportError, UserId,
};

pub const VIDEO_URL: &str = "https://cdn.test/video-1080.mp4";
pub const AUDIO_URL: &str = "https://cdn.test/audio-320.m4a";
pub const MUXED_URL: &str = "https://cdn.test/muxed-1080.mp4";

// ---------------------------------------------------------------------------
// Format fixtures
// ---------------------------------------------------------------------------

pub fn video_only_1080() -> FormatOption {
    FormatOption {
        id: "137".into(),
        kind: FormatKind::VideoOnly,
        container: "mp4".into(),
        video_codec: Some("avc1.640028".into()),
        audio_codec: None,
        width: Some(1920),
        height: Some(1080),
        bitrate_kbps: Some(4400.0),
        estimated_size: Some(4096),
        duration_secs: Some(180.0),
        url: VIDEO_URL.into(),
        http_headers: Vec::new(),
    }
}

pub fn audio_only_320() -> FormatOption {
    FormatOption {
        id: "141".into(),
        kind: FormatKind::AudioOnly,
        container: "m4a".into(),
        video_codec: None,
        audio_codec: Some("mp4a.40.2".into()),
        width: None,
        height: None,
        bitrate_kbps: Some(320.0),
        estimated_size: Some(1024),
        duration_secs: Some(180.0),
        url: AUDIO_URL.into(),
        http_headers: Vec::new(),
    }
}

pub fn muxed_1080() -> FormatOption {
    FormatOption {
        id: "37".into(),
        kind: FormatKind::VideoAudio,
        container: "mp4".into(),
        video_codec: Some("avc1.640028".into()),
        audio_codec: Some("mp4a.40.2".into()),
        width: Some(1920),
        height: Some(1080),
        bitrate_kbps: Some(4800.0),
        estimated_size: Some(6144),
        duration_secs: Some(180.0),
        url: MUXED_URL.into(),
        http_headers: Vec::new(),
    }
}

pub fn request(session: i64, user: i64) -> Request {
    let url = Url::parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
    Request::new(SessionId(session), UserId(user), url).with_title("Test Clip")
}

/// Test config: fast retries, no throttling, short cooldowns.
pub fn test_config(temp_dir: &Path) -> PipelineConfig {
    PipelineConfig::default()
        .temp_dir(temp_dir)
        .limits(4, 2)
        .fetch_retry(
            RetryConfig::new()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(10))
                .max_delay(Duration::from_millis(50))
                .no_jitter(),
        )
        .rate_limit(Duration::from_millis(50), 2)
        .job_timeout(Duration::from_secs(10))
        .max_delivery_size(50 * 1024 * 1024)
        .delivery_retry_delay(Duration::from_millis(10))
        .unthrottled_progress()
        .dispatch_interval(Duration::from_millis(20))
}

// ---------------------------------------------------------------------------
// Extraction backend
// ---------------------------------------------------------------------------

/// Backend returning canned JSON, counting calls.
pub struct FakeBackend {
    pub media: Result<RawMedia, ResolutionError>,
    pub calls: AtomicUsize,
}

impl FakeBackend {
    pub fn from_json(json: &str) -> Self {
        Self {
            media: Ok(serde_json::from_str(json).unwrap()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: ResolutionError) -> Self {
        Self {
            media: Err(err),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ExtractionBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn extract(&self, _url: &Url) -> Result<RawMedia, ResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.media.clone()
    }
}

// ---------------------------------------------------------------------------
// Stream source
// ---------------------------------------------------------------------------

/// What one `open` call of a URL does.
#[derive(Clone)]
pub enum Script {
    /// Full body, split into chunks
    Body { size: usize, chunk: usize },
    /// Connection drops after `sent` bytes
    DropAfter { size: usize, sent: usize },
    /// HTTP 429
    RateLimited { retry_after: Option<Duration> },
    /// Sends `sent` bytes, then never finishes
    Hang { size: usize, sent: usize },
    /// Fatal status
    Rejected(u16),
    /// Cancels the job given to `cancel_on_open`, then answers HTTP 429
    CancelThenRateLimit { retry_after: Option<Duration> },
}

/// Source scripted per URL. The last script of a URL repeats.
#[derive(Default)]
pub struct FakeSource {
    scripts: Mutex<HashMap<String, Vec<Script>>>,
    opened: Mutex<Vec<String>>,
    cancel_target: Mutex<Option<JobHandle>>,
    /// Pause between chunks
    pub chunk_delay: Duration,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_delay(delay: Duration) -> Self {
        Self {
            chunk_delay: delay,
            ..Self::default()
        }
    }

    pub fn script(self, url: &str, steps: Vec<Script>) -> Self {
        self.scripts.lock().unwrap().insert(url.to_string(), steps);
        self
    }

    pub fn serve(self, url: &str, size: usize) -> Self {
        self.script(url, vec![Script::Body { size, chunk: 512 }])
    }

    /// Job cancelled by `Script::CancelThenRateLimit`.
    pub fn cancel_on_open(&self, handle: JobHandle) {
        *self.cancel_target.lock().unwrap() = Some(handle);
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn open_count(&self, url: &str) -> usize {
        self.opened().iter().filter(|u| *u == url).count()
    }

    fn next_script(&self, url: &str) -> Option<Script> {
        let mut scripts = self.scripts.lock().unwrap();
        let steps = scripts.get_mut(url)?;
        if steps.len() > 1 {
            Some(steps.remove(0))
        } else {
            steps.first().cloned()
        }
    }
}

fn chunks(size: usize, chunk: usize) -> Vec<Result<Bytes, FetchError>> {
    let mut out = Vec::new();
    let mut left = size;
    while left > 0 {
        let n = left.min(chunk.max(1));
        out.push(Ok(Bytes::from(vec![0u8; n])));
        left -= n;
    }
    out
}

#[async_trait]
impl StreamSource for FakeSource {
    async fn open(&self, format: &FormatOption) -> Result<ByteStream, FetchError> {
        self.opened.lock().unwrap().push(format.url.clone());
        let script = self
            .next_script(&format.url)
            .ok_or(FetchError::Rejected { status: 404 })?;
        let delay = self.chunk_delay;

        let (total, items): (u64, Vec<Result<Bytes, FetchError>>) = match script {
            Script::Body { size, chunk } => (size as u64, chunks(size, chunk)),
            Script::DropAfter { size, sent } => {
                let mut items = chunks(sent, 256);
                items.push(Err(FetchError::network("connection reset by peer")));
                (size as u64, items)
            }
            Script::RateLimited { retry_after } => return Err(FetchError::QuotaOrRateLimited { retry_after }),
            Script::Rejected(status) => return Err(FetchError::Rejected { status }),
            Script::CancelThenRateLimit { retry_after } => {
                let handle = loop {
                    let target = self.cancel_target.lock().unwrap().clone();
                    if let Some(handle) = target {
                        break handle;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                };
                handle.cancel();
                return Err(FetchError::QuotaOrRateLimited { retry_after });
            }
            Script::Hang { size, sent } => {
                let body = stream::iter(chunks(sent, 256)).chain(stream::pending());
                return Ok(ByteStream {
                    total: Some(size as u64),
                    body: body.boxed(),
                });
            }
        };

        let body = stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(ByteStream {
            total: Some(total),
            body: body.boxed(),
        })
    }
}

// ---------------------------------------------------------------------------
// Media tool
// ---------------------------------------------------------------------------

/// Media tool that writes its output without running anything.
pub struct FakeTool {
    pub available: bool,
    /// Duration reported for inputs
    pub input_duration: f64,
    /// Duration reported for written outputs (defaults to the input one)
    pub output_duration: Option<f64>,
    /// How long `invoke` takes; cancellation is honored meanwhile
    pub run_time: Duration,
    invocations: Mutex<Vec<Invocation>>,
}

impl FakeTool {
    pub fn new() -> Self {
        Self {
            available: true,
            input_duration: 180.0,
            output_duration: None,
            run_time: Duration::ZERO,
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn missing() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn with_output_duration(mut self, secs: f64) -> Self {
        self.output_duration = Some(secs);
        self
    }

    pub fn with_run_time(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    fn is_output(&self, path: &Path) -> bool {
        self.invocations.lock().unwrap().iter().any(|i| i.output == path)
    }
}

#[async_trait]
impl MediaTool for FakeTool {
    fn name(&self) -> &str {
        "fake-ffmpeg"
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        on_progress: &ToolProgress<'_>,
        cancel: &CancellationToken,
    ) -> ProcessingResult<()> {
        if !self.available {
            return Err(ProcessingError::ExternalToolUnavailable("fake-ffmpeg".into()));
        }
        self.invocations.lock().unwrap().push(invocation.clone());

        on_progress(0.5);
        tokio::select! {
            _ = cancel.cancelled() => return Err(ProcessingError::Cancelled),
            _ = tokio::time::sleep(self.run_time) => {}
        }

        let mut size = 0;
        for input in &invocation.inputs {
            size += tokio::fs::metadata(input).await?.len();
        }
        tokio::fs::write(&invocation.output, vec![1u8; size as usize]).await?;
        on_progress(1.0);
        Ok(())
    }

    async fn probe_duration(&self, path: &Path) -> ProcessingResult<f64> {
        if self.is_output(path) {
            Ok(self.output_duration.unwrap_or(self.input_duration))
        } else {
            Ok(self.input_duration)
        }
    }
}

// ---------------------------------------------------------------------------
// Chat transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Progress(SessionId, ProgressUpdate),
    Artifact {
        session: SessionId,
        path: PathBuf,
        size: u64,
        existed: bool,
    },
    Text(SessionId, String),
    Report(SessionId, JobReport),
}

/// Transport that records every call.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
    delivered: Mutex<Vec<DeliveredArtifact>>,
    /// How many artifact uploads fail before one succeeds
    pub failing_uploads: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_uploads(n: usize) -> Self {
        Self {
            failing_uploads: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn reports(&self) -> Vec<JobReport> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Report(_, r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn artifacts(&self) -> Vec<Sent> {
        self.sent()
            .into_iter()
            .filter(|s| matches!(s, Sent::Artifact { .. }))
            .collect()
    }

    /// Every artifact handed to `send_artifact`, as received.
    pub fn delivered(&self) -> Vec<DeliveredArtifact> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn progress_fractions(&self) -> Vec<f64> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Progress(_, u) => Some(u.fraction),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_progress(&self, session: SessionId, update: &ProgressUpdate) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(Sent::Progress(session, update.clone()));
        Ok(())
    }

    async fn send_artifact(&self, session: SessionId, artifact: &DeliveredArtifact) -> Result<(), TransportError> {
        let existed = artifact.path.exists();
        self.sent.lock().unwrap().push(Sent::Artifact {
            session,
            path: artifact.path.clone(),
            size: artifact.size_bytes,
            existed,
        });
        self.delivered.lock().unwrap().push(artifact.clone());
        let remaining = self.failing_uploads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_uploads.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::new("Bad Gateway"));
        }
        Ok(())
    }

    async fn send_text(&self, session: SessionId, text: &str) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(Sent::Text(session, text.to_string()));
        Ok(())
    }

    async fn send_report(&self, session: SessionId, report: &JobReport) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(Sent::Report(session, report.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub queue: JobQueue,
    pub source: Arc<FakeSource>,
    pub tool: Arc<FakeTool>,
    pub transport: Arc<RecordingTransport>,
    pub temp: tempfile::TempDir,
}

impl Harness {
    pub async fn start(source: FakeSource, tool: FakeTool, transport: RecordingTransport) -> Self {
        Self::start_with(source, tool, transport, test_config).await
    }

    pub async fn start_with(
        source: FakeSource,
        tool: FakeTool,
        transport: RecordingTransport,
        config: impl FnOnce(&Path) -> PipelineConfig,
    ) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let source = Arc::new(source);
        let tool = Arc::new(tool);
        let transport = Arc::new(transport);
        let queue = JobQueue::start(
            config(temp.path()),
            Collaborators {
                source: source.clone(),
                tool: tool.clone(),
                transport: transport.clone(),
            },
        )
        .await
        .unwrap();
        Self {
            queue,
            source,
            tool,
            transport,
            temp,
        }
    }

    /// Total bytes left in the temp root.
    pub async fn leftover_bytes(&self) -> u64 {
        grabcore::download::workspace::dir_size(self.temp.path()).await
    }

    /// Number of entries left in the temp root.
    pub fn leftover_entries(&self) -> usize {
        std::fs::read_dir(self.temp.path()).map(|d| d.count()).unwrap_or(0)
    }
}

/// Waits for the job with a generous upper bound.
pub async fn wait(handle: &grabcore::download::JobHandle) -> grabcore::download::JobState {
    tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap()
}
