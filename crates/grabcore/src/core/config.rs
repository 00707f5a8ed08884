use once_cell::sync::Lazy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::retry::RetryConfig;

/// Reads an environment variable and parses it, falling back to `default`
/// when the variable is unset or unparsable.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Ignoring invalid value for {}: {:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Cached yt-dlp binary path
/// Read once at startup from YTDL_BIN environment variable or defaults to "yt-dlp"
pub static YTDL_BIN: Lazy<String> = Lazy::new(|| env::var("YTDL_BIN").unwrap_or_else(|_| "yt-dlp".to_string()));

/// ffmpeg binary used by the mux/transcode stage
pub static FFMPEG_BIN: Lazy<String> =
    Lazy::new(|| env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string()));

/// ffprobe binary used to read media durations
pub static FFPROBE_BIN: Lazy<String> =
    Lazy::new(|| env::var("FFPROBE_BIN").unwrap_or_else(|_| "ffprobe".to_string()));

/// Root of the per-job temporary directories.
/// Read from TEMP_FILES_DIR, defaults to `<system temp>/grabbot-jobs`.
/// Supports tilde (~) expansion.
pub static TEMP_FILES_DIR: Lazy<PathBuf> = Lazy::new(|| match env::var("TEMP_FILES_DIR") {
    Ok(dir) if !dir.trim().is_empty() => expand_tilde(&dir),
    _ => env::temp_dir().join("grabbot-jobs"),
});

/// Log file path
/// Read from LOG_FILE_PATH environment variable
/// Default: grabbot.log
pub static LOG_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "grabbot.log".to_string()));

/// Bot token
/// Read from BOT_TOKEN or TELOXIDE_TOKEN environment variable
pub static BOT_TOKEN: Lazy<String> = Lazy::new(|| {
    env::var("BOT_TOKEN")
        .or_else(|_| env::var("TELOXIDE_TOKEN"))
        .unwrap_or_else(|_| String::new())
});

/// Custom Bot API server URL (local Bot API server allows much larger uploads)
pub static BOT_API_URL: Lazy<Option<String>> = Lazy::new(|| env::var("BOT_API_URL").ok());

/// Port of the Prometheus/health HTTP server
pub static METRICS_PORT: Lazy<u16> = Lazy::new(|| env_parse("METRICS_PORT", 9090));

/// Expands a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Queue processing configuration
pub mod queue {
    use super::{env_parse, Duration, Lazy};

    /// Maximum number of jobs allowed to wait in the queue.
    pub const MAX_QUEUE_SIZE: usize = 1000;

    /// Global cap on concurrently fetching jobs
    pub static MAX_CONCURRENT_DOWNLOADS: Lazy<usize> = Lazy::new(|| env_parse("MAX_CONCURRENT_DOWNLOADS", 4));

    /// Per-user cap on concurrently fetching jobs
    pub static MAX_DOWNLOADS_PER_USER: Lazy<usize> = Lazy::new(|| env_parse("MAX_DOWNLOADS_PER_USER", 1));

    /// How many times a rate-limited job may go back to the queue before it fails.
    pub const MAX_REQUEUES: u32 = 3;

    /// Interval between dispatcher wakeups when nothing notified it (in milliseconds)
    pub const CHECK_INTERVAL_MS: u64 = 500;

    /// Queue check interval duration
    pub fn check_interval() -> Duration {
        Duration::from_millis(CHECK_INTERVAL_MS)
    }
}

/// Download configuration
pub mod download {
    use super::{env_parse, Duration, Lazy};

    /// Timeout for yt-dlp metadata commands (in seconds)
    pub const YTDLP_TIMEOUT_SECS: u64 = 120;

    /// Deadline for one job's fetch + mux work, counted from admission
    pub static JOB_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| env_parse("JOB_TIMEOUT_SECS", 1800));

    /// Cooldown applied to a rate-limited job when the server gave no hint
    pub const RATE_LIMIT_COOLDOWN_SECS: u64 = 60;

    /// Upper bound on any rate limit cooldown, server hints included
    pub const MAX_RATE_LIMIT_COOLDOWN_SECS: u64 = 3600;

    /// Default audio bitrate for extracted tracks, in kbps
    pub static AUDIO_BITRATE_KBPS: Lazy<u32> = Lazy::new(|| {
        let raw = std::env::var("AUDIO_BITRATE").unwrap_or_else(|_| "320k".to_string());
        raw.trim_end_matches(['k', 'K']).parse().unwrap_or(320)
    });

    /// Tolerance when comparing the muxed duration against its inputs
    pub const DURATION_TOLERANCE_SECS: f64 = 1.5;

    /// Minimum interval between two forwarded progress updates (ms)
    pub const PROGRESS_MIN_INTERVAL_MS: u64 = 2000;

    /// Minimum progress delta that forces an update regardless of time
    pub const PROGRESS_MIN_STEP: f64 = 0.05;

    /// yt-dlp command timeout duration
    pub fn ytdlp_timeout() -> Duration {
        Duration::from_secs(YTDLP_TIMEOUT_SECS)
    }

    /// Job deadline duration
    pub fn job_timeout() -> Duration {
        Duration::from_secs(*JOB_TIMEOUT_SECS)
    }

    /// Rate limit cooldown duration
    pub fn rate_limit_cooldown() -> Duration {
        Duration::from_secs(RATE_LIMIT_COOLDOWN_SECS)
    }

    pub fn max_rate_limit_cooldown() -> Duration {
        Duration::from_secs(MAX_RATE_LIMIT_COOLDOWN_SECS)
    }
}

/// Retry configuration for interrupted fetches
pub mod retry {
    use super::{env_parse, Duration, Lazy};

    /// Total fetch attempts (first try included)
    pub static FETCH_MAX_ATTEMPTS: Lazy<u32> = Lazy::new(|| env_parse("FETCH_MAX_ATTEMPTS", 3));

    /// Base delay of the exponential backoff (in seconds)
    pub static FETCH_BACKOFF_BASE_SECS: Lazy<u64> = Lazy::new(|| env_parse("FETCH_BACKOFF_BASE_SECS", 2));

    /// Upper bound for one backoff delay (in seconds)
    pub const MAX_BACKOFF_SECS: u64 = 30;

    /// Base for exponential backoff calculation
    pub const EXPONENTIAL_BACKOFF_BASE: f64 = 2.0;

    /// Delay before the single delivery retry (in seconds)
    pub const DELIVERY_RETRY_DELAY_SECS: u64 = 5;

    pub fn base_delay() -> Duration {
        Duration::from_secs(*FETCH_BACKOFF_BASE_SECS)
    }

    pub fn delivery_retry_delay() -> Duration {
        Duration::from_secs(DELIVERY_RETRY_DELAY_SECS)
    }
}

/// Format cache configuration
pub mod cache {
    use super::Duration;

    /// How long resolved format lists stay cached (in seconds)
    pub const FORMAT_TTL_SECS: u64 = 600;

    /// Maximum number of cached URLs
    pub const FORMAT_CACHE_CAPACITY: u64 = 10_000;

    pub fn format_ttl() -> Duration {
        Duration::from_secs(FORMAT_TTL_SECS)
    }
}

/// Validation limits
pub mod validation {
    /// Maximum URL length
    pub const MAX_URL_LENGTH: usize = 2048;

    /// Telegram Bot API upload limit (50 MB)
    pub const MAX_FILE_SIZE_BYTES: u64 = 50 * 1024 * 1024;

    /// Upload limit of a local Bot API server (2 GB)
    pub const LOCAL_API_MAX_FILE_SIZE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

    /// Maximum deliverable size for the configured transport.
    ///
    /// A local Bot API server (BOT_API_URL not pointing at api.telegram.org)
    /// accepts much larger files.
    pub fn max_delivery_size_bytes() -> u64 {
        match super::BOT_API_URL.as_deref() {
            Some(url) if !url.contains("api.telegram.org") => LOCAL_API_MAX_FILE_SIZE_BYTES,
            _ => MAX_FILE_SIZE_BYTES,
        }
    }
}

/// Runtime view of the pipeline settings.
///
/// `Default` reads the environment-backed values above; the setters let
/// tests and embedders override single knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub temp_dir: PathBuf,
    pub max_concurrent: usize,
    pub max_per_user: usize,
    pub max_queue_size: usize,
    pub max_requeues: u32,
    pub fetch_retry: RetryConfig,
    pub rate_limit_cooldown: Duration,
    pub job_timeout: Duration,
    pub max_delivery_size: u64,
    pub delivery_retry_delay: Duration,
    pub duration_tolerance_secs: f64,
    pub progress_min_interval: Duration,
    pub progress_min_step: f64,
    pub dispatch_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            temp_dir: TEMP_FILES_DIR.clone(),
            max_concurrent: (*queue::MAX_CONCURRENT_DOWNLOADS).max(1),
            max_per_user: (*queue::MAX_DOWNLOADS_PER_USER).max(1),
            max_queue_size: queue::MAX_QUEUE_SIZE,
            max_requeues: queue::MAX_REQUEUES,
            fetch_retry: RetryConfig::fetch(),
            rate_limit_cooldown: download::rate_limit_cooldown(),
            job_timeout: download::job_timeout(),
            max_delivery_size: validation::max_delivery_size_bytes(),
            delivery_retry_delay: retry::delivery_retry_delay(),
            duration_tolerance_secs: download::DURATION_TOLERANCE_SECS,
            progress_min_interval: Duration::from_millis(download::PROGRESS_MIN_INTERVAL_MS),
            progress_min_step: download::PROGRESS_MIN_STEP,
            dispatch_interval: queue::check_interval(),
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    #[must_use]
    pub fn limits(mut self, global: usize, per_user: usize) -> Self {
        self.max_concurrent = global.max(1);
        self.max_per_user = per_user.max(1);
        self
    }

    #[must_use]
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    #[must_use]
    pub fn fetch_retry(mut self, retry: RetryConfig) -> Self {
        self.fetch_retry = retry;
        self
    }

    #[must_use]
    pub fn rate_limit(mut self, cooldown: Duration, max_requeues: u32) -> Self {
        self.rate_limit_cooldown = cooldown;
        self.max_requeues = max_requeues;
        self
    }

    #[must_use]
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_delivery_size(mut self, bytes: u64) -> Self {
        self.max_delivery_size = bytes;
        self
    }

    #[must_use]
    pub fn delivery_retry_delay(mut self, delay: Duration) -> Self {
        self.delivery_retry_delay = delay;
        self
    }

    /// Forward every progress update (tests want to see them all).
    #[must_use]
    pub fn unthrottled_progress(mut self) -> Self {
        self.progress_min_interval = Duration::ZERO;
        self.progress_min_step = 0.0;
        self
    }

    #[must_use]
    pub fn dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }
}
