//! Format resolver: source URL -> ordered list of selectable stream variants.
//!
//! The extraction itself is delegated to an [`ExtractionBackend`]
//! (yt-dlp in production). The resolver validates the URL, normalizes the
//! backend's raw variants, orders and de-duplicates them, and caches the
//! result per URL for a short TTL.

use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use url::Url;

use crate::core::config;
use crate::core::error::AppError;
use crate::core::process::{is_spawn_failure, run_with_timeout};
use crate::download::error::ResolutionError;
use crate::download::model::{FormatKind, FormatOption};
use crate::download::ytdlp_errors::to_resolution_error;

/// A stream variant as reported by the backend (yt-dlp `formats[]` entry).
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RawFormat {
    pub format_id: String,
    pub ext: String,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub tbr: Option<f64>,
    pub abr: Option<f64>,
    pub vbr: Option<f64>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
    pub url: Option<String>,
    pub protocol: Option<String>,
    pub format_note: Option<String>,
    pub has_drm: Option<bool>,
    pub http_headers: HashMap<String, String>,
}

/// Backend view of one media page (yt-dlp `-J` output).
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RawMedia {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    pub is_live: Option<bool>,
    pub formats: Vec<RawFormat>,
}

/// Queries a source for its raw stream variants.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, url: &Url) -> Result<RawMedia, ResolutionError>;
}

/// Production backend: `yt-dlp -J --no-playlist <url>`.
pub struct YtDlpBackend {
    bin: String,
    timeout: Duration,
}

impl Default for YtDlpBackend {
    fn default() -> Self {
        Self::new(config::YTDL_BIN.as_str(), config::download::ytdlp_timeout())
    }
}

impl YtDlpBackend {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ExtractionBackend for YtDlpBackend {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn extract(&self, url: &Url) -> Result<RawMedia, ResolutionError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(["-J", "--no-playlist", "--no-warnings", "--no-progress"])
            .arg(url.as_str());

        log::debug!("Running {} -J for {}", self.bin, url);
        let output = match run_with_timeout(&mut cmd, self.timeout).await {
            Ok(output) => output,
            Err(AppError::Timeout(secs)) => return Err(ResolutionError::Timeout(secs)),
            Err(AppError::Io(e)) if is_spawn_failure(&e) => {
                log::error!("{} cannot be started: {}", self.bin, e);
                return Err(ResolutionError::Backend(format!("{} is not available", self.bin)));
            }
            Err(e) => return Err(ResolutionError::Backend(e.to_string())),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::warn!("yt-dlp failed for {}: {}", url, stderr.trim());
            return Err(to_resolution_error(&stderr));
        }

        serde_json::from_slice::<RawMedia>(&output.stdout)
            .map_err(|e| ResolutionError::Backend(format!("unparsable yt-dlp output: {}", e)))
    }
}

/// Normalized result of one resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMedia {
    pub url: Url,
    pub title: String,
    pub uploader: Option<String>,
    pub duration_secs: Option<f64>,
    /// Video variants (highest resolution first), then audio-only variants
    pub formats: Vec<FormatOption>,
}

impl ResolvedMedia {
    pub fn video_options(&self) -> impl Iterator<Item = &FormatOption> {
        self.formats.iter().filter(|f| f.kind.has_video())
    }

    pub fn audio_options(&self) -> impl Iterator<Item = &FormatOption> {
        self.formats.iter().filter(|f| f.kind == FormatKind::AudioOnly)
    }

    pub fn find(&self, format_id: &str) -> Option<&FormatOption> {
        self.formats.iter().find(|f| f.id == format_id)
    }
}

/// Validates a user-supplied URL before any remote call.
pub fn validate_url(raw: &str) -> Result<Url, ResolutionError> {
    let raw = raw.trim();
    if raw.len() > config::validation::MAX_URL_LENGTH {
        return Err(ResolutionError::InvalidUrl(format!(
            "URL is longer than {} characters",
            config::validation::MAX_URL_LENGTH
        )));
    }
    let url = Url::parse(raw).map_err(|e| ResolutionError::InvalidUrl(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ResolutionError::InvalidUrl(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ResolutionError::InvalidUrl("URL has no host".to_string()));
    }
    Ok(url)
}

/// Protocols the fetcher can stream with a single HTTP GET.
fn is_direct_protocol(protocol: Option<&str>) -> bool {
    matches!(protocol, None | Some("http") | Some("https"))
}

fn codec_of(raw: Option<&str>) -> Option<String> {
    match raw {
        None | Some("none") | Some("") => None,
        Some(codec) => Some(codec.to_string()),
    }
}

const AUDIO_CONTAINERS: &[&str] = &["m4a", "mp3", "opus", "ogg", "oga", "aac", "wav", "flac"];

/// Kind of a raw variant; `None` when it carries neither video nor audio.
fn classify(raw: &RawFormat) -> Option<FormatKind> {
    let vcodec = raw.vcodec.as_deref();
    let acodec = raw.acodec.as_deref();
    match (vcodec, acodec) {
        (Some("none"), Some("none")) => None,
        (Some("none"), _) => Some(FormatKind::AudioOnly),
        (_, Some("none")) => Some(FormatKind::VideoOnly),
        // Generic extractors often omit codecs; fall back to the extension.
        (None, None) if AUDIO_CONTAINERS.contains(&raw.ext.as_str()) => Some(FormatKind::AudioOnly),
        _ => Some(FormatKind::VideoAudio),
    }
}

/// Converts one raw variant, or `None` if it can't be downloaded directly.
fn normalize_format(raw: &RawFormat, duration: Option<f64>) -> Option<FormatOption> {
    let url = raw.url.as_deref().filter(|u| !u.is_empty())?;
    if raw.has_drm == Some(true) || !is_direct_protocol(raw.protocol.as_deref()) {
        return None;
    }
    if raw.ext == "mhtml" || raw.format_note.as_deref().is_some_and(|n| n.contains("storyboard")) {
        return None;
    }
    let kind = classify(raw)?;

    let bitrate_kbps = match kind {
        FormatKind::AudioOnly => raw.abr.or(raw.tbr),
        _ => raw.tbr.or_else(|| match (raw.vbr, raw.abr) {
            (Some(v), Some(a)) => Some(v + a),
            (v, a) => v.or(a),
        }),
    };
    let estimated_size = raw.filesize.or(raw.filesize_approx).or_else(|| {
        match (bitrate_kbps, duration) {
            (Some(kbps), Some(secs)) if kbps > 0.0 && secs > 0.0 => Some((kbps * 1000.0 / 8.0 * secs) as u64),
            _ => None,
        }
    });

    let mut http_headers: Vec<(String, String)> =
        raw.http_headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    http_headers.sort();

    Some(FormatOption {
        id: raw.format_id.clone(),
        kind,
        container: raw.ext.to_ascii_lowercase(),
        video_codec: if kind.has_video() { codec_of(raw.vcodec.as_deref()) } else { None },
        audio_codec: if kind.has_audio() { codec_of(raw.acodec.as_deref()) } else { None },
        width: raw.width,
        height: raw.height,
        bitrate_kbps,
        estimated_size,
        duration_secs: duration,
        url: url.to_string(),
        http_headers,
    })
}

/// Orders and de-duplicates normalized variants.
///
/// Video: resolution desc, then bitrate desc, muxed before video-only on
/// ties. Audio-only variants follow, by bitrate desc.
pub fn order_formats(mut formats: Vec<FormatOption>) -> Vec<FormatOption> {
    let bitrate = |f: &FormatOption| f.bitrate_kbps.unwrap_or(0.0);
    formats.sort_by(|a, b| {
        let a_audio = a.kind == FormatKind::AudioOnly;
        let b_audio = b.kind == FormatKind::AudioOnly;
        a_audio
            .cmp(&b_audio)
            .then_with(|| b.pixel_height().cmp(&a.pixel_height()))
            .then_with(|| bitrate(b).total_cmp(&bitrate(a)))
            .then_with(|| (a.kind == FormatKind::VideoOnly).cmp(&(b.kind == FormatKind::VideoOnly)))
    });

    let mut seen = HashSet::new();
    formats.retain(|f| seen.insert(f.dedup_key()));
    formats
}

/// Turns backend output into a `ResolvedMedia`.
pub fn normalize(url: Url, raw: RawMedia) -> Result<ResolvedMedia, ResolutionError> {
    if raw.is_live == Some(true) {
        return Err(ResolutionError::Unsupported("live broadcast".to_string()));
    }
    if raw.formats.is_empty() {
        return Err(ResolutionError::NotFound(url.to_string()));
    }

    let formats: Vec<FormatOption> = raw
        .formats
        .iter()
        .filter_map(|f| normalize_format(f, raw.duration))
        .collect();
    if formats.is_empty() {
        return Err(ResolutionError::Unsupported(
            "only DRM-protected or segmented streams are offered".to_string(),
        ));
    }

    Ok(ResolvedMedia {
        title: raw.title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| "media".to_string()),
        uploader: raw.uploader,
        duration_secs: raw.duration,
        formats: order_formats(formats),
        url,
    })
}

/// Resolves URLs through a backend, caching results per URL.
pub struct FormatResolver {
    backend: Arc<dyn ExtractionBackend>,
    cache: Cache<String, Arc<ResolvedMedia>>,
}

impl FormatResolver {
    pub fn new(backend: Arc<dyn ExtractionBackend>) -> Self {
        Self::with_ttl(backend, config::cache::format_ttl())
    }

    pub fn with_ttl(backend: Arc<dyn ExtractionBackend>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(config::cache::FORMAT_CACHE_CAPACITY)
            .time_to_live(ttl)
            .build();
        Self { backend, cache }
    }

    /// Resolves `raw_url` into its ordered format list.
    pub async fn resolve(&self, raw_url: &str) -> Result<Arc<ResolvedMedia>, ResolutionError> {
        let url = validate_url(raw_url)?;
        let key = url.as_str().to_string();

        if let Some(hit) = self.cache.get(&key).await {
            log::debug!("Format cache hit for {}", key);
            return Ok(hit);
        }

        let raw = self.backend.extract(&url).await?;
        let resolved = Arc::new(normalize(url, raw)?);
        log::info!(
            "Resolved {} via {}: {} format(s), title={:?}",
            key,
            self.backend.name(),
            resolved.formats.len(),
            resolved.title
        );
        self.cache.insert(key, Arc::clone(&resolved)).await;
        Ok(resolved)
    }

    /// Drops a cached entry (e.g. after stream URLs expired).
    pub async fn invalidate(&self, raw_url: &str) {
        if let Ok(url) = validate_url(raw_url) {
            self.cache.invalidate(url.as_str()).await;
        }
    }
}
