//! Delivery adapter: hands the finished artifact to the chat transport.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::core::metrics;
use crate::core::utils::format_bytes;
use crate::download::error::DeliveryError;
use crate::download::job::JobReport;
use crate::download::model::{DeliveredArtifact, SessionId};
use crate::download::progress::ProgressUpdate;

/// The chat platform refused or failed a request.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Outbound side of the chat platform.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Shows job progress in the session.
    async fn send_progress(&self, session: SessionId, update: &ProgressUpdate) -> Result<(), TransportError>;

    /// Uploads the artifact. The file must not be modified by the transport.
    async fn send_artifact(&self, session: SessionId, artifact: &DeliveredArtifact) -> Result<(), TransportError>;

    /// Plain text message.
    async fn send_text(&self, session: SessionId, text: &str) -> Result<(), TransportError>;

    /// Final outcome of a job. Called exactly once per job.
    async fn send_report(&self, session: SessionId, report: &JobReport) -> Result<(), TransportError> {
        self.send_text(session, &report.message).await
    }
}

pub struct DeliveryAdapter {
    transport: Arc<dyn ChatTransport>,
    max_size: u64,
    retry_delay: Duration,
}

impl DeliveryAdapter {
    pub fn new(transport: Arc<dyn ChatTransport>, max_size: u64, retry_delay: Duration) -> Self {
        Self {
            transport,
            max_size,
            retry_delay,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Sends `artifact` to `session`.
    ///
    /// The size limit is checked before any transfer. A failed upload is
    /// retried once after `retry_delay`. The local file is deleted on every
    /// outcome.
    pub async fn deliver(&self, artifact: &DeliveredArtifact, session: SessionId) -> Result<(), DeliveryError> {
        let started = Instant::now();
        let result = self.try_deliver(artifact, session).await;
        remove_artifact(artifact).await;
        metrics::record_stage_duration("deliver", started.elapsed().as_secs_f64());
        result
    }

    async fn try_deliver(&self, artifact: &DeliveredArtifact, session: SessionId) -> Result<(), DeliveryError> {
        let size = fs_err::tokio::metadata(&artifact.path)
            .await
            .map_err(|e| DeliveryError::Io(e.to_string()))?
            .len();
        if size > self.max_size {
            log::warn!(
                "Artifact {} is {} (limit {}), not sending",
                artifact.path.display(),
                format_bytes(size),
                format_bytes(self.max_size)
            );
            return Err(DeliveryError::SizeExceeded {
                size,
                limit: self.max_size,
            });
        }

        match self.transport.send_artifact(session, artifact).await {
            Ok(()) => {
                log::info!("Delivered {} ({}) to session {}", artifact.path.display(), format_bytes(size), session);
                return Ok(());
            }
            Err(e) => log::warn!(
                "Delivery to session {} failed: {}. Retrying in {:?}",
                session,
                e,
                self.retry_delay
            ),
        }

        tokio::time::sleep(self.retry_delay).await;
        match self.transport.send_artifact(session, artifact).await {
            Ok(()) => {
                log::info!("Delivered {} to session {} on retry", artifact.path.display(), session);
                Ok(())
            }
            Err(e) => {
                log::error!("Delivery to session {} failed again: {}", session, e);
                Err(DeliveryError::TransportRejected(e.0))
            }
        }
    }
}

async fn remove_artifact(artifact: &DeliveredArtifact) {
    match fs_err::tokio::remove_file(&artifact.path).await {
        Ok(()) => log::debug!("Removed artifact {}", artifact.path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove artifact {}: {}", artifact.path.display(), e),
    }
}
