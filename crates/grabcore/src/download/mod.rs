//! Download pipeline: format resolution, admission, fetching, job
//! lifecycle and delivery.

pub mod admission;
pub mod delivery;
pub mod error;
pub mod fetcher;
pub mod job;
pub mod model;
pub mod progress;
pub mod queue;
pub mod resolver;
pub mod selection;
pub mod session;
pub mod source;
pub mod workspace;
pub mod ytdlp_errors;

pub use delivery::{ChatTransport, DeliveryAdapter, TransportError};
pub use error::{DeliveryError, FetchError, JobFailure, ResolutionError, SubmitError};
pub use job::{JobHandle, JobReport, JobState};
pub use model::{
    ArtifactKind, AudioCodec, DeliveredArtifact, FormatKind, FormatOption, JobId, Request, RequestId, SessionId,
    TargetKind, UserId,
};
pub use progress::{ProgressStage, ProgressUpdate};
pub use queue::{Collaborators, JobQueue};
pub use resolver::{ExtractionBackend, FormatResolver, ResolvedMedia, YtDlpBackend};
pub use selection::Selection;
pub use source::{ByteStream, HttpStreamSource, StreamSource};
