//! Clients for the external analysis services.
//!
//! Transcription, embedding extraction / speaker verification and liveness
//! classification each sit behind a trait with an HTTP implementation and a
//! configurable mock.

pub mod embedding;
#[cfg(feature = "http")]
pub mod http;
pub mod liveness;
pub mod transcript;
#[cfg(feature = "http")]
pub mod voiceprints;

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use embedding::{EmbeddingClient, MockEmbeddingClient, SpeakerMatch};
pub use liveness::{LivenessClient, LivenessLabel, LivenessResult, MockLivenessClient};
pub use transcript::{MockTranscriptClient, TranscriptClient, TranscriptResult};

/// Which downstream call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Transcript,
    Embedding,
    SpeakerVerification,
    Liveness,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Service::Transcript => "transcript service",
            Service::Embedding => "embedding service",
            Service::SpeakerVerification => "speaker verification service",
            Service::Liveness => "liveness service",
        };
        f.write_str(name)
    }
}

/// Failure of a single analysis call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("{service} unreachable: {message}")]
    Transport { service: Service, message: String },

    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: Service,
        status: u16,
        body: String,
    },

    #[error("{service} rejected the request: {message}")]
    Rejected { service: Service, message: String },

    #[error("{service} sent a malformed response: {message}")]
    Malformed { service: Service, message: String },

    #[error("{service} timed out after {after_ms}ms")]
    Timeout { service: Service, after_ms: u64 },
}

impl ServiceError {
    pub fn service(&self) -> Service {
        match self {
            ServiceError::Transport { service, .. }
            | ServiceError::Status { service, .. }
            | ServiceError::Rejected { service, .. }
            | ServiceError::Malformed { service, .. }
            | ServiceError::Timeout { service, .. } => *service,
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Bound a service call; expiry becomes [`ServiceError::Timeout`].
pub async fn with_timeout<T, F>(service: Service, limit: Duration, call: F) -> ServiceResult<T>
where
    F: Future<Output = ServiceResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout {
            service,
            after_ms: limit.as_millis() as u64,
        }),
    }
}
