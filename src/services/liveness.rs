//! Liveness (deepfake) classification of a recording.

use crate::audio::sample::AudioSample;
use crate::services::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Classifier verdict on whether the audio came from a live speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessLabel {
    #[serde(alias = "bonafide", alias = "bona-fide")]
    Genuine,
    Spoof,
}

impl fmt::Display for LivenessLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LivenessLabel::Genuine => f.write_str("genuine"),
            LivenessLabel::Spoof => f.write_str("spoof"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessResult {
    pub label: LivenessLabel,
    pub confidence: f32,
}

impl LivenessResult {
    pub fn is_genuine(&self) -> bool {
        self.label == LivenessLabel::Genuine
    }
}

/// Trait for the liveness classifier.
#[async_trait::async_trait]
pub trait LivenessClient: Send + Sync {
    async fn classify(&self, sample: &AudioSample) -> ServiceResult<LivenessResult>;
}

#[cfg(feature = "http")]
mod http_impl {
    use super::*;
    use crate::services::Service;
    use crate::services::http::ServiceClient;

    #[derive(Debug, Deserialize)]
    struct PredictResponse {
        prediction: LivenessLabel,
        confidence: f32,
    }

    #[async_trait::async_trait]
    impl LivenessClient for ServiceClient {
        async fn classify(&self, sample: &AudioSample) -> ServiceResult<LivenessResult> {
            let response: PredictResponse = self
                .upload(
                    Service::Liveness,
                    &self.liveness_path,
                    sample,
                    &[],
                    Vec::new(),
                )
                .await?;
            if !(0.0..=1.0).contains(&response.confidence) {
                return Err(ServiceError::Malformed {
                    service: Service::Liveness,
                    message: format!("confidence {} outside [0, 1]", response.confidence),
                });
            }
            Ok(LivenessResult {
                label: response.prediction,
                confidence: response.confidence,
            })
        }
    }
}

/// Mock liveness classifier for testing
#[derive(Debug, Clone)]
pub struct MockLivenessClient {
    result: ServiceResult<LivenessResult>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl MockLivenessClient {
    /// Create a mock that classifies everything as genuine
    pub fn new() -> Self {
        Self {
            result: Ok(LivenessResult {
                label: LivenessLabel::Genuine,
                confidence: 0.97,
            }),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_label(mut self, label: LivenessLabel, confidence: f32) -> Self {
        self.result = Ok(LivenessResult { label, confidence });
        self
    }

    /// Classify everything as synthetic
    pub fn spoof(self) -> Self {
        self.with_label(LivenessLabel::Spoof, 0.93)
    }

    /// Configure the mock to fail
    pub fn with_error(mut self, error: ServiceError) -> Self {
        self.result = Err(error);
        self
    }

    /// Delay every response
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockLivenessClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LivenessClient for MockLivenessClient {
    async fn classify(&self, _sample: &AudioSample) -> ServiceResult<LivenessResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone()
    }
}
