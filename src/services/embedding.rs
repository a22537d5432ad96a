//! Speaker embedding extraction and comparison against an enrolled voiceprint.

use crate::audio::sample::AudioSample;
use crate::identity::AccountId;
use crate::services::{Service, ServiceError, ServiceResult};
use crate::voiceprint::EmbeddingVector;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Result of comparing a sample against the stored voiceprint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeakerMatch {
    pub confirmed: bool,
    pub similarity: f32,
}

/// Trait for the embedding service.
#[async_trait::async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Produce a speaker embedding for `sample`.
    ///
    /// Fails when the service cannot produce a vector at all, which is
    /// distinct from a comparison that simply does not match.
    async fn extract(&self, sample: &AudioSample) -> ServiceResult<EmbeddingVector>;

    /// Compare `sample` against the voiceprint enrolled for `account`.
    async fn verify(&self, sample: &AudioSample, account: &AccountId)
    -> ServiceResult<SpeakerMatch>;
}

/// Reject empty or non-finite vectors before anyone averages them.
pub fn validate_embedding(values: Vec<f32>) -> ServiceResult<EmbeddingVector> {
    if values.is_empty() {
        return Err(ServiceError::Malformed {
            service: Service::Embedding,
            message: "empty embedding".to_string(),
        });
    }
    if let Some(index) = values.iter().position(|v| !v.is_finite()) {
        return Err(ServiceError::Malformed {
            service: Service::Embedding,
            message: format!("non-finite value at index {}", index),
        });
    }
    Ok(EmbeddingVector::new(values))
}

#[cfg(feature = "http")]
mod http_impl {
    use super::*;
    use crate::services::http::ServiceClient;

    #[derive(Debug, Deserialize)]
    struct ExtractResponse {
        embedding: Vec<f32>,
    }

    #[derive(Debug, Deserialize)]
    struct VerifyResponse {
        similarity: f32,
        confirmed: bool,
    }

    #[async_trait::async_trait]
    impl EmbeddingClient for ServiceClient {
        async fn extract(&self, sample: &AudioSample) -> ServiceResult<EmbeddingVector> {
            let response: ExtractResponse = self
                .upload(
                    Service::Embedding,
                    &self.extract_path,
                    sample,
                    &[],
                    Vec::new(),
                )
                .await?;
            validate_embedding(response.embedding)
        }

        async fn verify(
            &self,
            sample: &AudioSample,
            account: &AccountId,
        ) -> ServiceResult<SpeakerMatch> {
            let response: VerifyResponse = self
                .upload(
                    Service::SpeakerVerification,
                    &self.verify_path,
                    sample,
                    &[],
                    vec![("uid", account.to_string())],
                )
                .await?;
            if !response.similarity.is_finite() {
                return Err(ServiceError::Malformed {
                    service: Service::SpeakerVerification,
                    message: "non-finite similarity".to_string(),
                });
            }
            Ok(SpeakerMatch {
                confirmed: response.confirmed,
                similarity: response.similarity,
            })
        }
    }
}

/// Mock embedding client for testing
///
/// `extract` pops queued results first and then repeats the default vector.
#[derive(Debug, Clone)]
pub struct MockEmbeddingClient {
    queued: Arc<Mutex<VecDeque<ServiceResult<Vec<f32>>>>>,
    default_embedding: Vec<f32>,
    speaker: ServiceResult<SpeakerMatch>,
    delay: Option<Duration>,
    extract_calls: Arc<AtomicUsize>,
    verify_calls: Arc<AtomicUsize>,
}

impl MockEmbeddingClient {
    /// Create a mock returning a 4-dimensional vector and a confirmed match
    pub fn new() -> Self {
        Self {
            queued: Arc::new(Mutex::new(VecDeque::new())),
            default_embedding: vec![0.25; 4],
            speaker: Ok(SpeakerMatch {
                confirmed: true,
                similarity: 0.87,
            }),
            delay: None,
            extract_calls: Arc::new(AtomicUsize::new(0)),
            verify_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue vectors returned by successive `extract` calls
    pub fn with_embeddings(self, embeddings: Vec<Vec<f32>>) -> Self {
        self.with_extract_results(embeddings.into_iter().map(Ok).collect())
    }

    /// Queue raw results (including failures) for successive `extract` calls
    pub fn with_extract_results(self, results: Vec<ServiceResult<Vec<f32>>>) -> Self {
        if let Ok(mut queued) = self.queued.lock() {
            queued.extend(results);
        }
        self
    }

    /// Vector returned once the queue is empty
    pub fn with_default_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.default_embedding = embedding;
        self
    }

    /// Configure the speaker comparison result
    pub fn with_speaker_match(mut self, confirmed: bool, similarity: f32) -> Self {
        self.speaker = Ok(SpeakerMatch {
            confirmed,
            similarity,
        });
        self
    }

    /// Configure the speaker comparison to fail
    pub fn with_verify_error(mut self, error: ServiceError) -> Self {
        self.speaker = Err(error);
        self
    }

    /// Delay every response
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn extract_calls(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockEmbeddingClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EmbeddingClient for MockEmbeddingClient {
    async fn extract(&self, _sample: &AudioSample) -> ServiceResult<EmbeddingVector> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .queued
            .lock()
            .ok()
            .and_then(|mut queued| queued.pop_front());
        match next {
            Some(result) => validate_embedding(result?),
            None => validate_embedding(self.default_embedding.clone()),
        }
    }

    async fn verify(
        &self,
        _sample: &AudioSample,
        _account: &AccountId,
    ) -> ServiceResult<SpeakerMatch> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.speaker.clone()
    }
}
