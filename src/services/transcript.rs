//! Speech-to-text check of the spoken challenge phrase.

use crate::audio::sample::AudioSample;
use crate::services::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Recognised text and whether it contains the expected phrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub text: String,
    pub confirmed: bool,
}

/// Trait for the transcription service.
#[async_trait::async_trait]
pub trait TranscriptClient: Send + Sync {
    /// Transcribe `sample` and compare it against `expected_phrase`.
    async fn transcribe(
        &self,
        sample: &AudioSample,
        expected_phrase: &str,
    ) -> ServiceResult<TranscriptResult>;
}

/// Lower-case, drop punctuation and collapse whitespace.
pub fn normalize_phrase(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether the transcript contains the expected phrase after normalisation.
pub fn phrase_spoken(transcript: &str, expected_phrase: &str) -> bool {
    let expected = normalize_phrase(expected_phrase);
    if expected.is_empty() {
        return false;
    }
    normalize_phrase(transcript).contains(&expected)
}

#[cfg(feature = "http")]
mod http_impl {
    use super::*;
    use crate::services::Service;
    use crate::services::http::ServiceClient;

    #[derive(Debug, Deserialize)]
    struct ListenResponse {
        text: String,
        confirmed: Option<bool>,
    }

    #[async_trait::async_trait]
    impl TranscriptClient for ServiceClient {
        async fn transcribe(
            &self,
            sample: &AudioSample,
            expected_phrase: &str,
        ) -> ServiceResult<TranscriptResult> {
            let response: ListenResponse = self
                .upload(
                    Service::Transcript,
                    &self.transcribe_path,
                    sample,
                    &[("passphrase", expected_phrase)],
                    Vec::new(),
                )
                .await?;

            let confirmed = response
                .confirmed
                .unwrap_or_else(|| phrase_spoken(&response.text, expected_phrase));
            Ok(TranscriptResult {
                text: response.text,
                confirmed,
            })
        }
    }
}

/// Mock transcription client for testing
#[derive(Debug, Clone)]
pub struct MockTranscriptClient {
    text: String,
    confirmed: Option<bool>,
    error: Option<ServiceError>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl MockTranscriptClient {
    /// Create a mock that hears exactly the expected phrase
    pub fn new() -> Self {
        Self {
            text: String::new(),
            confirmed: Some(true),
            error: None,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Return this text and decide the match locally
    pub fn with_transcript(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self.confirmed = None;
        self
    }

    /// Force the match flag regardless of the text
    pub fn with_confirmed(mut self, confirmed: bool) -> Self {
        self.confirmed = Some(confirmed);
        self
    }

    /// Configure the mock to fail
    pub fn with_error(mut self, error: ServiceError) -> Self {
        self.error = Some(error);
        self
    }

    /// Delay every response
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of transcription calls received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockTranscriptClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TranscriptClient for MockTranscriptClient {
    async fn transcribe(
        &self,
        _sample: &AudioSample,
        expected_phrase: &str,
    ) -> ServiceResult<TranscriptResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.error {
            return Err(error.clone());
        }

        let text = if self.text.is_empty() {
            expected_phrase.to_string()
        } else {
            self.text.clone()
        };
        let confirmed = self
            .confirmed
            .unwrap_or_else(|| phrase_spoken(&text, expected_phrase));
        Ok(TranscriptResult { text, confirmed })
    }
}
