//! One voice verification attempt.
//!
//! A single recording of the challenge phrase is sent to three independent
//! checks at once: transcript match, speaker match and liveness. The attempt
//! passes only when all three pass. A check whose service fails or times out
//! counts as failed, and the failure is recorded on the verdict.

use crate::audio::microphone::{CaptureControl, Microphone};
use crate::audio::sample::AudioSample;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::defaults;
use crate::error::{Result, ShieldError};
use crate::identity::AccountId;
use crate::phrase::ChallengePhrase;
use crate::services::{
    EmbeddingClient, LivenessClient, LivenessLabel, LivenessResult, Service, ServiceError,
    ServiceResult, SpeakerMatch, TranscriptClient, TranscriptResult, with_timeout,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// The three analysis services a verification attempt consults.
#[derive(Clone)]
pub struct Analyzers {
    pub transcripts: Arc<dyn TranscriptClient>,
    pub embeddings: Arc<dyn EmbeddingClient>,
    pub liveness: Arc<dyn LivenessClient>,
}

/// Recording length and per-call timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationPolicy {
    pub recording: Duration,
    pub service_timeout: Duration,
}

impl VerificationPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            recording: config.audio.recording_duration(),
            service_timeout: config.service_timeout(),
        }
    }
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        let recording = Duration::from_secs(defaults::RECORDING_SECS);
        Self {
            recording,
            service_timeout: recording * defaults::SERVICE_TIMEOUT_FACTOR as u32,
        }
    }
}

/// A check that could not be carried out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckFailure {
    pub service: Service,
    pub message: String,
}

/// Combined result of one attempt. Built only by [`VerificationFlow`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationVerdict {
    account_id: AccountId,
    phrase: String,
    transcript: Option<String>,
    transcript_match: bool,
    speaker_confirmed: bool,
    similarity: f32,
    liveness_label: LivenessLabel,
    liveness_confidence: f32,
    passed: bool,
    failures: Vec<CheckFailure>,
    resolved_at: DateTime<Utc>,
}

/// Strict conjunction of the three checks.
pub fn fuse(transcript_match: bool, speaker_confirmed: bool, liveness: LivenessLabel) -> bool {
    transcript_match && speaker_confirmed && liveness == LivenessLabel::Genuine
}

impl VerificationVerdict {
    fn from_outcomes(
        account_id: AccountId,
        phrase: String,
        transcript: ServiceResult<TranscriptResult>,
        speaker: ServiceResult<SpeakerMatch>,
        liveness: ServiceResult<LivenessResult>,
        resolved_at: DateTime<Utc>,
    ) -> Self {
        let mut failures = Vec::new();
        let mut record = |error: ServiceError| {
            failures.push(CheckFailure {
                service: error.service(),
                message: error.to_string(),
            });
        };

        let (transcript, transcript_match) = match transcript {
            Ok(result) => (Some(result.text), result.confirmed),
            Err(e) => {
                record(e);
                (None, false)
            }
        };
        let (speaker_confirmed, similarity) = match speaker {
            Ok(result) => (result.confirmed, result.similarity),
            Err(e) => {
                record(e);
                (false, 0.0)
            }
        };
        let (liveness_label, liveness_confidence) = match liveness {
            Ok(result) => (result.label, result.confidence),
            Err(e) => {
                record(e);
                (LivenessLabel::Spoof, 0.0)
            }
        };

        Self {
            account_id,
            phrase,
            transcript,
            transcript_match,
            speaker_confirmed,
            similarity,
            liveness_label,
            liveness_confidence,
            passed: fuse(transcript_match, speaker_confirmed, liveness_label),
            failures,
            resolved_at,
        }
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// The challenge phrase that was asked for.
    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    /// What the transcription service heard, if it answered.
    pub fn transcript(&self) -> Option<&str> {
        self.transcript.as_deref()
    }

    pub fn transcript_match(&self) -> bool {
        self.transcript_match
    }

    pub fn speaker_confirmed(&self) -> bool {
        self.speaker_confirmed
    }

    pub fn similarity(&self) -> f32 {
        self.similarity
    }

    pub fn liveness_label(&self) -> LivenessLabel {
        self.liveness_label
    }

    pub fn liveness_confidence(&self) -> f32 {
        self.liveness_confidence
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn failures(&self) -> &[CheckFailure] {
        &self.failures
    }

    pub fn resolved_at(&self) -> DateTime<Utc> {
        self.resolved_at
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationPhase {
    Idle,
    Capturing,
    Analyzing,
    Resolved(VerificationVerdict),
}

/// One verification attempt. Create a fresh flow for every attempt: a
/// resolved flow refuses to run again.
pub struct VerificationFlow {
    microphone: Microphone,
    analyzers: Analyzers,
    policy: VerificationPolicy,
    clock: Arc<dyn Clock>,
    phase: watch::Sender<VerificationPhase>,
    capture: Mutex<Option<CaptureControl>>,
}

/// Resets an unresolved attempt to `Idle` when it ends or is dropped.
struct AttemptGuard<'a> {
    phase: &'a watch::Sender<VerificationPhase>,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.phase.send_if_modified(|phase| {
            if matches!(phase, VerificationPhase::Resolved(_)) {
                false
            } else {
                *phase = VerificationPhase::Idle;
                true
            }
        });
    }
}

impl VerificationFlow {
    pub fn new(microphone: Microphone, analyzers: Analyzers, policy: VerificationPolicy) -> Self {
        let (phase, _) = watch::channel(VerificationPhase::Idle);
        Self {
            microphone,
            analyzers,
            policy,
            clock: Arc::new(SystemClock),
            phase,
            capture: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn phase(&self) -> VerificationPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<VerificationPhase> {
        self.phase.subscribe()
    }

    /// End the recording early and analyze what was captured so far.
    pub fn stop_recording(&self) {
        if let Ok(capture) = self.capture.lock()
            && let Some(control) = capture.as_ref()
        {
            control.stop();
        }
    }

    /// Record `phrase` once and run all three checks on the recording.
    ///
    /// Audio input errors leave the flow `Idle` so the attempt can be
    /// recorded again. Cancelling `cancel` returns [`ShieldError::Aborted`]
    /// and discards any analysis still in flight.
    pub async fn run(
        &self,
        account: &AccountId,
        phrase: ChallengePhrase,
        cancel: CancellationToken,
    ) -> Result<VerificationVerdict> {
        let mut refusal = None;
        self.phase.send_if_modified(|phase| match phase {
            VerificationPhase::Idle => {
                *phase = VerificationPhase::Capturing;
                true
            }
            VerificationPhase::Resolved(_) => {
                refusal = Some(ShieldError::VerificationResolved);
                false
            }
            _ => {
                refusal = Some(ShieldError::VerificationInProgress);
                false
            }
        });
        if let Some(error) = refusal {
            return Err(error);
        }
        let _guard = AttemptGuard { phase: &self.phase };

        let control = CaptureControl::new(cancel.clone());
        self.set_capture(Some(control.clone()));
        let recorded = self.microphone.record(self.policy.recording, &control).await;
        self.set_capture(None);
        let sample = recorded?;

        self.phase.send_replace(VerificationPhase::Analyzing);
        let expected = phrase.text();
        let (transcript, speaker, liveness) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(account = %account, "verification aborted during analysis");
                return Err(ShieldError::Aborted);
            }
            outcomes = self.analyze(sample, account, &expected) => outcomes,
        };

        let verdict = VerificationVerdict::from_outcomes(
            account.clone(),
            expected,
            transcript,
            speaker,
            liveness,
            self.clock.now(),
        );
        tracing::info!(
            account = %account,
            passed = verdict.passed,
            transcript_match = verdict.transcript_match,
            speaker_confirmed = verdict.speaker_confirmed,
            similarity = verdict.similarity,
            liveness = %verdict.liveness_label,
            failures = verdict.failures.len(),
            "verification resolved"
        );
        self.phase
            .send_replace(VerificationPhase::Resolved(verdict.clone()));
        Ok(verdict)
    }

    /// Dispatch the three checks concurrently and wait for all of them.
    ///
    /// Each check runs in its own task, so dropping this future leaves the
    /// requests to finish in the background with their results ignored.
    async fn analyze(
        &self,
        sample: AudioSample,
        account: &AccountId,
        expected: &str,
    ) -> (
        ServiceResult<TranscriptResult>,
        ServiceResult<SpeakerMatch>,
        ServiceResult<LivenessResult>,
    ) {
        let limit = self.policy.service_timeout;

        let transcript = {
            let client = self.analyzers.transcripts.clone();
            let sample = sample.clone();
            let expected = expected.to_string();
            tokio::spawn(async move {
                with_timeout(
                    Service::Transcript,
                    limit,
                    client.transcribe(&sample, &expected),
                )
                .await
            })
        };
        let speaker = {
            let client = self.analyzers.embeddings.clone();
            let sample = sample.clone();
            let account = account.clone();
            tokio::spawn(async move {
                with_timeout(
                    Service::SpeakerVerification,
                    limit,
                    client.verify(&sample, &account),
                )
                .await
            })
        };
        let liveness = {
            let client = self.analyzers.liveness.clone();
            tokio::spawn(async move {
                with_timeout(Service::Liveness, limit, client.classify(&sample)).await
            })
        };

        let (transcript, speaker, liveness) = tokio::join!(transcript, speaker, liveness);
        (
            joined(Service::Transcript, transcript),
            joined(Service::SpeakerVerification, speaker),
            joined(Service::Liveness, liveness),
        )
    }

    fn set_capture(&self, control: Option<CaptureControl>) {
        if let Ok(mut capture) = self.capture.lock() {
            *capture = control;
        }
    }
}

fn joined<T>(
    service: Service,
    result: std::result::Result<ServiceResult<T>, JoinError>,
) -> ServiceResult<T> {
    result.unwrap_or_else(|e| {
        Err(ServiceError::Transport {
            service,
            message: format!("analysis task failed: {}", e),
        })
    })
}

/// A verdict with every check either passed or failed, for decision tests.
#[cfg(test)]
pub(crate) fn test_verdict(
    account_id: AccountId,
    passed: bool,
    resolved_at: DateTime<Utc>,
) -> VerificationVerdict {
    VerificationVerdict::from_outcomes(
        account_id,
        "river candle".to_string(),
        Ok(TranscriptResult {
            text: "river candle".to_string(),
            confirmed: passed,
        }),
        Ok(SpeakerMatch {
            confirmed: passed,
            similarity: if passed { 0.9 } else { 0.2 },
        }),
        Ok(LivenessResult {
            label: LivenessLabel::Genuine,
            confidence: 0.97,
        }),
        resolved_at,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::recorder::MockAudioSource;
    use crate::phrase::PhraseGenerator;
    use crate::services::{MockEmbeddingClient, MockLivenessClient, MockTranscriptClient};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn phrase() -> ChallengePhrase {
        PhraseGenerator::with_rng(StdRng::seed_from_u64(5), 6).next_phrase()
    }

    fn analyzers(
        transcripts: MockTranscriptClient,
        embeddings: MockEmbeddingClient,
        liveness: MockLivenessClient,
    ) -> Analyzers {
        Analyzers {
            transcripts: Arc::new(transcripts),
            embeddings: Arc::new(embeddings),
            liveness: Arc::new(liveness),
        }
    }

    fn flow_with(source: &MockAudioSource, analyzers: Analyzers) -> VerificationFlow {
        VerificationFlow::new(
            Microphone::new(Box::new(source.clone())),
            analyzers,
            VerificationPolicy::default(),
        )
    }

    fn timeout(service: Service) -> ServiceError {
        ServiceError::Timeout {
            service,
            after_ms: 18000,
        }
    }

    #[test]
    fn test_fuse_requires_all_three() {
        for transcript in [false, true] {
            for speaker in [false, true] {
                for label in [LivenessLabel::Spoof, LivenessLabel::Genuine] {
                    let expected = transcript && speaker && label == LivenessLabel::Genuine;
                    assert_eq!(fuse(transcript, speaker, label), expected);
                }
            }
        }
    }

    #[test]
    fn test_failed_check_is_recorded() {
        let verdict = VerificationVerdict::from_outcomes(
            AccountId::new("uid-1"),
            "river candle".to_string(),
            Ok(TranscriptResult {
                text: "river candle".to_string(),
                confirmed: true,
            }),
            Ok(SpeakerMatch {
                confirmed: true,
                similarity: 0.91,
            }),
            Err(timeout(Service::Liveness)),
            Utc::now(),
        );

        assert!(!verdict.passed());
        assert_eq!(verdict.liveness_label(), LivenessLabel::Spoof);
        assert_eq!(verdict.liveness_confidence(), 0.0);
        assert_eq!(verdict.failures().len(), 1);
        assert_eq!(verdict.failures()[0].service, Service::Liveness);
        assert_eq!(
            verdict.failures()[0].message,
            "liveness service timed out after 18000ms"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_checks_pass() {
        let transcripts = MockTranscriptClient::new();
        let embeddings = MockEmbeddingClient::new();
        let liveness = MockLivenessClient::new();
        let flow = flow_with(
            &MockAudioSource::new(),
            analyzers(transcripts.clone(), embeddings.clone(), liveness.clone()),
        );

        let verdict = flow
            .run(&AccountId::new("uid-1"), phrase(), CancellationToken::new())
            .await
            .unwrap();

        assert!(verdict.passed());
        assert!(verdict.failures().is_empty());
        assert_eq!(transcripts.calls(), 1);
        assert_eq!(embeddings.verify_calls(), 1);
        assert_eq!(liveness.calls(), 1);
        assert!(matches!(flow.phase(), VerificationPhase::Resolved(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spoof_fails_even_with_perfect_match() {
        let flow = flow_with(
            &MockAudioSource::new(),
            analyzers(
                MockTranscriptClient::new(),
                MockEmbeddingClient::new().with_speaker_match(true, 0.99),
                MockLivenessClient::new().spoof(),
            ),
        );

        let verdict = flow
            .run(&AccountId::new("uid-1"), phrase(), CancellationToken::new())
            .await
            .unwrap();

        assert!(!verdict.passed());
        assert!(verdict.transcript_match());
        assert!(verdict.speaker_confirmed());
        assert_eq!(verdict.liveness_label(), LivenessLabel::Spoof);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checks_run_concurrently() {
        let delay = Duration::from_secs(4);
        let flow = flow_with(
            &MockAudioSource::new(),
            analyzers(
                MockTranscriptClient::new().with_delay(delay),
                MockEmbeddingClient::new().with_delay(delay),
                MockLivenessClient::new().with_delay(delay),
            ),
        );

        let started = tokio::time::Instant::now();
        flow.run(&AccountId::new("uid-1"), phrase(), CancellationToken::new())
            .await
            .unwrap();

        // 6s of recording plus one 4s delay, not three.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(14), "took {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_service_times_out_as_failed_check() {
        let flow = flow_with(
            &MockAudioSource::new(),
            analyzers(
                MockTranscriptClient::new(),
                MockEmbeddingClient::new(),
                MockLivenessClient::new().with_delay(Duration::from_secs(60)),
            ),
        );

        let verdict = flow
            .run(&AccountId::new("uid-1"), phrase(), CancellationToken::new())
            .await
            .unwrap();

        assert!(!verdict.passed());
        assert_eq!(
            verdict.failures(),
            &[CheckFailure {
                service: Service::Liveness,
                message: "liveness service timed out after 18000ms".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_words_fail_transcript_check() {
        let flow = flow_with(
            &MockAudioSource::new(),
            analyzers(
                MockTranscriptClient::new().with_transcript("something else entirely"),
                MockEmbeddingClient::new(),
                MockLivenessClient::new(),
            ),
        );

        let verdict = flow
            .run(&AccountId::new("uid-1"), phrase(), CancellationToken::new())
            .await
            .unwrap();

        assert!(!verdict.transcript_match());
        assert_eq!(verdict.transcript(), Some("something else entirely"));
        assert!(!verdict.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_flow_refuses_second_run() {
        let flow = flow_with(
            &MockAudioSource::new(),
            analyzers(
                MockTranscriptClient::new(),
                MockEmbeddingClient::new(),
                MockLivenessClient::new(),
            ),
        );
        let account = AccountId::new("uid-1");

        flow.run(&account, phrase(), CancellationToken::new())
            .await
            .unwrap();
        let again = flow.run(&account, phrase(), CancellationToken::new()).await;
        assert!(matches!(again, Err(ShieldError::VerificationResolved)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_run_is_rejected() {
        let flow = Arc::new(flow_with(
            &MockAudioSource::new(),
            analyzers(
                MockTranscriptClient::new(),
                MockEmbeddingClient::new(),
                MockLivenessClient::new(),
            ),
        ));

        let first = {
            let flow = flow.clone();
            tokio::spawn(async move {
                flow.run(&AccountId::new("uid-1"), phrase(), CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = flow
            .run(&AccountId::new("uid-1"), phrase(), CancellationToken::new())
            .await;
        assert!(matches!(second, Err(ShieldError::VerificationInProgress)));
        assert!(first.await.unwrap().unwrap().passed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_recording_leaves_flow_reusable() {
        let source = MockAudioSource::new().silent();
        let flow = flow_with(
            &source,
            analyzers(
                MockTranscriptClient::new(),
                MockEmbeddingClient::new(),
                MockLivenessClient::new(),
            ),
        );

        let result = flow
            .run(&AccountId::new("uid-1"), phrase(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ShieldError::EmptyAudio)));
        assert_eq!(flow.phase(), VerificationPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_analysis_returns_aborted() {
        let transcripts = MockTranscriptClient::new().with_delay(Duration::from_secs(10));
        let flow = flow_with(
            &MockAudioSource::new(),
            analyzers(
                transcripts,
                MockEmbeddingClient::new(),
                MockLivenessClient::new(),
            ),
        );
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(8)).await;
            canceller.cancel();
        });

        let result = flow.run(&AccountId::new("uid-1"), phrase(), cancel).await;
        assert!(matches!(result, Err(ShieldError::Aborted)));
        assert_eq!(flow.phase(), VerificationPhase::Idle);
    }

    #[test]
    fn test_verdict_serializes_for_display() {
        let verdict = VerificationVerdict::from_outcomes(
            AccountId::new("uid-1"),
            "river candle".to_string(),
            Ok(TranscriptResult {
                text: "river candle".to_string(),
                confirmed: true,
            }),
            Err(timeout(Service::SpeakerVerification)),
            Ok(LivenessResult {
                label: LivenessLabel::Genuine,
                confidence: 0.97,
            }),
            Utc::now(),
        );

        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["passed"], false);
        assert_eq!(json["liveness_label"], "genuine");
        assert_eq!(json["failures"][0]["service"], "speaker_verification");
    }
}
