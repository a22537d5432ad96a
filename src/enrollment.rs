//! Three-round voice enrollment.
//!
//! Each round records one fixed prompt and turns it into an embedding. The
//! three embeddings are averaged into the account's voiceprint. Nothing is
//! persisted here; the caller stores the returned [`VoicePrint`] only after
//! the whole flow succeeds.

use crate::audio::microphone::{CaptureControl, Microphone};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::defaults;
use crate::error::{ErrorKind, Result, ShieldError};
use crate::identity::AccountId;
use crate::phrase::enrollment_prompt;
use crate::services::{EmbeddingClient, Service, with_timeout};
use crate::voiceprint::{self, EmbeddingVector, VoicePrint};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Timing and retry limits for one enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentPolicy {
    pub recording: Duration,
    pub attempts_per_round: u32,
    pub service_timeout: Duration,
}

impl EnrollmentPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            recording: config.audio.recording_duration(),
            attempts_per_round: config.enrollment.max_attempts_per_round,
            service_timeout: config.service_timeout(),
        }
    }
}

impl Default for EnrollmentPolicy {
    fn default() -> Self {
        let recording = Duration::from_secs(defaults::RECORDING_SECS);
        Self {
            recording,
            attempts_per_round: defaults::ENROLLMENT_ATTEMPTS_PER_ROUND,
            service_timeout: recording * defaults::SERVICE_TIMEOUT_FACTOR as u32,
        }
    }
}

/// Where an enrollment currently is. Rounds and attempts are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentPhase {
    Idle,
    Capturing {
        round: usize,
        attempt: u32,
        prompt: &'static str,
    },
    Analyzing {
        round: usize,
        attempt: u32,
    },
    /// The last attempt failed and the same round is being recorded again.
    Retrying {
        round: usize,
        attempt: u32,
        reason: String,
    },
    Completed,
    Failed {
        reason: String,
    },
}

impl EnrollmentPhase {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            EnrollmentPhase::Capturing { .. }
                | EnrollmentPhase::Analyzing { .. }
                | EnrollmentPhase::Retrying { .. }
        )
    }
}

/// Runs enrollment rounds against one microphone and embedding service.
pub struct EnrollmentFlow {
    microphone: Microphone,
    embeddings: Arc<dyn EmbeddingClient>,
    policy: EnrollmentPolicy,
    clock: Arc<dyn Clock>,
    phase: watch::Sender<EnrollmentPhase>,
    capture: Mutex<Option<CaptureControl>>,
}

/// Puts the phase back to `Idle` if a run is dropped or aborted mid-way.
struct RunGuard<'a> {
    phase: &'a watch::Sender<EnrollmentPhase>,
    armed: bool,
}

impl RunGuard<'_> {
    fn finish(mut self, phase: EnrollmentPhase) {
        self.armed = false;
        self.phase.send_replace(phase);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.phase.send_replace(EnrollmentPhase::Idle);
        }
    }
}

impl EnrollmentFlow {
    pub fn new(
        microphone: Microphone,
        embeddings: Arc<dyn EmbeddingClient>,
        policy: EnrollmentPolicy,
    ) -> Self {
        let (phase, _) = watch::channel(EnrollmentPhase::Idle);
        Self {
            microphone,
            embeddings,
            policy,
            clock: Arc::new(SystemClock),
            phase,
            capture: Mutex::new(None),
        }
    }

    /// Clock used to stamp the resulting voiceprint.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> EnrollmentPolicy {
        self.policy
    }

    pub fn phase(&self) -> EnrollmentPhase {
        self.phase.borrow().clone()
    }

    /// Watch phase transitions, e.g. to drive a progress display.
    pub fn subscribe(&self) -> watch::Receiver<EnrollmentPhase> {
        self.phase.subscribe()
    }

    /// End the current recording early and analyze what was captured so far.
    ///
    /// Does nothing outside a capture.
    pub fn stop_recording(&self) {
        if let Ok(capture) = self.capture.lock()
            && let Some(control) = capture.as_ref()
        {
            control.stop();
        }
    }

    /// Record all rounds and return the averaged voiceprint.
    ///
    /// Cancelling `cancel` abandons the flow with [`ShieldError::Aborted`];
    /// any in-flight analysis result is discarded.
    pub async fn run(&self, account: &AccountId, cancel: CancellationToken) -> Result<VoicePrint> {
        let guard = self.begin()?;

        match self.rounds(account, &cancel).await {
            Ok(voiceprint) => {
                guard.finish(EnrollmentPhase::Completed);
                Ok(voiceprint)
            }
            Err(ShieldError::Aborted) => {
                tracing::info!(account = %account, "enrollment aborted");
                guard.finish(EnrollmentPhase::Idle);
                Err(ShieldError::Aborted)
            }
            Err(e) => {
                tracing::warn!(account = %account, error = %e, "enrollment failed");
                guard.finish(EnrollmentPhase::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Claim the flow, moving straight to the first capture so that no
    /// other run can start in between.
    fn begin(&self) -> Result<RunGuard<'_>> {
        let prompt = enrollment_prompt(1)
            .ok_or_else(|| ShieldError::Other("no prompt for round 1".to_string()))?;
        let started = self.phase.send_if_modified(|phase| {
            if phase.is_running() {
                false
            } else {
                *phase = EnrollmentPhase::Capturing {
                    round: 1,
                    attempt: 1,
                    prompt,
                };
                true
            }
        });
        if !started {
            return Err(ShieldError::EnrollmentInProgress);
        }
        Ok(RunGuard {
            phase: &self.phase,
            armed: true,
        })
    }

    async fn rounds(&self, account: &AccountId, cancel: &CancellationToken) -> Result<VoicePrint> {
        let mut embeddings: Vec<EmbeddingVector> = Vec::with_capacity(defaults::ENROLLMENT_ROUNDS);

        for round in 1..=defaults::ENROLLMENT_ROUNDS {
            let prompt = enrollment_prompt(round)
                .ok_or_else(|| ShieldError::Other(format!("no prompt for round {}", round)))?;
            let embedding = self.round(round, prompt, cancel).await?;

            if let Some(first) = embeddings.first()
                && first.dimension() != embedding.dimension()
            {
                return Err(ShieldError::EmbeddingDimensionMismatch {
                    round,
                    expected: first.dimension(),
                    actual: embedding.dimension(),
                });
            }
            tracing::info!(round, dimension = embedding.dimension(), "enrollment round complete");
            embeddings.push(embedding);
        }

        let mean = voiceprint::average(&embeddings)?;
        for (index, embedding) in embeddings.iter().enumerate() {
            tracing::debug!(
                round = index + 1,
                similarity = embedding.cosine_similarity(&mean),
                "round similarity to voiceprint"
            );
        }

        Ok(VoicePrint::new(account.clone(), mean, self.clock.now()))
    }

    /// One round, re-recorded in place until it yields an embedding or the
    /// attempt limit is reached.
    async fn round(
        &self,
        round: usize,
        prompt: &'static str,
        cancel: &CancellationToken,
    ) -> Result<EmbeddingVector> {
        let max_attempts = self.policy.attempts_per_round.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.attempt(round, attempt, prompt, cancel).await {
                Ok(embedding) => return Ok(embedding),
                Err(e) if e.kind() == ErrorKind::Aborted => return Err(e),
                Err(e) if e.is_recapture_worthy() => {
                    if attempt >= max_attempts {
                        return Err(ShieldError::EnrollmentRoundExhausted {
                            round,
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    tracing::warn!(round, attempt, error = %e, "enrollment attempt failed, retrying");
                    self.phase.send_replace(EnrollmentPhase::Retrying {
                        round,
                        attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        round: usize,
        attempt: u32,
        prompt: &'static str,
        cancel: &CancellationToken,
    ) -> Result<EmbeddingVector> {
        if cancel.is_cancelled() {
            return Err(ShieldError::Aborted);
        }
        self.phase.send_replace(EnrollmentPhase::Capturing {
            round,
            attempt,
            prompt,
        });

        let control = CaptureControl::new(cancel.clone());
        self.set_capture(Some(control.clone()));
        let recorded = self.microphone.record(self.policy.recording, &control).await;
        self.set_capture(None);
        let sample = recorded?;

        self.phase
            .send_replace(EnrollmentPhase::Analyzing { round, attempt });
        let extract = with_timeout(
            Service::Embedding,
            self.policy.service_timeout,
            self.embeddings.extract(&sample),
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ShieldError::Aborted),
            embedding = extract => Ok(embedding?),
        }
    }

    fn set_capture(&self, control: Option<CaptureControl>) {
        if let Ok(mut capture) = self.capture.lock() {
            *capture = control;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::recorder::MockAudioSource;
    use crate::services::{MockEmbeddingClient, ServiceError};

    fn flow(source: &MockAudioSource, embeddings: MockEmbeddingClient) -> EnrollmentFlow {
        EnrollmentFlow::new(
            Microphone::new(Box::new(source.clone())),
            Arc::new(embeddings),
            EnrollmentPolicy::default(),
        )
    }

    fn malformed() -> ServiceError {
        ServiceError::Malformed {
            service: Service::Embedding,
            message: "empty embedding".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_rounds_are_averaged() {
        let embeddings = MockEmbeddingClient::new().with_embeddings(vec![
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![2.0, 2.0],
        ]);
        let flow = flow(&MockAudioSource::new(), embeddings.clone());

        let voiceprint = flow
            .run(&AccountId::new("uid-1"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(voiceprint.embedding.values(), &[1.0, 1.0]);
        assert_eq!(voiceprint.account_id, AccountId::new("uid-1"));
        assert_eq!(embeddings.extract_calls(), 3);
        assert_eq!(flow.phase(), EnrollmentPhase::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_round_is_retried_in_place() {
        let embeddings = MockEmbeddingClient::new().with_extract_results(vec![
            Ok(vec![1.0, 0.0]),
            Err(malformed()),
            Ok(vec![0.0, 1.0]),
            Ok(vec![2.0, 2.0]),
        ]);
        let flow = flow(&MockAudioSource::new(), embeddings.clone());
        let mut phases = flow.subscribe();

        let voiceprint = flow
            .run(&AccountId::new("uid-1"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(voiceprint.embedding.values(), &[1.0, 1.0]);
        assert_eq!(embeddings.extract_calls(), 4);
        assert!(phases.has_changed().unwrap());
        assert_eq!(*phases.borrow_and_update(), EnrollmentPhase::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_gives_up_after_attempt_limit() {
        let embeddings = MockEmbeddingClient::new().with_extract_results(vec![
            Ok(vec![1.0, 0.0]),
            Err(malformed()),
            Err(malformed()),
            Err(malformed()),
        ]);
        let flow = flow(&MockAudioSource::new(), embeddings.clone());

        match flow
            .run(&AccountId::new("uid-1"), CancellationToken::new())
            .await
        {
            Err(ShieldError::EnrollmentRoundExhausted {
                round, attempts, ..
            }) => {
                assert_eq!(round, 2);
                assert_eq!(attempts, 3);
            }
            other => panic!("Expected EnrollmentRoundExhausted, got {:?}", other),
        }
        assert_eq!(embeddings.extract_calls(), 4);
        assert!(matches!(flow.phase(), EnrollmentPhase::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dimension_mismatch_is_fatal() {
        let embeddings = MockEmbeddingClient::new().with_embeddings(vec![
            vec![1.0, 0.0],
            vec![1.0, 0.0, 0.0],
        ]);
        let flow = flow(&MockAudioSource::new(), embeddings.clone());

        match flow
            .run(&AccountId::new("uid-1"), CancellationToken::new())
            .await
        {
            Err(ShieldError::EmbeddingDimensionMismatch {
                round,
                expected,
                actual,
            }) => {
                assert_eq!((round, expected, actual), (2, 2, 3));
            }
            other => panic!("Expected EmbeddingDimensionMismatch, got {:?}", other),
        }
        assert_eq!(embeddings.extract_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_is_not_retried() {
        let source = MockAudioSource::new().with_permission_denied();
        let embeddings = MockEmbeddingClient::new();
        let flow = flow(&source, embeddings.clone());

        let result = flow
            .run(&AccountId::new("uid-1"), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ShieldError::MicrophonePermission { .. })));
        assert_eq!(embeddings.extract_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_microphone_exhausts_round_one() {
        let flow = flow(&MockAudioSource::new().silent(), MockEmbeddingClient::new());

        match flow
            .run(&AccountId::new("uid-1"), CancellationToken::new())
            .await
        {
            Err(ShieldError::EnrollmentRoundExhausted {
                round, last_error, ..
            }) => {
                assert_eq!(round, 1);
                assert_eq!(last_error, "Recording contained no audio");
            }
            other => panic!("Expected EnrollmentRoundExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_analysis_discards_result() {
        let embeddings = MockEmbeddingClient::new().with_delay(Duration::from_secs(10));
        let source = MockAudioSource::new();
        let flow = flow(&source, embeddings);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(8)).await;
            canceller.cancel();
        });

        let result = flow.run(&AccountId::new("uid-1"), cancel).await;
        assert!(matches!(result, Err(ShieldError::Aborted)));
        assert_eq!(flow.phase(), EnrollmentPhase::Idle);
        assert!(!source.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_recording_ends_capture_early() {
        let flow = Arc::new(flow(&MockAudioSource::new(), MockEmbeddingClient::new()));
        let mut phases = flow.subscribe();

        let stopper = flow.clone();
        tokio::spawn(async move {
            while phases.changed().await.is_ok() {
                let capturing = matches!(*phases.borrow(), EnrollmentPhase::Capturing { .. });
                if capturing {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    stopper.stop_recording();
                }
            }
        });

        let started = tokio::time::Instant::now();
        flow.run(&AccountId::new("uid-1"), CancellationToken::new())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3 * defaults::RECORDING_SECS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_run_is_rejected() {
        let flow = Arc::new(flow(
            &MockAudioSource::new(),
            MockEmbeddingClient::new().with_delay(Duration::from_secs(1)),
        ));

        let first = {
            let flow = flow.clone();
            tokio::spawn(async move {
                flow.run(&AccountId::new("uid-1"), CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = flow
            .run(&AccountId::new("uid-1"), CancellationToken::new())
            .await;
        assert!(matches!(second, Err(ShieldError::EnrollmentInProgress)));
        assert!(first.await.unwrap().is_ok());
    }

    #[test]
    fn test_start_claims_first_capture() {
        let flow = flow(&MockAudioSource::new(), MockEmbeddingClient::new());

        let guard = flow.begin().unwrap();
        match flow.phase() {
            EnrollmentPhase::Capturing { round, attempt, .. } => {
                assert_eq!((round, attempt), (1, 1));
            }
            other => panic!("Expected Capturing, got {:?}", other),
        }
        assert!(matches!(flow.begin(), Err(ShieldError::EnrollmentInProgress)));

        drop(guard);
        assert_eq!(flow.phase(), EnrollmentPhase::Idle);
        assert!(flow.begin().is_ok());
    }
}
