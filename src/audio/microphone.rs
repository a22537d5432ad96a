//! Exclusive, bounded-duration recording on top of an [`AudioSource`].

use crate::audio::recorder::AudioSource;
use crate::audio::sample::AudioSample;
use crate::defaults;
use crate::error::{Result, ShieldError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Signals a single recording can receive while it runs.
///
/// `stop` ends the capture early and keeps what was recorded; `cancel`
/// abandons it and discards the audio.
#[derive(Debug, Clone, Default)]
pub struct CaptureControl {
    stop: CancellationToken,
    cancel: CancellationToken,
}

impl CaptureControl {
    /// Control tied to a flow's cancellation token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            stop: CancellationToken::new(),
            cancel,
        }
    }

    /// End the recording now and keep the audio.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Shared handle to the one microphone of this client.
///
/// Only one recording may hold the device at a time. A second `record`
/// while one is active fails with [`ShieldError::MicrophoneBusy`] instead of
/// waiting.
#[derive(Clone)]
pub struct Microphone {
    source: Arc<Mutex<Box<dyn AudioSource>>>,
    min_duration: Duration,
}

/// Holds the device for one recording and always stops it on drop,
/// including when the recording future itself is dropped.
struct ActiveCapture<'a> {
    source: MutexGuard<'a, Box<dyn AudioSource>>,
}

impl Drop for ActiveCapture<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.source.stop() {
            tracing::warn!(error = %e, "failed to release microphone");
        } else {
            tracing::trace!("microphone released");
        }
    }
}

impl Microphone {
    pub fn new(source: Box<dyn AudioSource>) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            min_duration: Duration::from_millis(defaults::MIN_RECORDING_MS),
        }
    }

    /// Shortest recording accepted before `AudioTooShort` is returned.
    pub fn with_min_duration(mut self, min_duration: Duration) -> Self {
        self.min_duration = min_duration;
        self
    }

    /// Whether a recording currently holds the device.
    pub fn is_busy(&self) -> bool {
        self.source.try_lock().is_err()
    }

    /// Record until `bound` elapses or `control` stops or cancels the capture.
    ///
    /// The device is released before this returns, whatever the outcome.
    pub async fn record(&self, bound: Duration, control: &CaptureControl) -> Result<AudioSample> {
        if control.is_cancelled() {
            return Err(ShieldError::Aborted);
        }

        let guard = self
            .source
            .try_lock()
            .map_err(|_| ShieldError::MicrophoneBusy)?;
        let mut capture = ActiveCapture { source: guard };
        capture.source.start()?;
        let sample_rate = capture.source.sample_rate();
        tracing::debug!(bound_ms = bound.as_millis() as u64, "capture started");

        let deadline = tokio::time::Instant::now() + bound;
        let mut ticker = tokio::time::interval(Duration::from_millis(defaults::CAPTURE_POLL_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pcm: Vec<i16> = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = control.cancel.cancelled() => {
                    tracing::debug!("capture aborted, discarding audio");
                    return Err(ShieldError::Aborted);
                }
                _ = control.stop.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    pcm.extend(capture.source.read_samples()?);
                }
            }
        }
        pcm.extend(capture.source.read_samples()?);
        drop(capture);

        let captured_ms = if sample_rate == 0 {
            0
        } else {
            pcm.len() as u64 * 1000 / sample_rate as u64
        };
        tracing::debug!(captured_ms, samples = pcm.len(), "capture stopped");

        if pcm.is_empty() {
            return Err(ShieldError::EmptyAudio);
        }
        let min_ms = self.min_duration.as_millis() as u64;
        if captured_ms < min_ms {
            return Err(ShieldError::AudioTooShort {
                duration_ms: captured_ms,
                min_ms,
            });
        }

        AudioSample::from_pcm(&pcm, sample_rate)
    }
}
