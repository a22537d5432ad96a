use crate::error::{Result, ShieldError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Trait for audio source devices.
///
/// This trait allows swapping implementations (real audio device vs mock).
pub trait AudioSource: Send + Sync {
    /// Start capturing audio from the source.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing audio and release the device.
    fn stop(&mut self) -> Result<()>;

    /// Drain the 16-bit PCM samples captured since the previous read.
    fn read_samples(&mut self) -> Result<Vec<i16>>;

    /// Sample rate of the PCM returned by `read_samples`.
    fn sample_rate(&self) -> u32;
}

/// Mock audio source for testing.
///
/// Each read yields the next queued chunk, then repeats `samples` forever.
/// The started flag is shared between clones so a test can keep a handle
/// after moving the source into a `Microphone`.
#[derive(Debug, Clone)]
pub struct MockAudioSource {
    started: Arc<AtomicBool>,
    starts: Arc<AtomicUsize>,
    samples: Vec<i16>,
    chunks: VecDeque<Vec<i16>>,
    sample_rate: u32,
    should_fail_start: bool,
    permission_denied: bool,
    should_fail_read: bool,
    error_message: String,
}

impl MockAudioSource {
    /// Create a new mock audio source delivering 10ms of silence per read
    pub fn new() -> Self {
        Self {
            started: Arc::new(AtomicBool::new(false)),
            starts: Arc::new(AtomicUsize::new(0)),
            samples: vec![0i16; 160],
            chunks: VecDeque::new(),
            sample_rate: crate::defaults::SAMPLE_RATE,
            should_fail_start: false,
            permission_denied: false,
            should_fail_read: false,
            error_message: "mock audio error".to_string(),
        }
    }

    /// Configure the samples returned on every read
    pub fn with_samples(mut self, samples: Vec<i16>) -> Self {
        self.samples = samples;
        self
    }

    /// Queue chunks returned before falling back to `samples`
    pub fn with_chunks(mut self, chunks: Vec<Vec<i16>>) -> Self {
        self.chunks = chunks.into();
        self
    }

    /// Deliver nothing at all
    pub fn silent(mut self) -> Self {
        self.samples = Vec::new();
        self.chunks.clear();
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Configure the mock to fail on start
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the mock to fail on start as if the OS refused access
    pub fn with_permission_denied(mut self) -> Self {
        self.permission_denied = true;
        self
    }

    /// Configure the mock to fail on read
    pub fn with_read_failure(mut self) -> Self {
        self.should_fail_read = true;
        self
    }

    /// Configure the error message for failures
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    /// Check if the audio source is started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Number of times `start` succeeded
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.permission_denied {
            return Err(ShieldError::MicrophonePermission {
                message: self.error_message.clone(),
            });
        }
        if self.should_fail_start {
            return Err(ShieldError::AudioCapture {
                message: self.error_message.clone(),
            });
        }
        self.started.store(true, Ordering::SeqCst);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.should_fail_read {
            return Err(ShieldError::AudioCapture {
                message: self.error_message.clone(),
            });
        }
        if !self.is_started() {
            return Ok(Vec::new());
        }
        Ok(self
            .chunks
            .pop_front()
            .unwrap_or_else(|| self.samples.clone()))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_audio_source_returns_configured_samples() {
        let test_samples = vec![100i16, 200, 300, 400, 500];
        let mut source = MockAudioSource::new().with_samples(test_samples.clone());

        source.start().unwrap();
        assert_eq!(source.read_samples().unwrap(), test_samples);
        assert_eq!(source.read_samples().unwrap(), test_samples);
    }

    #[test]
    fn test_mock_audio_source_drains_chunks_first() {
        let mut source = MockAudioSource::new()
            .with_chunks(vec![vec![1, 2], vec![3]])
            .with_samples(Vec::new());

        source.start().unwrap();
        assert_eq!(source.read_samples().unwrap(), vec![1, 2]);
        assert_eq!(source.read_samples().unwrap(), vec![3]);
        assert!(source.read_samples().unwrap().is_empty());
    }

    #[test]
    fn test_mock_audio_source_reads_nothing_when_stopped() {
        let mut source = MockAudioSource::new().with_samples(vec![1, 2, 3]);
        assert!(source.read_samples().unwrap().is_empty());
    }

    #[test]
    fn test_mock_audio_source_start_stop_tracks_state_across_clones() {
        let mut source = MockAudioSource::new();
        let observer = source.clone();

        assert!(!observer.is_started());
        source.start().unwrap();
        assert!(observer.is_started());
        assert_eq!(observer.start_count(), 1);
        source.stop().unwrap();
        assert!(!observer.is_started());
    }

    #[test]
    fn test_mock_audio_source_start_failure() {
        let mut source = MockAudioSource::new()
            .with_start_failure()
            .with_error_message("device unplugged");

        match source.start() {
            Err(ShieldError::AudioCapture { message }) => assert_eq!(message, "device unplugged"),
            other => panic!("Expected AudioCapture error, got {:?}", other),
        }
        assert!(!source.is_started());
    }

    #[test]
    fn test_mock_audio_source_permission_denied() {
        let mut source = MockAudioSource::new().with_permission_denied();
        assert!(matches!(
            source.start(),
            Err(ShieldError::MicrophonePermission { .. })
        ));
    }

    #[test]
    fn test_mock_audio_source_read_failure() {
        let mut source = MockAudioSource::new().with_read_failure();
        source.start().unwrap();
        assert!(source.read_samples().is_err());
    }

    #[test]
    fn test_mock_audio_source_can_be_used_as_trait_object() {
        let mut source: Box<dyn AudioSource> =
            Box::new(MockAudioSource::new().with_sample_rate(8000));
        assert_eq!(source.sample_rate(), 8000);
        assert!(source.start().is_ok());
        assert_eq!(source.read_samples().unwrap().len(), 160);
        assert!(source.stop().is_ok());
    }
}
