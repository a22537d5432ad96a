//! Immutable recorded audio handed to the analysis services.

use crate::audio::wav;
use crate::error::{Result, ShieldError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// One recording, encoded as WAV.
///
/// Cloning shares the underlying bytes. There is no way to mutate a sample
/// after construction, so concurrent uploads all see the same audio.
#[derive(Clone)]
pub struct AudioSample {
    data: Arc<[u8]>,
    duration: Duration,
    sample_rate: u32,
}

impl AudioSample {
    pub const MIME: &'static str = "audio/wav";

    /// Encode captured mono PCM into a sample.
    pub fn from_pcm(samples: &[i16], sample_rate: u32) -> Result<Self> {
        if samples.is_empty() {
            return Err(ShieldError::EmptyAudio);
        }
        let bytes = wav::encode(samples, sample_rate)?;
        Ok(Self {
            data: Arc::from(bytes),
            duration: pcm_duration(samples.len(), sample_rate),
            sample_rate,
        })
    }

    /// Wrap an existing WAV file without re-encoding it.
    pub fn from_wav_bytes(bytes: Vec<u8>) -> Result<Self> {
        let decoded = wav::decode(&bytes)?;
        if decoded.samples.is_empty() {
            return Err(ShieldError::EmptyAudio);
        }
        Ok(Self {
            duration: pcm_duration(decoded.samples.len(), decoded.sample_rate),
            sample_rate: decoded.sample_rate,
            data: Arc::from(bytes),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn mime(&self) -> &'static str {
        Self::MIME
    }

    /// File name used for multipart uploads.
    pub fn file_name(&self) -> &'static str {
        "recording.wav"
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for AudioSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSample")
            .field("bytes", &self.data.len())
            .field("duration", &self.duration)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

fn pcm_duration(frames: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(frames as u64 * 1_000_000 / sample_rate as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_pcm_records_duration_and_encodes_wav() {
        let sample = AudioSample::from_pcm(&vec![0i16; 96000], 16000).unwrap();

        assert_eq!(sample.duration(), Duration::from_secs(6));
        assert_eq!(sample.sample_rate(), 16000);
        assert_eq!(&sample.bytes()[0..4], b"RIFF");
        assert_eq!(sample.mime(), "audio/wav");
        assert!(sample.len() > 96000 * 2);
    }

    #[test]
    fn from_pcm_rejects_empty_capture() {
        assert!(matches!(
            AudioSample::from_pcm(&[], 16000),
            Err(ShieldError::EmptyAudio)
        ));
    }

    #[test]
    fn from_wav_bytes_keeps_original_bytes() {
        let bytes = wav::encode(&vec![7i16; 22050], 22050).unwrap();
        let sample = AudioSample::from_wav_bytes(bytes.clone()).unwrap();

        assert_eq!(sample.bytes(), bytes.as_slice());
        assert_eq!(sample.duration(), Duration::from_secs(1));
        assert_eq!(sample.sample_rate(), 22050);
    }

    #[test]
    fn clones_share_storage() {
        let sample = AudioSample::from_pcm(&[1, 2, 3], 16000).unwrap();
        let copy = sample.clone();
        assert_eq!(sample.bytes().as_ptr(), copy.bytes().as_ptr());
    }

    #[test]
    fn debug_omits_audio_bytes() {
        let sample = AudioSample::from_pcm(&[1, 2, 3], 16000).unwrap();
        let rendered = format!("{:?}", sample);
        assert!(rendered.contains("bytes: "));
        assert!(!rendered.contains("RIFF"));
        assert!(rendered.contains("sample_rate: 16000"));
    }
}
