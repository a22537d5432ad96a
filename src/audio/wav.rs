//! WAV encoding and decoding for captured and imported audio.

use crate::error::{Result, ShieldError};
use std::io::Cursor;

/// Decoded PCM audio, mixed down to mono.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedWav {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl DecodedWav {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Encode mono 16-bit PCM samples as an in-memory WAV file.
pub fn encode(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    let mut writer =
        hound::WavWriter::new(&mut cursor, spec).map_err(|e| ShieldError::AudioCapture {
            message: format!("Failed to create WAV writer: {}", e),
        })?;
    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| ShieldError::AudioCapture {
                message: format!("Failed to write WAV sample: {}", e),
            })?;
    }
    writer.finalize().map_err(|e| ShieldError::AudioCapture {
        message: format!("Failed to finalize WAV data: {}", e),
    })?;

    Ok(cursor.into_inner())
}

/// Decode WAV bytes into mono 16-bit PCM at the file's own sample rate.
///
/// Float WAVs are converted to i16; multi-channel audio is averaged.
pub fn decode(bytes: &[u8]) -> Result<DecodedWav> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| ShieldError::AudioCapture {
            message: format!("Failed to parse WAV file: {}", e),
        })?;

    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(ShieldError::AudioCapture {
            message: "WAV file declares zero channels".to_string(),
        });
    }

    let raw: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(read_error)?,
        hound::SampleFormat::Int => {
            let shift = spec.bits_per_sample.saturating_sub(16) as u32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v >> shift) as i16))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(read_error)?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(read_error)?,
    };

    Ok(DecodedWav {
        samples: mix_to_mono(&raw, spec.channels as usize),
        sample_rate: spec.sample_rate,
    })
}

fn read_error(e: hound::Error) -> ShieldError {
    ShieldError::AudioCapture {
        message: format!("Failed to read WAV samples: {}", e),
    }
}

/// Average interleaved frames down to a single channel.
pub fn mix_to_mono(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Simple linear interpolation resampling.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_wav_data(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn encode_produces_parseable_mono_wav() {
        let bytes = encode(&[1, -1, 300, -300], 16000).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");

        let reader = hound::WavReader::new(Cursor::new(&bytes)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 4);
    }

    #[test]
    fn decode_stereo_downmixes_to_mono() {
        // Stereo pairs: (100, 200), (300, 400), (500, 600)
        let wav = make_wav_data(22050, 2, &[100, 200, 300, 400, 500, 600]);
        let decoded = decode(&wav).unwrap();

        assert_eq!(decoded.samples, vec![150, 350, 550]);
        assert_eq!(decoded.sample_rate, 22050);
    }

    #[test]
    fn decode_float_wav_converts_to_i16() {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        writer.write_sample(1.0f32).unwrap();
        writer.write_sample(-1.0f32).unwrap();
        writer.write_sample(0.0f32).unwrap();
        writer.finalize().unwrap();

        let decoded = decode(&cursor.into_inner()).unwrap();
        assert_eq!(decoded.samples, vec![i16::MAX, -i16::MAX, 0]);
    }

    #[test]
    fn decode_reports_duration() {
        let wav = make_wav_data(16000, 1, &vec![0i16; 8000]);
        assert_eq!(decode(&wav).unwrap().duration_ms(), 500);
    }

    #[test]
    fn decode_rejects_garbage() {
        let result = decode(&[0u8, 1, 2, 3, 4, 5]);
        match result {
            Err(ShieldError::AudioCapture { message }) => {
                assert!(message.contains("Failed to parse WAV file"));
            }
            other => panic!("Expected AudioCapture error, got {:?}", other),
        }
        assert!(decode(&[]).is_err());
        assert!(decode(&vec![0u8; 1000]).is_err());
    }

    #[test]
    fn resample_identity_same_rate() {
        let samples = vec![100i16, 200, 300, 400, 500];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }

    #[test]
    fn resample_upsample_interpolates() {
        let resampled = resample(&[0i16, 1000, 2000], 8000, 16000);

        assert_eq!(resampled.len(), 6);
        assert_eq!(resampled[0], 0);
        assert!(resampled[1] > 0 && resampled[1] < 1000);
        assert_eq!(resampled[2], 1000);
    }

    #[test]
    fn resample_downsample_halves_length() {
        let resampled = resample(&vec![1000i16; 3200], 16000, 8000);
        assert_eq!(resampled.len(), 1600);
        assert!(resampled.iter().all(|&s| (999..=1001).contains(&s)));
    }

    #[test]
    fn resample_handles_edge_cases() {
        assert!(resample(&[], 16000, 8000).is_empty());
        assert_eq!(resample(&[100i16], 16000, 8000), vec![100]);
    }

    #[test]
    fn mix_to_mono_handles_negative_values() {
        assert_eq!(mix_to_mono(&[-100, 100, 300, -300], 2), vec![0, 0]);
        assert_eq!(mix_to_mono(&[5, 6, 7], 1), vec![5, 6, 7]);
    }
}
