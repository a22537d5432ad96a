//! Error types for audioshield.

use crate::services::ServiceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShieldError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio input errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Microphone access denied: {message}")]
    MicrophonePermission { message: String },

    #[error("Microphone is already recording")]
    MicrophoneBusy,

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("Recording contained no audio")]
    EmptyAudio,

    #[error("Recording too short: {duration_ms}ms captured, at least {min_ms}ms required")]
    AudioTooShort { duration_ms: u64, min_ms: u64 },

    // Analysis service errors
    #[error(transparent)]
    Service(#[from] ServiceError),

    // Enrollment errors
    #[error(
        "Embedding dimension mismatch in round {round}: expected {expected}, got {actual}"
    )]
    EmbeddingDimensionMismatch {
        round: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Cannot average an empty set of embeddings")]
    NoEmbeddings,

    #[error("Enrollment round {round} failed after {attempts} attempts: {last_error}")]
    EnrollmentRoundExhausted {
        round: usize,
        attempts: u32,
        last_error: String,
    },

    #[error("An enrollment is already in progress")]
    EnrollmentInProgress,

    // Verification errors
    #[error("A verification attempt is already in progress")]
    VerificationInProgress,

    #[error("This verification attempt has already been resolved")]
    VerificationResolved,

    #[error("This sign-in has finished or expired; start again")]
    SignInExpired,

    #[error("Aborted")]
    Aborted,

    // Identity provider errors
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Identity provider error: {message}")]
    Identity { message: String },

    // Code dispatch errors
    #[error("Failed to send verification code: {message}")]
    Dispatch { message: String },

    // Store errors
    #[error("Store error: {message}")]
    Store { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

/// Coarse classification used to decide how far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caused by the person or their device; surfaced immediately, flow does not advance.
    Input,
    /// A collaborator failed or timed out; the affected check counts as failed.
    Service,
    /// The owning flow was abandoned.
    Aborted,
    /// Anything that requires restarting the whole operation.
    Fatal,
}

impl ShieldError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShieldError::MicrophonePermission { .. }
            | ShieldError::MicrophoneBusy
            | ShieldError::EmptyAudio
            | ShieldError::AudioTooShort { .. }
            | ShieldError::AudioDeviceNotFound { .. }
            | ShieldError::InvalidCredentials
            | ShieldError::SignInExpired => ErrorKind::Input,
            ShieldError::Service(_)
            | ShieldError::EnrollmentRoundExhausted { .. }
            | ShieldError::Identity { .. }
            | ShieldError::Dispatch { .. } => ErrorKind::Service,
            ShieldError::Aborted => ErrorKind::Aborted,
            _ => ErrorKind::Fatal,
        }
    }

    /// Whether re-capturing audio could plausibly fix this failure.
    pub fn is_recapture_worthy(&self) -> bool {
        matches!(
            self,
            ShieldError::EmptyAudio | ShieldError::AudioTooShort { .. } | ShieldError::Service(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ShieldError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Service;
    use std::io;

    #[test]
    fn test_config_invalid_value_display() {
        let error = ShieldError::ConfigInvalidValue {
            key: "audio.recording_secs".to_string(),
            message: "must be between 5 and 6".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for audio.recording_secs: must be between 5 and 6"
        );
    }

    #[test]
    fn test_audio_too_short_display() {
        let error = ShieldError::AudioTooShort {
            duration_ms: 400,
            min_ms: 1000,
        };
        assert_eq!(
            error.to_string(),
            "Recording too short: 400ms captured, at least 1000ms required"
        );
    }

    #[test]
    fn test_dimension_mismatch_display() {
        let error = ShieldError::EmbeddingDimensionMismatch {
            round: 2,
            expected: 192,
            actual: 256,
        };
        assert_eq!(
            error.to_string(),
            "Embedding dimension mismatch in round 2: expected 192, got 256"
        );
    }

    #[test]
    fn test_service_error_is_transparent() {
        let error: ShieldError = ServiceError::Timeout {
            service: Service::Liveness,
            after_ms: 18000,
        }
        .into();
        assert_eq!(error.to_string(), "liveness service timed out after 18000ms");
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(ShieldError::EmptyAudio.kind(), ErrorKind::Input);
        assert_eq!(ShieldError::MicrophoneBusy.kind(), ErrorKind::Input);
        assert_eq!(
            ShieldError::MicrophonePermission {
                message: "denied".to_string()
            }
            .kind(),
            ErrorKind::Input
        );
        assert_eq!(ShieldError::SignInExpired.kind(), ErrorKind::Input);
        assert_eq!(ShieldError::Aborted.kind(), ErrorKind::Aborted);
        assert_eq!(
            ShieldError::Dispatch {
                message: "smtp down".to_string()
            }
            .kind(),
            ErrorKind::Service
        );
        assert_eq!(
            ShieldError::EmbeddingDimensionMismatch {
                round: 1,
                expected: 2,
                actual: 3
            }
            .kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_recapture_worthy() {
        assert!(ShieldError::EmptyAudio.is_recapture_worthy());
        assert!(
            ShieldError::Service(ServiceError::Malformed {
                service: Service::Embedding,
                message: "empty vector".to_string()
            })
            .is_recapture_worthy()
        );
        assert!(!ShieldError::MicrophoneBusy.is_recapture_worthy());
        assert!(!ShieldError::Aborted.is_recapture_worthy());
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: ShieldError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let error: ShieldError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ShieldError>();
        assert_sync::<ShieldError>();
    }
}
