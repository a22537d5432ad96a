use crate::defaults;
use crate::error::{Result, ShieldError};
use crate::phrase::DICTIONARY;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub services: ServicesConfig,
    pub enrollment: EnrollmentConfig,
    pub challenge: ChallengeConfig,
    pub otp: OtpConfig,
    pub mail: MailConfig,
    pub identity: IdentityConfig,
    pub store: StoreConfig,
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub recording_secs: u64,
    pub min_recording_ms: u64,
}

/// Analysis service endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServicesConfig {
    pub base_url: String,
    pub transcribe_path: String,
    pub extract_path: String,
    pub verify_path: String,
    pub liveness_path: String,
    pub voiceprints_path: String,
    /// Per-call timeout. Defaults to a multiple of the recording length.
    pub timeout_secs: Option<u64>,
}

/// Enrollment configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnrollmentConfig {
    pub max_attempts_per_round: u32,
}

/// Challenge phrase configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChallengeConfig {
    pub word_count: usize,
}

/// One-time code configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OtpConfig {
    pub ttl_secs: u64,
}

/// Outbound mail configuration for code delivery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MailConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub sender_name: String,
    pub sender_email: Option<String>,
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            recording_secs: defaults::RECORDING_SECS,
            min_recording_ms: defaults::MIN_RECORDING_MS,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::SERVICE_BASE_URL.to_string(),
            transcribe_path: defaults::TRANSCRIBE_PATH.to_string(),
            extract_path: defaults::EXTRACT_EMBEDDING_PATH.to_string(),
            verify_path: defaults::VERIFY_SPEAKER_PATH.to_string(),
            liveness_path: defaults::LIVENESS_PATH.to_string(),
            voiceprints_path: defaults::VOICEPRINTS_PATH.to_string(),
            timeout_secs: None,
        }
    }
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_round: defaults::ENROLLMENT_ATTEMPTS_PER_ROUND,
        }
    }
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            word_count: defaults::CHALLENGE_WORDS,
        }
    }
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            ttl_secs: defaults::OTP_TTL_SECS,
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::MAIL_ENDPOINT.to_string(),
            api_key: None,
            sender_name: defaults::MAIL_SENDER_NAME.to_string(),
            sender_email: None,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::IDENTITY_ENDPOINT.to_string(),
            api_key: None,
        }
    }
}

impl AudioConfig {
    pub fn recording_duration(&self) -> Duration {
        Duration::from_secs(self.recording_secs)
    }

    pub fn min_recording(&self) -> Duration {
        Duration::from_millis(self.min_recording_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file is missing or contains invalid TOML.
    /// Missing fields use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ShieldError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ShieldError::Io(e)
            }
        })?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if the file doesn't exist
    ///
    /// Only a missing file falls back to defaults; invalid TOML is an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(ShieldError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - AUDIOSHIELD_SERVICE_URL → services.base_url
    /// - AUDIOSHIELD_AUDIO_DEVICE → audio.device
    /// - AUDIOSHIELD_MAIL_API_KEY (or BREVO_API_KEY) → mail.api_key
    /// - AUDIOSHIELD_IDENTITY_API_KEY → identity.api_key
    /// - AUDIOSHIELD_DATA_DIR → store.data_dir
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = non_empty_env("AUDIOSHIELD_SERVICE_URL") {
            self.services.base_url = url;
        }

        if let Some(device) = non_empty_env("AUDIOSHIELD_AUDIO_DEVICE") {
            self.audio.device = Some(device);
        }

        if let Some(key) =
            non_empty_env("AUDIOSHIELD_MAIL_API_KEY").or_else(|| non_empty_env("BREVO_API_KEY"))
        {
            self.mail.api_key = Some(key);
        }

        if let Some(key) = non_empty_env("AUDIOSHIELD_IDENTITY_API_KEY") {
            self.identity.api_key = Some(key);
        }

        if let Some(dir) = non_empty_env("AUDIOSHIELD_DATA_DIR") {
            self.store.data_dir = Some(PathBuf::from(dir));
        }

        self
    }

    /// Reject values that would break an authentication policy.
    pub fn validate(&self) -> Result<()> {
        let secs = self.audio.recording_secs;
        if !(defaults::MIN_RECORDING_POLICY_SECS..=defaults::MAX_RECORDING_POLICY_SECS)
            .contains(&secs)
        {
            return Err(invalid(
                "audio.recording_secs",
                format!(
                    "must be between {} and {}, got {}",
                    defaults::MIN_RECORDING_POLICY_SECS,
                    defaults::MAX_RECORDING_POLICY_SECS,
                    secs
                ),
            ));
        }
        if self.audio.min_recording_ms >= secs * 1000 {
            return Err(invalid(
                "audio.min_recording_ms",
                "must be shorter than the recording length".to_string(),
            ));
        }
        if self.audio.sample_rate == 0 {
            return Err(invalid("audio.sample_rate", "must be positive".to_string()));
        }
        if self.enrollment.max_attempts_per_round == 0 {
            return Err(invalid(
                "enrollment.max_attempts_per_round",
                "must be at least 1".to_string(),
            ));
        }
        if self.challenge.word_count == 0 || self.challenge.word_count > DICTIONARY.len() {
            return Err(invalid(
                "challenge.word_count",
                format!("must be between 1 and {}", DICTIONARY.len()),
            ));
        }
        if self.otp.ttl_secs == 0 {
            return Err(invalid("otp.ttl_secs", "must be positive".to_string()));
        }
        if self.services.timeout_secs == Some(0) {
            return Err(invalid(
                "services.timeout_secs",
                "must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Timeout applied to every analysis call.
    pub fn service_timeout(&self) -> Duration {
        match self.services.timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.audio.recording_duration() * defaults::SERVICE_TIMEOUT_FACTOR as u32,
        }
    }

    /// One-time code lifetime.
    pub fn otp_ttl(&self) -> Duration {
        Duration::from_secs(self.otp.ttl_secs)
    }

    /// Directory holding voiceprints and code records.
    ///
    /// Returns ~/.local/share/audioshield on Linux unless overridden.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.store.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|dir| dir.join("audioshield"))
            .ok_or_else(|| ShieldError::Other("Could not determine data directory".to_string()))
    }

    /// Render the effective configuration as TOML, with secrets masked.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.mail.api_key.is_some() {
            shown.mail.api_key = Some("********".to_string());
        }
        if shown.identity.api_key.is_some() {
            shown.identity.api_key = Some("********".to_string());
        }
        toml::to_string_pretty(&shown).map_err(|e| ShieldError::ConfigParse {
            message: e.to_string(),
        })
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/audioshield/config.toml on Linux
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("audioshield").join("config.toml"))
            .ok_or_else(|| {
                ShieldError::Other("Could not determine config directory".to_string())
            })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn invalid(key: &str, message: String) -> ShieldError {
    ShieldError::ConfigInvalidValue {
        key: key.to_string(),
        message,
    }
}
