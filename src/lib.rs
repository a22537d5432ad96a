//! audioshield - Multi-factor voice authentication
//!
//! Password, then a spoken challenge phrase checked for content, speaker and
//! liveness, then a one-time code sent by email.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod clock;
pub mod config;
pub mod defaults;
pub mod dispatch;
pub mod enrollment;
pub mod error;
pub mod identity;
pub mod otp;
pub mod output;
pub mod phrase;
pub mod services;
pub mod session;
pub mod store;
pub mod verification;
pub mod voiceprint;

// Composition root - needs the real microphone and HTTP collaborators
#[cfg(all(feature = "cpal-audio", feature = "http", feature = "cli"))]
pub mod app;

// Collaborator traits (source → analysis → storage / delivery)
pub use audio::recorder::AudioSource;
pub use clock::Clock;
pub use dispatch::CodeDispatcher;
pub use identity::IdentityProvider;
pub use services::{EmbeddingClient, LivenessClient, TranscriptClient};
pub use store::{OtpStore, VoicePrintStore};

// Flows
pub use enrollment::{EnrollmentFlow, EnrollmentPhase};
pub use session::{Authenticator, SignInOutcome};
pub use verification::{VerificationFlow, VerificationPhase, VerificationVerdict};

// Error handling
pub use error::{Result, ShieldError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }

    #[test]
    fn version_string_has_hash_only_when_built_in_git() {
        let ver = version_string();
        if option_env!("GIT_HASH").is_some_and(|h| !h.is_empty()) {
            let hash_part = ver.split('+').nth(1).unwrap_or("");
            assert_eq!(hash_part.len(), 7, "Git hash should be 7 chars, got: {}", ver);
        } else {
            assert_eq!(ver, env!("CARGO_PKG_VERSION"));
        }
    }
}
