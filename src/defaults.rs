//! Default configuration constants for audioshield.
//!
//! Shared by the configuration types and the flows so that policy values
//! live in exactly one place.

/// Default audio sample rate in Hz.
///
/// 16kHz is what the speaker-embedding and speech-to-text models expect.
pub const SAMPLE_RATE: u32 = 16000;

/// Length of every recording, in seconds.
///
/// Policy fixes the capture window at 5–6 seconds; 6 gives the liveness
/// classifier its full input window.
pub const RECORDING_SECS: u64 = 6;

/// Shortest recording policy allows, in seconds.
pub const MIN_RECORDING_POLICY_SECS: u64 = 5;

/// Longest recording policy allows, in seconds.
pub const MAX_RECORDING_POLICY_SECS: u64 = 6;

/// Below this much captured audio a sample is rejected as too short.
pub const MIN_RECORDING_MS: u64 = 1000;

/// Downstream calls time out after this multiple of the recording length.
pub const SERVICE_TIMEOUT_FACTOR: u64 = 3;

/// Default base URL of the analysis service.
pub const SERVICE_BASE_URL: &str = "http://localhost:8000";

/// Transcription endpoint (takes the expected phrase as a query parameter).
pub const TRANSCRIBE_PATH: &str = "/listen/";

/// Embedding extraction endpoint.
pub const EXTRACT_EMBEDDING_PATH: &str = "/extract-embedding/";

/// Speaker verification endpoint (compares against the enrolled voiceprint).
pub const VERIFY_SPEAKER_PATH: &str = "/verify-embedding/";

/// Liveness / deepfake classification endpoint.
pub const LIVENESS_PATH: &str = "/deepfake-auth-predict/";

/// Voiceprint records the speaker verifier compares against, one per account.
pub const VOICEPRINTS_PATH: &str = "/voiceprints/";

/// Number of enrollment rounds. Not configurable.
pub const ENROLLMENT_ROUNDS: usize = 3;

/// Capture attempts allowed per enrollment round before the flow gives up.
pub const ENROLLMENT_ATTEMPTS_PER_ROUND: u32 = 3;

/// Words per verification challenge phrase.
pub const CHALLENGE_WORDS: usize = 6;

/// Number of digits in a one-time code.
pub const OTP_DIGITS: usize = 6;

/// One-time code lifetime in seconds (10 minutes).
pub const OTP_TTL_SECS: u64 = 600;

/// Transactional mail API used to deliver one-time codes.
pub const MAIL_ENDPOINT: &str = "https://api.brevo.com/v3/smtp/email";

/// Display name on outgoing code emails.
pub const MAIL_SENDER_NAME: &str = "Audio Shield";

/// Subject line on outgoing code emails.
pub const MAIL_SUBJECT: &str = "Your Audio Shield Verification Code";

/// Upper bound on any single identity, mail or record-store request, in seconds.
pub const HTTP_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on establishing an HTTP connection, in seconds.
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Identity provider REST endpoint.
pub const IDENTITY_ENDPOINT: &str = "https://identitytoolkit.googleapis.com/v1";

/// Interval at which the capture loop drains the audio source.
pub const CAPTURE_POLL_MS: u64 = 20;

/// Voice attempts a sign-in allows, each with a fresh phrase.
pub const SIGN_IN_VOICE_ATTEMPTS: u32 = 3;

/// Wrong codes a sign-in tolerates before giving up. Each one revokes the
/// outstanding code and triggers a new one.
pub const SIGN_IN_CODE_ATTEMPTS: u32 = 3;
