//! Interactive command handlers.
//!
//! Wires the real collaborators (microphone, HTTP services, identity
//! provider, mail API, JSON store) into an [`Authenticator`] and drives the
//! enrollment and sign-in flows from the terminal.

use crate::audio::capture::CpalAudioSource;
use crate::audio::microphone::Microphone;
use crate::audio::sample::AudioSample;
use crate::config::Config;
use crate::defaults;
use crate::dispatch::{BrevoDispatcher, CodeDispatcher, ConsoleDispatcher};
use crate::enrollment::EnrollmentPhase;
use crate::error::{ErrorKind, Result, ShieldError};
use crate::identity::{FirebaseIdentity, IdentityProvider};
use crate::output;
use crate::phrase::PhraseGenerator;
use crate::services::http::ServiceClient;
use crate::services::{LivenessClient, LivenessResult, Service, with_timeout};
use crate::session::{Authenticator, AuthSettings, Collaborators, SignInOutcome, VoiceStage, VoiceVerified};
use crate::store::{JsonFileStore, VoicePrintStore};
use crate::verification::{Analyzers, VerificationPhase};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How sign-in codes are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeDelivery {
    Email,
    Console,
}

/// Build the authenticator from configuration.
pub fn build_authenticator(config: &Config, delivery: CodeDelivery) -> Result<Authenticator> {
    let services = Arc::new(ServiceClient::from_config(&config.services)?);
    let identity: Arc<dyn IdentityProvider> =
        Arc::new(FirebaseIdentity::from_config(&config.identity)?);
    // The speaker verifier reads voiceprints from its own store; codes stay local.
    let voiceprints: Arc<dyn VoicePrintStore> = services.clone();
    let otps = Arc::new(JsonFileStore::new(config.data_dir()?));
    let dispatcher: Arc<dyn CodeDispatcher> = match delivery {
        CodeDelivery::Email => Arc::new(BrevoDispatcher::from_config(
            &config.mail,
            config.otp_ttl(),
        )?),
        CodeDelivery::Console => Arc::new(ConsoleDispatcher),
    };

    let source = CpalAudioSource::new(config.audio.device.as_deref(), config.audio.sample_rate)?;
    let microphone =
        Microphone::new(Box::new(source)).with_min_duration(config.audio.min_recording());

    let analyzers = Analyzers {
        transcripts: services.clone(),
        embeddings: services.clone(),
        liveness: services,
    };
    let parts = Collaborators::new(
        identity,
        voiceprints,
        otps,
        dispatcher,
        microphone,
        analyzers,
    );
    Ok(Authenticator::new(parts, AuthSettings::from_config(config)))
}

/// Cancellation token fired by Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

/// Disables terminal echo while alive.
struct EchoGuard {
    fd: libc::c_int,
    original: Option<libc::termios>,
}

impl EchoGuard {
    fn disable(fd: libc::c_int) -> Self {
        // SAFETY: termios is plain old data; tcgetattr fills it in or fails
        // and we only call tcsetattr with a value it produced.
        unsafe {
            let mut term: libc::termios = std::mem::zeroed();
            if libc::isatty(fd) == 1 && libc::tcgetattr(fd, &mut term) == 0 {
                let original = term;
                term.c_lflag &= !libc::ECHO;
                if libc::tcsetattr(fd, libc::TCSANOW, &term) == 0 {
                    return Self {
                        fd,
                        original: Some(original),
                    };
                }
            }
        }
        Self { fd, original: None }
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original {
            // SAFETY: restores the attributes read in `disable`.
            unsafe {
                libc::tcsetattr(self.fd, libc::TCSANOW, &original);
            }
        }
    }
}

fn read_line(prompt: &str, secret: bool) -> Result<String> {
    eprint!("{prompt}");
    io::stderr().flush().ok();

    let echo = secret.then(|| EchoGuard::disable(libc::STDIN_FILENO));
    let mut line = String::new();
    let read = io::stdin().lock().read_line(&mut line)?;
    if echo.is_some() {
        eprintln!();
    }
    drop(echo);

    if read == 0 {
        return Err(ShieldError::Aborted);
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Prompt on the terminal. Ctrl-C or end of input aborts.
async fn prompt(text: &str, secret: bool, cancel: &CancellationToken) -> Result<String> {
    let text = text.to_string();
    let reader = tokio::task::spawn_blocking(move || read_line(&text, secret));
    tokio::select! {
        _ = cancel.cancelled() => Err(ShieldError::Aborted),
        line = reader => line.map_err(|e| ShieldError::Other(format!("prompt failed: {}", e)))?,
    }
}

async fn email_or_prompt(email: Option<String>, cancel: &CancellationToken) -> Result<String> {
    match email {
        Some(email) => Ok(email),
        None => Ok(prompt("Email: ", false, cancel).await?.trim().to_string()),
    }
}

/// Redraw the recording countdown until `phases` changes. Returns false once
/// the sender is gone.
async fn countdown<T>(phases: &mut watch::Receiver<T>, total: Duration) -> bool {
    let started = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            changed = phases.changed() => {
                output::clear_line();
                return changed.is_ok();
            }
            _ = ticker.tick() => output::render_recording_bar(started.elapsed(), total),
        }
    }
}

async fn follow_enrollment(mut phases: watch::Receiver<EnrollmentPhase>, recording: Duration) {
    loop {
        let phase = phases.borrow_and_update().clone();
        // The caller prints the final state once the run returns.
        if !matches!(
            phase,
            EnrollmentPhase::Completed | EnrollmentPhase::Failed { .. }
        ) {
            output::render_enrollment_phase(&phase);
        }
        let alive = if matches!(phase, EnrollmentPhase::Capturing { .. }) {
            countdown(&mut phases, recording).await
        } else {
            phases.changed().await.is_ok()
        };
        if !alive {
            break;
        }
    }
}

async fn follow_verification(mut phases: watch::Receiver<VerificationPhase>, recording: Duration) {
    loop {
        let phase = phases.borrow_and_update().clone();
        output::render_verification_phase(&phase);
        let alive = if phase == VerificationPhase::Capturing {
            countdown(&mut phases, recording).await
        } else {
            phases.changed().await.is_ok()
        };
        if !alive {
            break;
        }
    }
}

/// Create an account (or sign in to one) and enroll its voiceprint.
pub async fn run_enroll(
    config: &Config,
    existing: bool,
    email: Option<String>,
    quiet: bool,
) -> Result<()> {
    let auth = build_authenticator(config, CodeDelivery::Console)?;
    let cancel = interrupt_token();
    let email = email_or_prompt(email, &cancel).await?;
    let password = prompt("Password: ", true, &cancel).await?;

    let identity = if existing {
        auth.check_password(&email, &password).await?.identity().clone()
    } else {
        let confirm = prompt("Confirm password: ", true, &cancel).await?;
        if confirm != password {
            return Err(ShieldError::Other("Passwords do not match".to_string()));
        }
        auth.sign_up(&email, &password).await?
    };

    if !quiet {
        eprintln!(
            "Read each sentence aloud when the red dot appears. Each recording lasts {}s.",
            config.audio.recording_secs
        );
    }
    let flow = auth.enrollment_flow();
    let follower = (!quiet).then(|| {
        tokio::spawn(follow_enrollment(
            flow.subscribe(),
            auth.settings().enrollment.recording,
        ))
    });
    let result = auth.enroll(&identity, &flow, cancel).await;
    if let Some(follower) = follower {
        follower.abort();
        output::render_enrollment_phase(&flow.phase());
    }

    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            if !existing {
                eprintln!(
                    "Your account was created. Finish with `audioshield enroll --existing`."
                );
            }
            Err(e)
        }
    }
}

/// Password, then voice, then an emailed code.
pub async fn run_sign_in(
    config: &Config,
    email: Option<String>,
    delivery: CodeDelivery,
    quiet: bool,
) -> Result<SignInOutcome> {
    let auth = build_authenticator(config, delivery)?;
    let cancel = interrupt_token();

    let outcome = match sign_in(&auth, email, quiet, &cancel).await {
        Ok(outcome) => outcome,
        Err(e) => match SignInOutcome::from_error(&e) {
            Some(outcome) => outcome,
            None => return Err(e),
        },
    };
    output::render_outcome(&outcome);
    Ok(outcome)
}

async fn sign_in(
    auth: &Authenticator,
    email: Option<String>,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<SignInOutcome> {
    let email = email_or_prompt(email, cancel).await?;
    let password = prompt("Password: ", true, cancel).await?;
    let password = auth.check_password(&email, &password).await?;

    let account = &password.identity().account_id;
    if !auth.has_voiceprint(account).await? {
        return Err(ShieldError::Other(
            "No voiceprint enrolled for this account. Run `audioshield enroll --existing` first."
                .to_string(),
        ));
    }

    let recording = auth.settings().verification.recording;
    let mut attempt = 0;
    let voice = loop {
        attempt += 1;
        let phrase = auth.next_phrase();
        eprintln!("Say: \"{}\"", phrase);

        let flow = auth.verification_flow();
        let follower =
            (!quiet).then(|| tokio::spawn(follow_verification(flow.subscribe(), recording)));
        let stage = auth
            .verify_voice(&password, &flow, phrase, cancel.clone())
            .await;
        if let Some(follower) = follower {
            follower.abort();
            output::clear_line();
        }

        match stage {
            Ok(VoiceStage::Verified {
                voice,
                dispatch_error,
            }) => {
                output::render_verdict(voice.verdict());
                if let Some(e) = dispatch_error {
                    eprintln!("{e}. Type 'r' to resend the code.");
                }
                break voice;
            }
            Ok(VoiceStage::Rejected(verdict)) => {
                output::render_verdict(&verdict);
                if attempt >= defaults::SIGN_IN_VOICE_ATTEMPTS {
                    return Ok(SignInOutcome::RejectedVoice(verdict));
                }
                eprintln!("Let's try again with a new phrase.");
            }
            Err(e)
                if e.kind() == ErrorKind::Input
                    && e.is_recapture_worthy()
                    && attempt < defaults::SIGN_IN_VOICE_ATTEMPTS =>
            {
                eprintln!("{e}. Let's try again.");
            }
            Err(e) => return Err(e),
        }
    };

    confirm_code(auth, &voice, cancel).await
}

async fn confirm_code(
    auth: &Authenticator,
    voice: &VoiceVerified,
    cancel: &CancellationToken,
) -> Result<SignInOutcome> {
    eprintln!(
        "A verification code was sent to {}. It expires in {} minutes.",
        voice.identity().email,
        auth.settings().otp_ttl.as_secs().div_ceil(60)
    );

    let mut mismatches = 0;
    loop {
        let code = prompt("Code (r to resend): ", false, cancel).await?;
        let code = code.trim();
        if code.eq_ignore_ascii_case("r") {
            match auth.resend_code(voice).await {
                Ok(()) => eprintln!("A new code was sent."),
                Err(e) => match SignInOutcome::from_error(&e) {
                    Some(outcome) => return Ok(outcome),
                    None => eprintln!("{e}"),
                },
            }
            continue;
        }

        match auth.confirm_code(voice, code).await? {
            SignInOutcome::RejectedOtpMismatch => {
                mismatches += 1;
                if mismatches >= defaults::SIGN_IN_CODE_ATTEMPTS {
                    return Ok(SignInOutcome::RejectedOtpMismatch);
                }
                output::render_outcome(&SignInOutcome::RejectedOtpMismatch);
                match auth.resend_code(voice).await {
                    Ok(()) => eprintln!("That code is no longer valid. A new one was sent."),
                    Err(e) => match SignInOutcome::from_error(&e) {
                        Some(outcome) => return Ok(outcome),
                        None => eprintln!("{e}. Type 'r' to try sending again."),
                    },
                }
            }
            outcome => return Ok(outcome),
        }
    }
}

/// Liveness check of a WAV file.
pub async fn run_detect(config: &Config, file: &Path, json: bool) -> Result<LivenessResult> {
    let bytes = tokio::fs::read(file).await?;
    let sample = AudioSample::from_wav_bytes(bytes)?;
    let client = ServiceClient::from_config(&config.services)?;
    tracing::debug!(
        file = %file.display(),
        duration_ms = sample.duration().as_millis() as u64,
        "classifying file"
    );

    let result = with_timeout(
        Service::Liveness,
        config.service_timeout(),
        client.classify(&sample),
    )
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{} ({:.0}%)", result.label, result.confidence * 100.0);
    }
    Ok(result)
}

/// Print a fresh challenge phrase.
pub fn run_phrase(config: &Config, words: Option<usize>) {
    let mut generator = PhraseGenerator::new(words.unwrap_or(config.challenge.word_count));
    println!("{}", generator.next_phrase());
}

pub async fn run_reset_password(config: &Config, email: Option<String>) -> Result<()> {
    let identity = FirebaseIdentity::from_config(&config.identity)?;
    let cancel = interrupt_token();
    let email = email_or_prompt(email, &cancel).await?;
    identity.send_password_reset(&email).await?;
    eprintln!("If {email} has an account, a reset link is on its way.");
    Ok(())
}

pub async fn run_delete_account(config: &Config, email: Option<String>, yes: bool) -> Result<()> {
    let auth = build_authenticator(config, CodeDelivery::Console)?;
    let cancel = interrupt_token();
    let email = email_or_prompt(email, &cancel).await?;
    let password = prompt("Password: ", true, &cancel).await?;
    let password = auth.check_password(&email, &password).await?;

    if !yes {
        let answer = prompt(
            "This permanently deletes the account and its voiceprint. Type 'delete' to confirm: ",
            false,
            &cancel,
        )
        .await?;
        if answer.trim() != "delete" {
            return Err(ShieldError::Aborted);
        }
    }

    auth.delete_account(password).await?;
    eprintln!("Account {email} deleted.");
    Ok(())
}
