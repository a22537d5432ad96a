//! Multi-factor sign-in: password, then voice, then one-time code.
//!
//! Each factor is a type that can only be obtained by passing the previous
//! one. [`decide`] is the single place that turns the collected evidence
//! into a decision; the [`Authenticator`] methods just gather evidence and
//! ask it.

use crate::audio::microphone::Microphone;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dispatch::{CodeDispatcher, Recipient};
use crate::enrollment::{EnrollmentFlow, EnrollmentPolicy};
use crate::error::{Result, ShieldError};
use crate::identity::{AccountId, Identity, IdentityProvider};
use crate::otp::{OtpChallenge, OtpCode, OtpValidation};
use crate::phrase::{ChallengePhrase, PhraseGenerator};
use crate::store::{OtpStore, VoicePrintStore, delete_account_records};
use crate::verification::{Analyzers, VerificationFlow, VerificationPolicy, VerificationVerdict};
use crate::voiceprint::VoicePrint;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result of the password factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordCheck {
    Passed(DateTime<Utc>),
    Failed,
}

/// Result of the one-time code factor and when it was checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtpCheck {
    pub result: OtpValidation,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    /// Everything so far passed; a later factor is still missing.
    Pending,
    RejectedPassword,
    RejectedVoice,
    RejectedOtpExpired,
    RejectedOtpMismatch,
}

/// Decide a sign-in from the evidence gathered so far.
///
/// Factors are evaluated in order and the first failure wins; later
/// evidence is not looked at. Evidence must be in time order: a verdict
/// older than the password check, or a code checked before the verdict,
/// does not count. A code that was never issued or was already used is
/// treated as expired.
pub fn decide(
    account: &AccountId,
    password: PasswordCheck,
    verdict: Option<&VerificationVerdict>,
    otp: Option<OtpCheck>,
) -> Decision {
    let password_at = match password {
        PasswordCheck::Passed(at) => at,
        PasswordCheck::Failed => return Decision::RejectedPassword,
    };

    let Some(verdict) = verdict else {
        return Decision::Pending;
    };
    if !verdict.passed() || verdict.account_id() != account || verdict.resolved_at() < password_at
    {
        return Decision::RejectedVoice;
    }

    let Some(otp) = otp else {
        return Decision::Pending;
    };
    if otp.at < verdict.resolved_at() {
        return Decision::RejectedOtpExpired;
    }
    match otp.result {
        OtpValidation::Ok => Decision::Granted,
        OtpValidation::Mismatch => Decision::RejectedOtpMismatch,
        OtpValidation::Expired | OtpValidation::NotFound => Decision::RejectedOtpExpired,
    }
}

/// Proof that the password factor passed.
#[derive(Debug, Clone)]
pub struct PasswordVerified {
    identity: Identity,
    at: DateTime<Utc>,
}

impl PasswordVerified {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn verified_at(&self) -> DateTime<Utc> {
        self.at
    }
}

/// Proof that password and voice passed and a code was issued.
///
/// The proof is spent once a code is accepted or found expired; clones share
/// that state. It also goes stale one code lifetime after the verdict, after
/// which no new code is sent for it.
#[derive(Debug, Clone)]
pub struct VoiceVerified {
    identity: Identity,
    password_at: DateTime<Utc>,
    verdict: VerificationVerdict,
    spent: Arc<AtomicBool>,
}

impl VoiceVerified {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn verdict(&self) -> &VerificationVerdict {
        &self.verdict
    }

    pub fn is_spent(&self) -> bool {
        self.spent.load(Ordering::SeqCst)
    }

    fn spend(&self) {
        self.spent.store(true, Ordering::SeqCst);
    }

    fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.verdict.resolved_at() > ttl,
            Err(_) => false,
        }
    }
}

/// A fully authenticated sign-in.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub identity: Identity,
    pub verdict: VerificationVerdict,
    pub password_at: DateTime<Utc>,
    pub authenticated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum VoiceStage {
    /// A code was issued. `dispatch_error` is set when sending it failed;
    /// the code stays valid and can be re-sent.
    Verified {
        voice: VoiceVerified,
        dispatch_error: Option<ShieldError>,
    },
    Rejected(VerificationVerdict),
}

/// How a sign-in ended.
#[derive(Debug, Clone)]
pub enum SignInOutcome {
    Authenticated(AuthenticatedSession),
    RejectedPassword,
    RejectedVoice(VerificationVerdict),
    RejectedOtpExpired,
    RejectedOtpMismatch,
    Aborted,
}

impl SignInOutcome {
    /// Outcome implied by an error, for the errors that end a sign-in.
    pub fn from_error(error: &ShieldError) -> Option<Self> {
        match error {
            ShieldError::InvalidCredentials => Some(SignInOutcome::RejectedPassword),
            ShieldError::Aborted => Some(SignInOutcome::Aborted),
            ShieldError::SignInExpired => Some(SignInOutcome::RejectedOtpExpired),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SignInOutcome::Authenticated(_))
    }
}

/// Policy values the authenticator hands to the flows it builds.
#[derive(Debug, Clone, Copy)]
pub struct AuthSettings {
    pub enrollment: EnrollmentPolicy,
    pub verification: VerificationPolicy,
    pub otp_ttl: Duration,
    pub challenge_words: usize,
}

impl AuthSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enrollment: EnrollmentPolicy::from_config(config),
            verification: VerificationPolicy::from_config(config),
            otp_ttl: config.otp_ttl(),
            challenge_words: config.challenge.word_count,
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enrollment: EnrollmentPolicy::default(),
            verification: VerificationPolicy::default(),
            otp_ttl: Duration::from_secs(crate::defaults::OTP_TTL_SECS),
            challenge_words: crate::defaults::CHALLENGE_WORDS,
        }
    }
}

/// External collaborators of the authenticator.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub voiceprints: Arc<dyn VoicePrintStore>,
    pub otps: Arc<dyn OtpStore>,
    pub dispatcher: Arc<dyn CodeDispatcher>,
    pub microphone: Microphone,
    pub analyzers: Analyzers,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Collaborators on the system clock.
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        voiceprints: Arc<dyn VoicePrintStore>,
        otps: Arc<dyn OtpStore>,
        dispatcher: Arc<dyn CodeDispatcher>,
        microphone: Microphone,
        analyzers: Analyzers,
    ) -> Self {
        Self {
            identity,
            voiceprints,
            otps,
            dispatcher,
            microphone,
            analyzers,
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct Authenticator {
    parts: Collaborators,
    settings: AuthSettings,
    otp: OtpChallenge,
    phrases: Mutex<PhraseGenerator>,
}

impl Authenticator {
    pub fn new(parts: Collaborators, settings: AuthSettings) -> Self {
        let otp = OtpChallenge::new(parts.otps.clone(), settings.otp_ttl);
        Self {
            otp,
            phrases: Mutex::new(PhraseGenerator::new(settings.challenge_words)),
            parts,
            settings,
        }
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    /// Create an account. The caller enrolls a voiceprint next.
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<Identity> {
        let identity = self.parts.identity.sign_up(email, password).await?;
        tracing::info!(account = %identity.account_id, "account created");
        Ok(identity)
    }

    /// First factor.
    pub async fn check_password(&self, email: &str, password: &str) -> Result<PasswordVerified> {
        let identity = self.parts.identity.sign_in(email, password).await?;
        tracing::info!(account = %identity.account_id, "password accepted");
        Ok(PasswordVerified {
            identity,
            at: self.parts.clock.now(),
        })
    }

    pub async fn send_password_reset(&self, email: &str) -> Result<()> {
        self.parts.identity.send_password_reset(email).await
    }

    pub async fn has_voiceprint(&self, account: &AccountId) -> Result<bool> {
        Ok(self.parts.voiceprints.voiceprint(account).await?.is_some())
    }

    /// A fresh challenge phrase, never the same as the previous one.
    pub fn next_phrase(&self) -> ChallengePhrase {
        match self.phrases.lock() {
            Ok(mut phrases) => phrases.next_phrase(),
            Err(poisoned) => poisoned.into_inner().next_phrase(),
        }
    }

    /// A new enrollment flow on the shared microphone.
    pub fn enrollment_flow(&self) -> EnrollmentFlow {
        EnrollmentFlow::new(
            self.parts.microphone.clone(),
            self.parts.analyzers.embeddings.clone(),
            self.settings.enrollment,
        )
        .with_clock(self.parts.clock.clone())
    }

    /// A new verification flow for one attempt.
    pub fn verification_flow(&self) -> VerificationFlow {
        VerificationFlow::new(
            self.parts.microphone.clone(),
            self.parts.analyzers.clone(),
            self.settings.verification,
        )
        .with_clock(self.parts.clock.clone())
    }

    /// Run enrollment for `identity` and store the voiceprint.
    ///
    /// Nothing is stored unless all rounds succeed and the flow was not
    /// cancelled. An earlier voiceprint is replaced.
    pub async fn enroll(
        &self,
        identity: &Identity,
        flow: &EnrollmentFlow,
        cancel: CancellationToken,
    ) -> Result<VoicePrint> {
        let voiceprint = flow.run(&identity.account_id, cancel.clone()).await?;
        if cancel.is_cancelled() {
            return Err(ShieldError::Aborted);
        }
        self.parts.voiceprints.persist_voiceprint(&voiceprint).await?;
        tracing::info!(
            account = %identity.account_id,
            dimension = voiceprint.dimension(),
            "voiceprint enrolled"
        );
        Ok(voiceprint)
    }

    /// Second factor. On a passing verdict a one-time code is issued and sent.
    pub async fn verify_voice(
        &self,
        password: &PasswordVerified,
        flow: &VerificationFlow,
        phrase: ChallengePhrase,
        cancel: CancellationToken,
    ) -> Result<VoiceStage> {
        let account = &password.identity.account_id;
        let verdict = flow.run(account, phrase, cancel.clone()).await?;
        if cancel.is_cancelled() {
            return Err(ShieldError::Aborted);
        }

        let decision = decide(
            account,
            PasswordCheck::Passed(password.at),
            Some(&verdict),
            None,
        );
        if decision != Decision::Pending {
            tracing::info!(account = %account, "voice factor rejected");
            return Ok(VoiceStage::Rejected(verdict));
        }

        let voice = VoiceVerified {
            identity: password.identity.clone(),
            password_at: password.at,
            verdict,
            spent: Arc::new(AtomicBool::new(false)),
        };
        let dispatch_error = self.issue_and_send(&voice.identity).await?.err();
        Ok(VoiceStage::Verified {
            voice,
            dispatch_error,
        })
    }

    /// Issue a new code, superseding the previous one, and send it.
    ///
    /// Refused with [`ShieldError::SignInExpired`] once the proof is spent or
    /// stale; the caller has to start the sign-in again.
    pub async fn resend_code(&self, voice: &VoiceVerified) -> Result<()> {
        if voice.is_spent() || voice.is_stale(self.parts.clock.now(), self.settings.otp_ttl) {
            tracing::info!(account = %voice.identity.account_id, "resend refused for finished sign-in");
            return Err(ShieldError::SignInExpired);
        }
        self.issue_and_send(&voice.identity).await?
    }

    /// Third factor.
    ///
    /// A wrong code revokes the outstanding one; a new code must be sent
    /// before trying again. An accepted or expired code spends `voice`.
    pub async fn confirm_code(&self, voice: &VoiceVerified, code: &str) -> Result<SignInOutcome> {
        let account = &voice.identity.account_id;
        if voice.is_spent() {
            return Ok(SignInOutcome::RejectedOtpExpired);
        }
        let now = self.parts.clock.now();
        let result = self.otp.validate(account, code, now).await?;

        let decision = decide(
            account,
            PasswordCheck::Passed(voice.password_at),
            Some(&voice.verdict),
            Some(OtpCheck { result, at: now }),
        );
        let outcome = match decision {
            Decision::Granted => {
                voice.spend();
                SignInOutcome::Authenticated(AuthenticatedSession {
                    identity: voice.identity.clone(),
                    verdict: voice.verdict.clone(),
                    password_at: voice.password_at,
                    authenticated_at: now,
                })
            }
            Decision::RejectedOtpMismatch => {
                self.otp.revoke(account).await?;
                SignInOutcome::RejectedOtpMismatch
            }
            Decision::RejectedPassword => SignInOutcome::RejectedPassword,
            Decision::RejectedVoice => SignInOutcome::RejectedVoice(voice.verdict.clone()),
            Decision::RejectedOtpExpired | Decision::Pending => {
                voice.spend();
                SignInOutcome::RejectedOtpExpired
            }
        };
        tracing::info!(
            account = %account,
            authenticated = outcome.is_authenticated(),
            "sign-in decided"
        );
        Ok(outcome)
    }

    /// Delete the account and everything stored for it.
    pub async fn delete_account(&self, password: PasswordVerified) -> Result<()> {
        delete_account_records(
            self.parts.voiceprints.as_ref(),
            self.parts.otps.as_ref(),
            &password.identity.account_id,
        )
        .await?;
        self.parts.identity.delete_account(&password.identity).await?;
        tracing::info!(account = %password.identity.account_id, "account deleted");
        Ok(())
    }

    /// Store a new code, then try to send it. The outer error is a storage
    /// failure; the inner one a delivery failure that leaves the code valid.
    async fn issue_and_send(&self, identity: &Identity) -> Result<Result<()>> {
        let record = self
            .otp
            .issue(&identity.account_id, self.parts.clock.now())
            .await?;
        Ok(self.send(identity, &record.code).await)
    }

    async fn send(&self, identity: &Identity, code: &OtpCode) -> Result<()> {
        let recipient = Recipient {
            account_id: identity.account_id.clone(),
            email: identity.email.clone(),
        };
        let sent = self.parts.dispatcher.dispatch(&recipient, code).await;
        if let Err(e) = &sent {
            tracing::warn!(account = %identity.account_id, error = %e, "code dispatch failed");
        }
        sent
    }
}
