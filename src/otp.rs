//! Time-boxed one-time codes: issuance, supersession and validation.

use crate::defaults;
use crate::error::Result;
use crate::identity::AccountId;
use crate::store::OtpStore;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A six-digit numeric code. `Debug` never prints the digits.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OtpCode(String);

impl OtpCode {
    /// Draw a code uniformly from 000000..=999999.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let value: u32 = rng.gen_range(0..1_000_000);
        Self(format!("{:0width$}", value, width = defaults::OTP_DIGITS))
    }

    /// Accept user input of exactly six ASCII digits, ignoring surrounding whitespace.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.len() == defaults::OTP_DIGITS && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(trimmed.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare without short-circuiting on the first differing digit.
    pub fn matches(&self, other: &OtpCode) -> bool {
        let (a, b) = (self.0.as_bytes(), other.0.as_bytes());
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl fmt::Debug for OtpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OtpCode(******)")
    }
}

/// The latest code issued to an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtpRecord {
    pub code: OtpCode,
    pub account_id: AccountId,
    pub created_at: DateTime<Utc>,
    pub consumed: bool,
}

impl OtpRecord {
    pub fn expires_at(&self, ttl: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Valid up to and including `created_at + ttl`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now > self.expires_at(ttl)
    }
}

/// Outcome of checking a submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpValidation {
    Ok,
    Expired,
    Mismatch,
    NotFound,
}

impl fmt::Display for OtpValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OtpValidation::Ok => "ok",
            OtpValidation::Expired => "expired",
            OtpValidation::Mismatch => "mismatch",
            OtpValidation::NotFound => "not found",
        };
        f.write_str(text)
    }
}

/// Issues and validates codes against an [`OtpStore`].
#[derive(Clone)]
pub struct OtpChallenge {
    store: Arc<dyn OtpStore>,
    ttl: Duration,
}

impl OtpChallenge {
    pub fn new(store: Arc<dyn OtpStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh code, replacing any earlier record for the account.
    pub async fn issue(&self, account: &AccountId, now: DateTime<Utc>) -> Result<OtpRecord> {
        let code = OtpCode::generate(&mut rand::rngs::OsRng);
        self.issue_code(account, code, now).await
    }

    /// Store `code` for `account`, replacing any earlier record.
    async fn issue_code(
        &self,
        account: &AccountId,
        code: OtpCode,
        now: DateTime<Utc>,
    ) -> Result<OtpRecord> {
        let record = OtpRecord {
            code,
            account_id: account.clone(),
            created_at: now,
            consumed: false,
        };
        self.store.put_otp(record.clone()).await?;
        tracing::info!(account = %account, expires_at = %record.expires_at(self.ttl), "one-time code issued");
        Ok(record)
    }

    /// Check `submitted` against the live record and consume it on success.
    ///
    /// Checked in order: no unconsumed record, expiry, code mismatch.
    pub async fn validate(
        &self,
        account: &AccountId,
        submitted: &str,
        now: DateTime<Utc>,
    ) -> Result<OtpValidation> {
        let outcome = self.check(account, submitted, now).await?;
        tracing::info!(account = %account, outcome = %outcome, "one-time code validated");
        Ok(outcome)
    }

    async fn check(
        &self,
        account: &AccountId,
        submitted: &str,
        now: DateTime<Utc>,
    ) -> Result<OtpValidation> {
        let record = match self.store.otp(account).await? {
            Some(record) if !record.consumed => record,
            _ => return Ok(OtpValidation::NotFound),
        };

        if record.is_expired(now, self.ttl) {
            return Ok(OtpValidation::Expired);
        }

        let matched = OtpCode::parse(submitted).is_some_and(|code| record.code.matches(&code));
        if !matched {
            return Ok(OtpValidation::Mismatch);
        }

        // Lost a race with a concurrent validation or a newer issue.
        if !self.store.mark_consumed(account, &record.code).await? {
            return Ok(OtpValidation::NotFound);
        }
        Ok(OtpValidation::Ok)
    }

    /// Drop the account's record so only a newly issued code can succeed.
    pub async fn revoke(&self, account: &AccountId) -> Result<()> {
        if self.store.remove_otp(account).await? {
            tracing::debug!(account = %account, "one-time code revoked");
        }
        Ok(())
    }
}
