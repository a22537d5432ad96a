//! Account identity and the external identity provider.
//!
//! Password storage and session tokens belong to the provider; this crate
//! only asks it whether a password is right and who the account is.

use crate::error::{Result, ShieldError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Stable account identifier issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A signed-in account.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub account_id: AccountId,
    /// Delivery address for one-time codes. Never used as a key.
    pub email: String,
    id_token: String,
}

impl Identity {
    pub fn new(account_id: AccountId, email: impl Into<String>, id_token: impl Into<String>) -> Self {
        Self {
            account_id,
            email: email.into(),
            id_token: id_token.into(),
        }
    }

    pub fn id_token(&self) -> &str {
        &self.id_token
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("account_id", &self.account_id)
            .field("email", &self.email)
            .field("id_token", &"<redacted>")
            .finish()
    }
}

/// Trait for the identity provider.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Check a password. Wrong credentials are `ShieldError::InvalidCredentials`.
    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<Identity>;

    /// Ask the provider to email a password-reset link.
    async fn send_password_reset(&self, email: &str) -> Result<()>;

    async fn delete_account(&self, identity: &Identity) -> Result<()>;
}

/// Map provider error codes onto crate errors.
fn map_provider_error(code: &str) -> ShieldError {
    // Codes may carry a suffix, e.g. "WEAK_PASSWORD : Password should be at least 6 characters"
    let head = code.split([' ', ':']).next().unwrap_or(code);
    match head {
        "INVALID_LOGIN_CREDENTIALS" | "INVALID_PASSWORD" | "EMAIL_NOT_FOUND" | "USER_DISABLED"
        | "INVALID_EMAIL" | "MISSING_PASSWORD" => ShieldError::InvalidCredentials,
        _ => ShieldError::Identity {
            message: code.to_string(),
        },
    }
}

#[cfg(feature = "http")]
mod firebase {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::defaults;
    use crate::services::http::build_client;
    use serde_json::json;
    use std::time::Duration;

    /// Identity provider backed by the Firebase Auth REST API.
    #[derive(Debug, Clone)]
    pub struct FirebaseIdentity {
        client: reqwest::Client,
        endpoint: String,
        api_key: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct AuthResponse {
        local_id: String,
        email: Option<String>,
        id_token: String,
    }

    #[derive(Debug, Deserialize)]
    struct ErrorEnvelope {
        error: ErrorDetail,
    }

    #[derive(Debug, Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    impl FirebaseIdentity {
        pub fn from_config(config: &IdentityConfig) -> Result<Self> {
            let api_key = config
                .api_key
                .clone()
                .filter(|key| !key.is_empty())
                .ok_or_else(|| ShieldError::ConfigInvalidValue {
                    key: "identity.api_key".to_string(),
                    message: "required (or set AUDIOSHIELD_IDENTITY_API_KEY)".to_string(),
                })?;
            Ok(Self {
                client: build_client(Duration::from_secs(defaults::HTTP_REQUEST_TIMEOUT_SECS))?,
                endpoint: config.endpoint.trim_end_matches('/').to_string(),
                api_key,
            })
        }

        async fn call<R: serde::de::DeserializeOwned>(
            &self,
            method: &str,
            body: serde_json::Value,
        ) -> Result<R> {
            let url = format!("{}/accounts:{}", self.endpoint, method);
            let response = self
                .client
                .post(&url)
                .query(&[("key", self.api_key.as_str())])
                .json(&body)
                .send()
                .await
                .map_err(|e| ShieldError::Identity {
                    message: e.to_string(),
                })?;

            let status = response.status();
            let bytes = response.bytes().await.map_err(|e| ShieldError::Identity {
                message: e.to_string(),
            })?;

            if !status.is_success() {
                return Err(match serde_json::from_slice::<ErrorEnvelope>(&bytes) {
                    Ok(envelope) => map_provider_error(&envelope.error.message),
                    Err(_) => ShieldError::Identity {
                        message: format!("HTTP {}", status.as_u16()),
                    },
                });
            }

            serde_json::from_slice(&bytes).map_err(|e| ShieldError::Identity {
                message: format!("malformed response: {}", e),
            })
        }

        async fn authenticate(&self, method: &str, email: &str, password: &str) -> Result<Identity> {
            let response: AuthResponse = self
                .call(
                    method,
                    json!({ "email": email, "password": password, "returnSecureToken": true }),
                )
                .await?;
            Ok(Identity::new(
                AccountId::new(response.local_id),
                response.email.unwrap_or_else(|| email.to_string()),
                response.id_token,
            ))
        }
    }

    #[async_trait::async_trait]
    impl IdentityProvider for FirebaseIdentity {
        async fn sign_in(&self, email: &str, password: &str) -> Result<Identity> {
            self.authenticate("signInWithPassword", email, password).await
        }

        async fn sign_up(&self, email: &str, password: &str) -> Result<Identity> {
            self.authenticate("signUp", email, password).await
        }

        async fn send_password_reset(&self, email: &str) -> Result<()> {
            let _: serde_json::Value = self
                .call(
                    "sendOobCode",
                    json!({ "requestType": "PASSWORD_RESET", "email": email }),
                )
                .await?;
            Ok(())
        }

        async fn delete_account(&self, identity: &Identity) -> Result<()> {
            let _: serde_json::Value = self
                .call("delete", json!({ "idToken": identity.id_token() }))
                .await?;
            Ok(())
        }
    }
}

#[cfg(feature = "http")]
pub use firebase::FirebaseIdentity;

#[derive(Debug, Clone)]
struct MockAccount {
    password: String,
    account_id: AccountId,
}

/// In-memory identity provider for testing
#[derive(Debug, Clone, Default)]
pub struct MockIdentityProvider {
    accounts: Arc<Mutex<HashMap<String, MockAccount>>>,
    resets: Arc<Mutex<Vec<String>>>,
    unavailable: bool,
}

impl MockIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account
    pub fn with_account(self, email: &str, password: &str, account_id: &str) -> Self {
        if let Ok(mut accounts) = self.accounts.lock() {
            accounts.insert(
                email.to_string(),
                MockAccount {
                    password: password.to_string(),
                    account_id: AccountId::new(account_id),
                },
            );
        }
        self
    }

    /// Fail every call as if the provider were down
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn has_account(&self, email: &str) -> bool {
        self.accounts
            .lock()
            .map(|accounts| accounts.contains_key(email))
            .unwrap_or(false)
    }

    /// Emails that were sent a password-reset link
    pub fn password_resets(&self) -> Vec<String> {
        self.resets.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(ShieldError::Identity {
                message: "identity provider unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn lock_error() -> ShieldError {
        ShieldError::Identity {
            message: "mock state poisoned".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity> {
        self.check_available()?;
        let accounts = self.accounts.lock().map_err(|_| Self::lock_error())?;
        match accounts.get(email) {
            Some(account) if account.password == password => Ok(Identity::new(
                account.account_id.clone(),
                email,
                format!("token-{}", account.account_id),
            )),
            _ => Err(map_provider_error("INVALID_LOGIN_CREDENTIALS")),
        }
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Identity> {
        self.check_available()?;
        let mut accounts = self.accounts.lock().map_err(|_| Self::lock_error())?;
        if accounts.contains_key(email) {
            return Err(map_provider_error("EMAIL_EXISTS"));
        }
        let account_id = AccountId::new(format!("uid-{}", accounts.len() + 1));
        accounts.insert(
            email.to_string(),
            MockAccount {
                password: password.to_string(),
                account_id: account_id.clone(),
            },
        );
        Ok(Identity::new(
            account_id.clone(),
            email,
            format!("token-{}", account_id),
        ))
    }

    async fn send_password_reset(&self, email: &str) -> Result<()> {
        self.check_available()?;
        self.resets
            .lock()
            .map_err(|_| Self::lock_error())?
            .push(email.to_string());
        Ok(())
    }

    async fn delete_account(&self, identity: &Identity) -> Result<()> {
        self.check_available()?;
        let mut accounts = self.accounts.lock().map_err(|_| Self::lock_error())?;
        accounts.retain(|_, account| account.account_id != identity.account_id);
        Ok(())
    }
}
