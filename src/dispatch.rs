//! Delivery of one-time codes to the account holder.

use crate::error::{Result, ShieldError};
use crate::identity::AccountId;
use crate::otp::OtpCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Where a code goes. The account id is for logging; the email is the address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub account_id: AccountId,
    pub email: String,
}

/// Trait for outbound code delivery.
#[async_trait::async_trait]
pub trait CodeDispatcher: Send + Sync {
    /// Send `code` to `recipient`. Failures are `ShieldError::Dispatch`.
    async fn dispatch(&self, recipient: &Recipient, code: &OtpCode) -> Result<()>;
}

/// HTML body of the code email.
pub fn render_email(code: &OtpCode, ttl: Duration) -> String {
    let minutes = ttl.as_secs().div_ceil(60).max(1);
    let lifetime = if minutes == 1 {
        "1 minute".to_string()
    } else {
        format!("{} minutes", minutes)
    };
    format!(
        "<html><body>\
         <p>Your Audio Shield verification code is:</p>\
         <h2 style=\"letter-spacing: 4px\">{}</h2>\
         <p>This code expires in {}. If you did not try to sign in, you can ignore this email.</p>\
         </body></html>",
        code.as_str(),
        lifetime
    )
}

#[cfg(feature = "http")]
mod brevo {
    use super::*;
    use crate::config::MailConfig;
    use crate::defaults;
    use crate::services::http::build_client;
    use serde_json::json;

    /// Sends codes through the Brevo transactional email API.
    #[derive(Debug, Clone)]
    pub struct BrevoDispatcher {
        client: reqwest::Client,
        endpoint: String,
        api_key: String,
        sender_name: String,
        sender_email: String,
        ttl: Duration,
    }

    impl BrevoDispatcher {
        /// `ttl` is only quoted in the email body.
        pub fn from_config(config: &MailConfig, ttl: Duration) -> Result<Self> {
            let api_key = config
                .api_key
                .clone()
                .filter(|key| !key.is_empty())
                .ok_or_else(|| ShieldError::ConfigInvalidValue {
                    key: "mail.api_key".to_string(),
                    message: "required (or set AUDIOSHIELD_MAIL_API_KEY)".to_string(),
                })?;
            let sender_email = config
                .sender_email
                .clone()
                .filter(|email| !email.is_empty())
                .ok_or_else(|| ShieldError::ConfigInvalidValue {
                    key: "mail.sender_email".to_string(),
                    message: "required to send verification codes".to_string(),
                })?;

            Ok(Self {
                client: build_client(Duration::from_secs(defaults::HTTP_REQUEST_TIMEOUT_SECS))?,
                endpoint: config.endpoint.clone(),
                api_key,
                sender_name: config.sender_name.clone(),
                sender_email,
                ttl,
            })
        }

        fn payload(&self, recipient: &Recipient, code: &OtpCode) -> serde_json::Value {
            json!({
                "sender": { "name": self.sender_name, "email": self.sender_email },
                "to": [{ "email": recipient.email }],
                "subject": defaults::MAIL_SUBJECT,
                "htmlContent": render_email(code, self.ttl),
            })
        }
    }

    #[async_trait::async_trait]
    impl CodeDispatcher for BrevoDispatcher {
        async fn dispatch(&self, recipient: &Recipient, code: &OtpCode) -> Result<()> {
            let response = self
                .client
                .post(&self.endpoint)
                .header("api-key", &self.api_key)
                .header("accept", "application/json")
                .json(&self.payload(recipient, code))
                .send()
                .await
                .map_err(|e| ShieldError::Dispatch {
                    message: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ShieldError::Dispatch {
                    message: format!("mail API returned HTTP {}: {}", status.as_u16(), body),
                });
            }

            tracing::info!(account = %recipient.account_id, "verification code emailed");
            Ok(())
        }
    }

}

#[cfg(feature = "http")]
pub use brevo::BrevoDispatcher;

/// Prints the code to stderr instead of sending it. For local development.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleDispatcher;

#[async_trait::async_trait]
impl CodeDispatcher for ConsoleDispatcher {
    async fn dispatch(&self, recipient: &Recipient, code: &OtpCode) -> Result<()> {
        eprintln!(
            "[dev] verification code for {}: {}",
            recipient.email,
            code.as_str()
        );
        Ok(())
    }
}

/// Mock dispatcher for testing; records what it was asked to send.
#[derive(Debug, Clone, Default)]
pub struct MockDispatcher {
    sent: Arc<Mutex<Vec<(Recipient, OtpCode)>>>,
    should_fail: bool,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the mock to fail every dispatch
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    pub fn sent(&self) -> Vec<(Recipient, OtpCode)> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Most recently dispatched code
    pub fn last_code(&self) -> Option<OtpCode> {
        self.sent().last().map(|(_, code)| code.clone())
    }
}

#[async_trait::async_trait]
impl CodeDispatcher for MockDispatcher {
    async fn dispatch(&self, recipient: &Recipient, code: &OtpCode) -> Result<()> {
        if self.should_fail {
            return Err(ShieldError::Dispatch {
                message: "mock dispatch failure".to_string(),
            });
        }
        self.sent
            .lock()
            .map_err(|_| ShieldError::Dispatch {
                message: "mock state poisoned".to_string(),
            })?
            .push((recipient.clone(), code.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient() -> Recipient {
        Recipient {
            account_id: AccountId::new("uid-1"),
            email: "ana@example.com".to_string(),
        }
    }

    #[test]
    fn test_render_email_contains_code() {
        let html = render_email(&OtpCode::parse("000417").unwrap(), Duration::from_secs(600));
        assert!(html.contains("000417"));
        assert!(html.contains("expires in 10 minutes"));

        let short = render_email(&OtpCode::parse("000417").unwrap(), Duration::from_secs(30));
        assert!(short.contains("expires in 1 minute."));
    }

    #[tokio::test]
    async fn test_mock_records_dispatch() {
        let dispatcher = MockDispatcher::new();
        let code = OtpCode::parse("482913").unwrap();
        dispatcher.dispatch(&recipient(), &code).await.unwrap();

        assert_eq!(dispatcher.sent().len(), 1);
        assert_eq!(dispatcher.last_code(), Some(code));
    }

    #[tokio::test]
    async fn test_mock_failure() {
        let dispatcher = MockDispatcher::new().with_failure();
        let code = OtpCode::parse("482913").unwrap();
        let result = dispatcher.dispatch(&recipient(), &code).await;

        assert!(matches!(result, Err(ShieldError::Dispatch { .. })));
        assert!(dispatcher.sent().is_empty());
    }

    #[tokio::test]
    async fn test_console_dispatcher_succeeds() {
        let code = OtpCode::parse("482913").unwrap();
        assert!(ConsoleDispatcher.dispatch(&recipient(), &code).await.is_ok());
    }
}
