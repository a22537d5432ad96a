//! Voiceprints kept by the analysis service.
//!
//! The speaker verifier compares each sign-in sample against the voiceprint
//! it holds for the account, so enrollment must store the voiceprint there
//! rather than on the client.

use crate::error::{Result, ShieldError};
use crate::identity::AccountId;
use crate::services::http::ServiceClient;
use crate::store::VoicePrintStore;
use crate::voiceprint::VoicePrint;
use reqwest::{Response, StatusCode};

impl ServiceClient {
    fn voiceprint_url(&self, account: &AccountId) -> Result<String> {
        let id = account.as_str();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ShieldError::Store {
                message: format!("account id {:?} is not usable in a URL", id),
            });
        }
        let base = self.url(&self.voiceprints_path);
        Ok(format!("{}/{}", base.trim_end_matches('/'), id))
    }
}

fn store_error(action: &str, e: reqwest::Error) -> ShieldError {
    ShieldError::Store {
        message: format!("voiceprint {} failed: {}", action, e),
    }
}

async fn unexpected(action: &str, response: Response) -> ShieldError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ShieldError::Store {
        message: format!("voiceprint {} returned {}: {}", action, status, body.trim()),
    }
}

#[async_trait::async_trait]
impl VoicePrintStore for ServiceClient {
    async fn persist_voiceprint(&self, voiceprint: &VoicePrint) -> Result<()> {
        let url = self.voiceprint_url(&voiceprint.account_id)?;
        let response = self
            .client
            .put(&url)
            .json(voiceprint)
            .send()
            .await
            .map_err(|e| store_error("upload", e))?;
        if !response.status().is_success() {
            return Err(unexpected("upload", response).await);
        }
        tracing::debug!(account = %voiceprint.account_id, "voiceprint stored with analysis service");
        Ok(())
    }

    async fn voiceprint(&self, account: &AccountId) -> Result<Option<VoicePrint>> {
        let url = self.voiceprint_url(account)?;
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| store_error("lookup", e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let voiceprint = response
                    .json::<VoicePrint>()
                    .await
                    .map_err(|e| store_error("lookup", e))?;
                Ok(Some(voiceprint))
            }
            _ => Err(unexpected("lookup", response).await),
        }
    }

    async fn delete_voiceprint(&self, account: &AccountId) -> Result<bool> {
        let url = self.voiceprint_url(account)?;
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| store_error("delete", e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(unexpected("delete", response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServicesConfig;

    fn client(base_url: &str) -> ServiceClient {
        let config = ServicesConfig {
            base_url: base_url.to_string(),
            ..ServicesConfig::default()
        };
        ServiceClient::from_config(&config).unwrap()
    }

    #[test]
    fn test_voiceprint_url_per_account() {
        let client = client("http://analysis:8000/");
        assert_eq!(
            client.voiceprint_url(&AccountId::new("uid-42")).unwrap(),
            "http://analysis:8000/voiceprints/uid-42"
        );
    }

    #[test]
    fn test_voiceprint_url_rejects_path_segments() {
        let client = client("http://analysis:8000");
        assert!(client.voiceprint_url(&AccountId::new("../admin")).is_err());
        assert!(client.voiceprint_url(&AccountId::new("")).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_store_error() {
        let client = client("http://127.0.0.1:9");
        match client.voiceprint(&AccountId::new("uid-1")).await {
            Err(ShieldError::Store { message }) => assert!(message.starts_with("voiceprint lookup failed")),
            other => panic!("Expected Store error, got {:?}", other),
        }
    }
}
