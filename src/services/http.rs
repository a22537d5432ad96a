//! Multipart HTTP transport shared by the analysis service clients.

use crate::audio::sample::AudioSample;
use crate::config::ServicesConfig;
use crate::defaults;
use crate::error::{Result, ShieldError};
use crate::services::{Service, ServiceError, ServiceResult};
use reqwest::{Client, Response, multipart};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

const USER_AGENT: &str = concat!("audioshield/", env!("CARGO_PKG_VERSION"));

/// Longest error body kept in a [`ServiceError::Status`].
const MAX_ERROR_BODY: usize = 200;

/// HTTP client for the analysis service.
///
/// One instance implements [`TranscriptClient`](crate::services::TranscriptClient),
/// [`EmbeddingClient`](crate::services::EmbeddingClient) and
/// [`LivenessClient`](crate::services::LivenessClient).
#[derive(Debug, Clone)]
pub struct ServiceClient {
    pub(crate) client: Client,
    base_url: String,
    pub(crate) transcribe_path: String,
    pub(crate) extract_path: String,
    pub(crate) verify_path: String,
    pub(crate) liveness_path: String,
    pub(crate) voiceprints_path: String,
}

/// Body some endpoints return instead of a result.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    detail: Option<serde_json::Value>,
}

/// HTTP client with connect and whole-request timeouts.
///
/// Every outbound client in the crate is built here so that no request can
/// hang a flow.
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(defaults::HTTP_CONNECT_TIMEOUT_SECS))
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ShieldError::Other(format!("Failed to build HTTP client: {}", e)))
}

impl ServiceClient {
    pub fn from_config(config: &ServicesConfig) -> Result<Self> {
        // Analysis calls are bounded per call by `with_timeout`; this is the outer limit.
        let client = build_client(Duration::from_secs(defaults::HTTP_REQUEST_TIMEOUT_SECS))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            transcribe_path: config.transcribe_path.clone(),
            extract_path: config.extract_path.clone(),
            verify_path: config.verify_path.clone(),
            liveness_path: config.liveness_path.clone(),
            voiceprints_path: config.voiceprints_path.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Upload `sample` as the `file` part and decode the JSON reply.
    pub(crate) async fn upload<R>(
        &self,
        service: Service,
        path: &str,
        sample: &AudioSample,
        query: &[(&str, &str)],
        fields: Vec<(&'static str, String)>,
    ) -> ServiceResult<R>
    where
        R: DeserializeOwned,
    {
        let part = multipart::Part::bytes(sample.bytes().to_vec())
            .file_name(sample.file_name())
            .mime_str(sample.mime())
            .map_err(|e| ServiceError::Transport {
                service,
                message: e.to_string(),
            })?;
        let mut form = multipart::Form::new().part("file", part);
        for (key, value) in fields {
            form = form.text(key, value);
        }

        let url = self.url(path);
        tracing::trace!(%service, %url, bytes = sample.len(), "uploading sample");

        let response = self
            .client
            .post(&url)
            .query(query)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ServiceError::Transport {
                service,
                message: e.to_string(),
            })?;

        handle_response(service, response).await
    }
}

async fn handle_response<R>(service: Service, response: Response) -> ServiceResult<R>
where
    R: DeserializeOwned,
{
    let status = response.status();
    let body = response.bytes().await.map_err(|e| ServiceError::Transport {
        service,
        message: e.to_string(),
    })?;

    if let Some(message) = parse_error_body(&body) {
        return Err(ServiceError::Rejected { service, message });
    }

    if !status.is_success() {
        let text = String::from_utf8_lossy(&body);
        return Err(ServiceError::Status {
            service,
            status: status.as_u16(),
            body: truncate(&text, MAX_ERROR_BODY),
        });
    }

    serde_json::from_slice(&body).map_err(|e| ServiceError::Malformed {
        service,
        message: e.to_string(),
    })
}

/// Pull `error` (or FastAPI-style `detail`) out of a JSON body.
fn parse_error_body(body: &[u8]) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_slice(body).ok()?;
    if let Some(error) = parsed.error {
        return Some(error);
    }
    match parsed.detail? {
        serde_json::Value::String(detail) => Some(detail),
        other => Some(other.to_string()),
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
