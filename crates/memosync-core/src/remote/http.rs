//! HTTP/JSON implementation of `RemoteStore`

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use super::{ConflictDescriptor, PullResponse, PushOutcome, RemoteError, RemoteStore};
use crate::error::{Error, Result};
use crate::models::{PendingOperation, Record};
use crate::util::{compact_text, is_http_url, normalize_text_option};

const HTTP_TIMEOUT_SECS: u64 = 30;

/// Client for the memosync sync API
#[derive(Clone)]
pub struct HttpRemote {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        let base_url = normalize_endpoint(base_url.into())?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|error| Error::InvalidInput(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            base_url,
            auth_token: normalize_text_option(auth_token),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl RemoteStore for HttpRemote {
    async fn pull(&self, since: Option<i64>) -> std::result::Result<PullResponse, RemoteError> {
        let mut request = self
            .client
            .get(format!("{}/v1/sync/pull", self.base_url))
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }

        let response = self.authorize(request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RemoteError::Http {
                status: status.as_u16(),
                message: parse_api_error(status, &body),
            });
        }

        serde_json::from_str(&body)
            .map_err(|error| RemoteError::InvalidPayload(format!("pull response: {error}")))
    }

    async fn push(
        &self,
        operation: &PendingOperation,
    ) -> std::result::Result<PushOutcome, RemoteError> {
        let request = self
            .client
            .post(format!("{}/v1/sync/push", self.base_url))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(operation);

        let response = self.authorize(request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        push_outcome(status, &body)
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::InvalidPayload(error.to_string())
        } else if let Some(status) = error.status() {
            Self::Http {
                status: status.as_u16(),
                message: error.to_string(),
            }
        } else {
            Self::Network(error.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    record: Record,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Interpret the answer to a push request
fn push_outcome(status: StatusCode, body: &str) -> std::result::Result<PushOutcome, RemoteError> {
    if status == StatusCode::CONFLICT {
        let descriptor = serde_json::from_str::<ConflictDescriptor>(body).unwrap_or_else(|_| {
            ConflictDescriptor {
                server_version: None,
                message: normalize_text_option(Some(compact_text(body))),
            }
        });
        return Ok(PushOutcome::Conflict(descriptor));
    }

    if !status.is_success() {
        return Err(RemoteError::Http {
            status: status.as_u16(),
            message: parse_api_error(status, body),
        });
    }

    let payload = serde_json::from_str::<PushResponse>(body)
        .map_err(|error| RemoteError::InvalidPayload(format!("push response: {error}")))?;
    Ok(PushOutcome::Applied(payload.record))
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_endpoint(raw: String) -> Result<String> {
    let endpoint = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput("remote URL must not be empty".to_string()))?;
    if is_http_url(&endpoint) {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "remote URL must include http:// or https://".to_string(),
        ))
    }
}
