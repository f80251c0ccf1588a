use crate::config::Config;
use crate::error::Error;
use crate::types::{HealthPayload, PreparedTurn, StreamToken, ToolResultPayload, TurnInput};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::pin::Pin;
#[cfg(test)]
use std::sync::Arc;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Scripted stand-in for the control plane, compiled only for tests.
#[cfg(test)]
pub trait MockBackend: Send + Sync {
    fn prepare(&self, turn: &TurnInput) -> Result<PreparedTurn, Error>;
    fn open_stream(&self, token: &StreamToken) -> Result<ByteStream, Error>;
    fn approve(&self, approval_id: &str, approved: bool) -> Result<(), Error>;
    fn execute_tool(&self, approval_id: &str) -> Result<ToolResultPayload, Error>;
    fn health(&self) -> Result<HealthPayload, Error>;
}

/// HTTP client for the control plane and the turn stream endpoint.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    #[cfg(test)]
    mock_backend: Option<Arc<dyn MockBackend>>,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|error| Error::Network(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            #[cfg(test)]
            mock_backend: None,
        })
    }

    #[cfg(test)]
    pub fn new_mock(backend: Arc<dyn MockBackend>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: "http://localhost:8080".to_string(),
            api_key: None,
            #[cfg(test)]
            mock_backend: Some(backend),
        }
    }

    /// Control-plane call allocating a stream token for one turn.
    pub async fn prepare(&self, turn: &TurnInput) -> Result<PreparedTurn, Error> {
        #[cfg(test)]
        if let Some(backend) = &self.mock_backend {
            return backend.prepare(turn);
        }

        let url = format!("{}/chat/prepare", self.base_url);
        let response = self
            .authed(self.http.post(&url))
            .json(turn)
            .send()
            .await
            .map_err(|error| map_transport_error(error, &url))?;

        let response = check_status(response, &url).await?;
        response
            .json::<PreparedTurn>()
            .await
            .map_err(|error| Error::Protocol(format!("invalid prepare response: {error}")))
    }

    /// Open the long-lived event stream for a prepared turn. The token is
    /// the credential; it is consumed by the first successful connect, so
    /// this call is never retried.
    pub async fn open_stream(
        &self,
        token: &StreamToken,
        stream_url: &str,
    ) -> Result<ByteStream, Error> {
        #[cfg(test)]
        if let Some(backend) = &self.mock_backend {
            return backend.open_stream(token);
        }

        let response = self
            .http
            .get(stream_url)
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(|error| map_transport_error(error, stream_url))?;
        let response = check_status(response, stream_url).await?;

        let url = stream_url.to_string();
        let stream = response
            .bytes_stream()
            .map(move |item| item.map_err(|error| map_transport_error(error, &url)));
        Ok(Box::pin(stream))
    }

    /// Record an approval decision with the control plane.
    pub async fn approve(
        &self,
        approval_id: &str,
        approved: bool,
        reason: Option<&str>,
    ) -> Result<(), Error> {
        #[cfg(test)]
        if let Some(backend) = &self.mock_backend {
            return backend.approve(approval_id, approved);
        }

        let url = format!("{}/approvals/{}/approve", self.base_url, approval_id);
        let response = self
            .authed(self.http.post(&url))
            .json(&json!({ "approved": approved, "reason": reason }))
            .send()
            .await
            .map_err(|error| map_transport_error(error, &url))?;
        check_status(response, &url).await.map(|_| ())
    }

    /// Trigger execution of an approved tool call.
    pub async fn execute_tool(&self, approval_id: &str) -> Result<ToolResultPayload, Error> {
        #[cfg(test)]
        if let Some(backend) = &self.mock_backend {
            return backend.execute_tool(approval_id);
        }

        let url = format!("{}/approvals/{}/execute", self.base_url, approval_id);
        let response = self
            .authed(self.http.post(&url))
            .send()
            .await
            .map_err(|error| map_transport_error(error, &url))?;
        let response = check_status(response, &url).await?;
        response
            .json::<ToolResultPayload>()
            .await
            .map_err(|error| Error::Protocol(format!("invalid tool result: {error}")))
    }

    pub async fn health(&self) -> Result<HealthPayload, Error> {
        #[cfg(test)]
        if let Some(backend) = &self.mock_backend {
            return backend.health();
        }

        let url = format!("{}/health", self.base_url);
        let response = self
            .authed(self.http.get(&url))
            .send()
            .await
            .map_err(|error| map_transport_error(error, &url))?;
        let response = check_status(response, &url).await?;
        response
            .json::<HealthPayload>()
            .await
            .map_err(|error| Error::Protocol(format!("invalid health response: {error}")))
    }

    /// Minimal liveness probe: HEAD against the health endpoint, any 2xx
    /// counts, no body required.
    pub async fn heartbeat(&self) -> Result<(), Error> {
        #[cfg(test)]
        if let Some(backend) = &self.mock_backend {
            return backend.health().map(|_| ());
        }

        let url = format!("{}/health", self.base_url);
        let response = self
            .authed(self.http.head(&url))
            .send()
            .await
            .map_err(|error| map_transport_error(error, &url))?;
        check_status(response, &url).await.map(|_| ())
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

fn map_transport_error(error: reqwest::Error, url: &str) -> Error {
    if error.is_timeout() {
        return Error::Timeout(format!("request to '{url}' timed out: {error}"));
    }
    if error.is_connect() {
        return Error::Network(format!("cannot reach '{url}': {error}"));
    }
    Error::Network(format!("request to '{url}' failed: {error}"))
}

/// Map non-2xx responses onto the error taxonomy so the retry predicate
/// sees the right class: 401/403 demand reauthentication, 400/422 are
/// caller bugs, everything else is treated as transient.
async fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = if body.trim().is_empty() {
        format!("'{url}' returned HTTP {status}")
    } else {
        format!("'{url}' returned HTTP {status}: {}", body.trim())
    };

    Err(match status.as_u16() {
        401 | 403 => Error::Auth(detail),
        400 | 422 => Error::Validation(detail),
        _ => Error::Network(detail),
    })
}
