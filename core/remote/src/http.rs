//! REST backend adapter.
//!
//! Maps the backend interface onto a JSON API:
//!
//! | Call            | Request                                         |
//! |-----------------|-------------------------------------------------|
//! | `ping`          | `GET /health`                                   |
//! | `create_record` | `POST /{collection}` with the payload           |
//! | `update_record` | `PATCH /{collection}/{id}` with changed fields  |
//! | `delete_record` | `DELETE /{collection}/{id}?base_version=N`      |
//! | `fetch_all`     | `GET /{collection}`                             |
//!
//! Mutating requests carry the op id in an `Idempotency-Key` header.

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use larder_common::{Collection, Error, Payload, RemoteRecord, Result};

use crate::backend::{RemoteBackend, RemoteError, RemoteResult};

/// Header carrying the op id of a mutating request.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Body of a `PATCH` request.
#[derive(Debug, Serialize)]
struct UpdateBody<'a> {
    base_version: Option<u64>,
    fields: &'a Payload,
}

/// Body of a `409 Conflict` response.
#[derive(Debug, Deserialize)]
struct ConflictBody {
    #[serde(default)]
    current: Option<RemoteRecord>,
}

/// HTTP backend adapter.
pub struct HttpBackend {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpBackend {
    /// Create an adapter for the API rooted at `base_url`.
    ///
    /// # Errors
    /// - `base_url` cannot carry path segments (e.g. `mailto:`)
    /// - The HTTP client fails to build
    pub fn new(base_url: Url, timeout: Option<Duration>) -> Result<Self> {
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidInput(format!(
                "Backend URL cannot be a base: {}",
                base_url
            )));
        }

        let http = Client::builder()
            .user_agent("Larder/0.1")
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .gzip(true)
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            token: None,
        })
    }

    /// Authenticate every request with a bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Build `{base}/{segments...}`.
    fn endpoint(&self, segments: &[&str]) -> RemoteResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Transport("Backend URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> RemoteResult<Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(format!("Failed to {}: {}", what, e)))
    }

    /// Decode a success body, or classify the failure.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: Response,
    ) -> RemoteResult<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| RemoteError::Transport(format!("Failed to parse response: {}", e)));
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }
}

/// Map a non-success status and its body onto the error taxonomy.
///
/// A conflict whose body cannot be decoded is reported as a rejection,
/// since resending the same request cannot fix it.
pub fn classify(status: StatusCode, body: &str) -> RemoteError {
    match status {
        StatusCode::CONFLICT => match serde_json::from_str::<ConflictBody>(body) {
            Ok(conflict) => RemoteError::Conflict {
                current: conflict.current,
            },
            Err(e) => RemoteError::Rejected(format!("Unreadable conflict body: {}", e)),
        },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            RemoteError::Rejected(format!("{} - {}", status, body))
        }
        _ => RemoteError::Transport(format!("API error: {} - {}", status, body)),
    }
}

/// Like [`classify`], but a 404 means the record was deleted server-side.
pub fn classify_update(status: StatusCode, body: &str) -> RemoteError {
    if status == StatusCode::NOT_FOUND {
        RemoteError::Conflict { current: None }
    } else {
        classify(status, body)
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn ping(&self) -> RemoteResult<()> {
        let url = self.endpoint(&["health"])?;
        let response = self.send(self.http.get(url), "reach backend").await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(RemoteError::Transport(format!(
                "Health check failed: {}",
                response.status()
            )))
        }
    }

    async fn create_record(
        &self,
        collection: &Collection,
        payload: &Payload,
        idempotency_key: Uuid,
    ) -> RemoteResult<RemoteRecord> {
        let url = self.endpoint(&[collection.as_str()])?;
        debug!("POST {} ({})", url, idempotency_key);

        let request = self
            .http
            .post(url)
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .json(payload);
        let response = self.send(request, "create record").await?;

        self.handle_response(response).await
    }

    async fn update_record(
        &self,
        collection: &Collection,
        id: &str,
        changed_fields: &Payload,
        base_version: Option<u64>,
        idempotency_key: Uuid,
    ) -> RemoteResult<RemoteRecord> {
        let url = self.endpoint(&[collection.as_str(), id])?;
        debug!("PATCH {} ({})", url, idempotency_key);

        let request = self
            .http
            .patch(url)
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .json(&UpdateBody {
                base_version,
                fields: changed_fields,
            });
        let response = self.send(request, "update record").await?;

        let status = response.status();
        if status.is_success() {
            return self.handle_response(response).await;
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_update(status, &body))
    }

    async fn delete_record(
        &self,
        collection: &Collection,
        id: &str,
        base_version: Option<u64>,
        idempotency_key: Uuid,
    ) -> RemoteResult<()> {
        let url = self.endpoint(&[collection.as_str(), id])?;
        debug!("DELETE {} ({})", url, idempotency_key);

        let mut request = self
            .http
            .delete(url)
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string());
        if let Some(base) = base_version {
            request = request.query(&[("base_version", base)]);
        }
        let response = self.send(request, "delete record").await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }

    async fn fetch_all(&self, collection: &Collection) -> RemoteResult<Vec<RemoteRecord>> {
        let url = self.endpoint(&[collection.as_str()])?;
        let response = self.send(self.http.get(url), "fetch collection").await?;

        self.handle_response(response).await
    }
}
