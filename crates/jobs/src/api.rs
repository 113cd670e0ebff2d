//! Job-processing service boundary.
//!
//! [`JobService`] is the seam the submitter talks to; [`HttpJobService`]
//! implements it over the service's REST endpoints using [`reqwest`].

use std::time::Duration;

use metascan_core::metadata::JobRequest;
use metascan_core::types::JobId;
use serde::{Deserialize, Serialize};

/// External service that runs metadata-extraction jobs.
#[async_trait::async_trait]
pub trait JobService: Send + Sync {
    /// Queue an extraction job and return its identifier.
    async fn submit_job(&self, request: &JobRequest) -> Result<JobId, JobServiceError>;

    /// List the API names of every entity the service can inspect.
    async fn list_entities(&self) -> Result<Vec<String>, JobServiceError>;
}

/// Errors from the job service layer.
#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("Job service error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Human-readable message extracted from the error body, if any.
        message: Option<String>,
        /// Raw response body for debugging.
        body: String,
    },

    /// The request was refused before reaching the service.
    #[error("Job request rejected: {0}")]
    Rejected(String),
}

impl JobServiceError {
    /// Human-readable message reported by the service, when it sent one.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Api { message, .. } => message.as_deref(),
            Self::Rejected(message) => Some(message),
            Self::Request(_) => None,
        }
    }
}

/// Response returned by `POST /jobs/{scope}`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    #[serde(rename = "jobId", alias = "id")]
    pub job_id: String,
}

/// Body sent to `POST /jobs/{scope}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody<'a> {
    objects: Vec<&'a str>,
    metadata_options: Vec<String>,
}

/// HTTP client for the job-processing service.
pub struct HttpJobService {
    client: reqwest::Client,
    api_url: String,
}

impl HttpJobService {
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8080`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
        }
    }

    /// Create a client whose requests give up after `timeout`.
    pub fn with_timeout(
        api_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, JobServiceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Reuse an existing [`reqwest::Client`] (connection pooling).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code, otherwise turn the
    /// body into a [`JobServiceError::Api`].
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, JobServiceError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(JobServiceError::Api {
                status: status.as_u16(),
                message: extract_error_message(&body),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, JobServiceError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait::async_trait]
impl JobService for HttpJobService {
    /// Sends `POST /jobs/{standard|custom}`. Requests mixing both scopes
    /// are rejected locally; split them with
    /// [`JobRequest::split_by_scope`] first.
    async fn submit_job(&self, request: &JobRequest) -> Result<JobId, JobServiceError> {
        let scope = request.scope().ok_or_else(|| {
            JobServiceError::Rejected(
                "a job cannot mix standard and custom entities".to_string(),
            )
        })?;

        let body = SubmitBody {
            objects: request
                .target_entities()
                .iter()
                .map(|e| e.as_str())
                .collect(),
            metadata_options: request
                .requested_kinds()
                .iter()
                .map(|k| k.option_value(scope))
                .collect(),
        };

        let response = self
            .client
            .post(format!("{}/jobs/{}", self.api_url, scope))
            .json(&body)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::parse_response(response).await?;
        Ok(JobId::new(submitted.job_id))
    }

    /// Sends `GET /objects`.
    async fn list_entities(&self) -> Result<Vec<String>, JobServiceError> {
        let response = self
            .client
            .get(format!("{}/objects", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }
}

/// Pull a readable message out of an error body.
///
/// Understands `{"message": ..}`, `{"body": {"message": ..}}` and
/// `[{"message": ..}, ..]`. Returns `None` for anything else.
pub fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;

    let message = match &value {
        serde_json::Value::Array(items) => items.first()?.get("message"),
        other => other
            .get("message")
            .or_else(|| other.get("body").and_then(|b| b.get("message"))),
    }?;

    message
        .as_str()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}
