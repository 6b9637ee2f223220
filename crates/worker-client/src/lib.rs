//! HTTP client for the external dataset-processing worker.
//!
//! The worker is an opaque synchronous service: one request per delegated
//! operation, bounded by a hard wall-clock timeout. This client does not
//! retry; retry policy, if any, belongs to the caller.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Default hard timeout for a single worker call: 10 minutes.
pub const DEFAULT_TIMEOUT_MS: u64 = 600_000;

pub const ANALYZE_PATH: &str = "/internal/analyze";
pub const CLEAN_PATH: &str = "/internal/clean";

#[derive(Debug, Clone)]
pub struct WorkerClientConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl WorkerClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerClient {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum WorkerClientError {
    #[error("worker_base_url_missing")]
    BaseUrlMissing,
    #[error("worker_timeout_after_{timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("worker_request_failed:{message}")]
    Transport { message: String },
    #[error("worker_http_{status}:{body}")]
    Http { status: StatusCode, body: String },
    #[error("worker_json_decode_failed:{message}")]
    Decode { message: String },
    #[error("worker_reported_failure:{message}")]
    Logical { message: String },
    #[error("worker_response_missing_field:{field}")]
    IncompleteResponse { field: &'static str },
}

impl WorkerClientError {
    /// Stable classification string recorded in audit payloads so a
    /// transport fault stays distinguishable from a worker-reported one.
    #[must_use]
    pub fn classification(&self) -> &'static str {
        match self {
            Self::BaseUrlMissing | Self::Transport { .. } | Self::Http { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::Logical { .. } => "logical",
            Self::Decode { .. } | Self::IncompleteResponse { .. } => "invalid_response",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeRequest {
    pub job_id: String,
    pub file_path: String,
    pub mode: String,
    pub options: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanRequest {
    pub job_id: String,
    pub file_path: String,
    pub mode: String,
    pub rules: Vec<String>,
    pub options: Value,
}

/// Raw wire shape of every worker response. Success payloads are validated
/// into the typed outcomes below before the caller sees them.
#[derive(Debug, Deserialize)]
struct WorkerResponse {
    status: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    cleaned_file_path: Option<String>,
    #[serde(default)]
    rules_applied: Option<Vec<String>>,
    #[serde(default)]
    summary: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub result: Value,
    pub summary: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct CleaningOutcome {
    pub cleaned_file_path: String,
    pub rules_applied: Vec<String>,
    pub summary: Option<Value>,
}

impl WorkerClient {
    pub fn new(config: WorkerClientConfig) -> Result<Self, WorkerClientError> {
        let base_url = normalize_base_url(&config.base_url)?;
        Ok(Self {
            base_url,
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            http: reqwest::Client::new(),
        })
    }

    pub fn from_base_url(base_url: &str, timeout_ms: u64) -> Result<Self, WorkerClientError> {
        let mut config = WorkerClientConfig::new(base_url);
        config.timeout_ms = timeout_ms;
        Self::new(config)
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Delegates an analysis run. The response must carry a `result` blob
    /// for the call to count as a success.
    pub async fn analyze(
        &self,
        request: &AnalyzeRequest,
    ) -> Result<AnalysisOutcome, WorkerClientError> {
        let response = self.post_json(ANALYZE_PATH, request).await?;
        let response = into_logical_success(response)?;
        let result = response
            .result
            .ok_or(WorkerClientError::IncompleteResponse { field: "result" })?;
        Ok(AnalysisOutcome {
            result,
            summary: response.summary,
        })
    }

    /// Delegates a cleaning run. The response must carry the cleaned
    /// artifact path and the list of applied rules.
    pub async fn clean(
        &self,
        request: &CleanRequest,
    ) -> Result<CleaningOutcome, WorkerClientError> {
        let response = self.post_json(CLEAN_PATH, request).await?;
        let response = into_logical_success(response)?;
        let cleaned_file_path =
            response
                .cleaned_file_path
                .ok_or(WorkerClientError::IncompleteResponse {
                    field: "cleaned_file_path",
                })?;
        let rules_applied = response
            .rules_applied
            .ok_or(WorkerClientError::IncompleteResponse {
                field: "rules_applied",
            })?;
        Ok(CleaningOutcome {
            cleaned_file_path,
            rules_applied,
            summary: response.summary,
        })
    }

    async fn post_json<Req>(
        &self,
        path: &str,
        payload: &Req,
    ) -> Result<WorkerResponse, WorkerClientError>
    where
        Req: Serialize + ?Sized,
    {
        let url = self.endpoint(path);
        let request = self
            .http
            .post(url.as_str())
            .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
            .timeout(self.timeout)
            .json(payload);

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                WorkerClientError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                WorkerClientError::Transport {
                    message: error.to_string(),
                }
            }
        })?;

        decode_json_response(response).await
    }
}

fn into_logical_success(response: WorkerResponse) -> Result<WorkerResponse, WorkerClientError> {
    if response.status == "ok" {
        return Ok(response);
    }
    Err(WorkerClientError::Logical {
        message: response
            .error
            .unwrap_or_else(|| format!("worker returned status '{}'", response.status)),
    })
}

fn normalize_base_url(base_url: &str) -> Result<String, WorkerClientError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(WorkerClientError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

async fn decode_json_response(
    response: reqwest::Response,
) -> Result<WorkerResponse, WorkerClientError> {
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| WorkerClientError::Transport {
            message: error.to_string(),
        })?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<WorkerResponse>(&bytes).map_err(|error| WorkerClientError::Decode {
        message: error.to_string(),
    })
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> WorkerClientError {
    let body = non_empty_string(String::from_utf8_lossy(body).to_string())
        .unwrap_or_else(|| "<empty>".to_string());
    WorkerClientError::Http { status, body }
}

fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
