//! HTTP client for workflow backends with safe logging.

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

const CLIENT_USER_AGENT: &str = concat!("rowloop/", env!("CARGO_PKG_VERSION"));

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Query parameter keys (case-insensitive) whose values are redacted in logs.
const SENSITIVE_QUERY_PARAMS: &[&str] = &[
    "api_key",
    "apikey",
    "key",
    "token",
    "access_token",
    "secret",
    "signature",
    "sig",
];

// ─────────────────────────────────────────────────────────────────────────────
// LoggingMode
// ─────────────────────────────────────────────────────────────────────────────

/// Controls how URLs are sanitized for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoggingMode {
    /// Log only the path component. Strips scheme, host, query, and fragment.
    /// Example: `/webhook/loop-over-rows`
    #[default]
    PathOnly,

    /// Log path and query parameters, but redact sensitive values.
    /// Example: `/webhook/loop-over-rows?token=***&region=eu`
    PathAndQueryRedacted,
}

// ─────────────────────────────────────────────────────────────────────────────
// URL Sanitization
// ─────────────────────────────────────────────────────────────────────────────

fn is_sensitive_param(key: &str) -> bool {
    SENSITIVE_QUERY_PARAMS
        .iter()
        .any(|sensitive| key.eq_ignore_ascii_case(sensitive))
}

/// Endpoint URL as it may appear in logs: never the scheme, host,
/// credentials or fragment.
pub fn sanitize_url_for_logs(url: &Url, mode: LoggingMode) -> String {
    if mode == LoggingMode::PathOnly || url.query().map_or(true, str::is_empty) {
        return url.path().to_string();
    }

    let query = url
        .query_pairs()
        .map(|(key, value)| {
            if is_sensitive_param(&key) {
                format!("{key}=***")
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", url.path(), query)
}

// ─────────────────────────────────────────────────────────────────────────────
// WorkflowClient
// ─────────────────────────────────────────────────────────────────────────────

/// Posts canonical payloads to workflow endpoints.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone)]
pub struct WorkflowClient {
    http: reqwest::Client,
    api_key: Option<SecretString>,
    logging_mode: LoggingMode,
}

impl std::fmt::Debug for WorkflowClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowClient")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("logging_mode", &self.logging_mode)
            .finish()
    }
}

impl WorkflowClient {
    /// Creates a client. When `api_key` is set it is sent as a bearer token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if the HTTP client fails to initialize.
    pub fn new(api_key: Option<SecretString>) -> Result<Self, AppError> {
        Ok(Self {
            http: build_http_client()?,
            api_key,
            logging_mode: LoggingMode::default(),
        })
    }

    pub fn with_logging_mode(mut self, mode: LoggingMode) -> Self {
        self.logging_mode = mode;
        self
    }

    /// POSTs `payload` as JSON and decodes the JSON response.
    ///
    /// No overall deadline is applied here; callers race this future against
    /// their own timeout and cancellation.
    ///
    /// # Errors
    ///
    /// - `AppError::ConnectionFailed` - network error, never carrying the raw URL
    /// - `AppError::BackendStatus` - non-2xx status, with the plain-text body
    /// - `AppError::InvalidResponse` - 2xx with a body that is not JSON
    pub async fn post_json(&self, endpoint: &Url, payload: &Value) -> Result<Value, AppError> {
        let start = Instant::now();
        let sanitized_url = sanitize_url_for_logs(endpoint, self.logging_mode);

        let mut request = self.http.post(endpoint.as_str()).json(payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(_) => {
                // The reqwest error may embed the full URL; log the sanitized path only.
                info!(
                    "[HTTP] POST {} FAILED {}ms",
                    sanitized_url,
                    start.elapsed().as_millis()
                );
                return Err(AppError::ConnectionFailed(
                    "Connection to workflow backend failed".to_string(),
                ));
            }
        };

        let status = response.status();
        let body = response.text().await.map_err(|_| {
            AppError::ConnectionFailed("Failed to read workflow backend response".to_string())
        })?;

        info!(
            "[HTTP] POST {} {} {}ms",
            sanitized_url,
            status.as_u16(),
            start.elapsed().as_millis()
        );

        if !status.is_success() {
            warn!("[HTTP] Backend returned status {}", status.as_u16());
            return Err(AppError::BackendStatus {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| AppError::InvalidResponse(format!("Response is not valid JSON: {e}")))
    }
}

fn build_http_client() -> Result<reqwest::Client, AppError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))
}
