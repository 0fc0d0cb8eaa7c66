//! Podio REST client
//!
//! Provides a typed HTTP client for the Podio API: authentication header,
//! URL construction, quota header capture and classification of error
//! responses into [`ApiError`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use podsync_remote::client::PodioClient;
//! use reqwest::Method;
//!
//! # async fn example() -> Result<(), podsync_core::ports::ApiError> {
//! let client = PodioClient::new("access-token-here");
//! let reply: podsync_core::ports::ApiReply<serde_json::Value> =
//!     client.send_json(Method::GET, "/org/").await?;
//! println!("{}", reply.value);
//! # Ok(())
//! # }
//! ```
//!
//! ## Design Notes
//!
//! - One call is one HTTP exchange. Pacing, quotas and retries belong to
//!   the engine's request gate; this client never sleeps.
//! - Podio signals rate limits with 420 or 429, and sometimes with a 400
//!   whose error code or description mentions the limit. All of them map
//!   to [`ApiError::RateLimited`]. A 400 complaining that a parameter
//!   "must not be larger than" its maximum is a bad request, not a limit.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use podsync_core::config::RemoteConfig;
use podsync_core::ports::{ApiError, ApiReply};

use crate::headers::{parse_quota_headers, retry_after, wait_from_description};

/// Base URL of the Podio API
const PODIO_BASE_URL: &str = "https://api.podio.com";

/// Podio's legacy "enhance your calm" rate-limit status
const STATUS_ENHANCE_YOUR_CALM: u16 = 420;

/// Longest error body kept in error messages
const MAX_ERROR_BODY: usize = 500;

// ============================================================================
// Error body
// ============================================================================

/// Error payload returned by Podio
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    /// Machine-readable code, e.g. "rate_limit" or "invalid_value"
    error: Option<String>,
    error_description: Option<String>,
}

impl ErrorBody {
    fn parse(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_default()
    }

    fn is_rate_limit(&self, raw: &str) -> bool {
        if matches!(
            self.error.as_deref(),
            Some("rate_limit") | Some("rate_limit_exceeded")
        ) {
            return true;
        }
        let text = self
            .error_description
            .as_deref()
            .unwrap_or(raw)
            .to_ascii_lowercase();
        [
            "rate limit",
            "rate_limit",
            "too many requests",
            "quota exceeded",
            "request limit exceeded",
        ]
        .iter()
        .any(|needle| text.contains(needle))
    }

    fn message(&self, raw: &str) -> String {
        self.error_description
            .clone()
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| truncate(raw))
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_BODY {
        return text.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Classifies a non-success response
///
/// Retry-After takes precedence over a wait mentioned in the description.
pub fn classify_error(status: StatusCode, headers: &HeaderMap, body: &str) -> ApiError {
    let parsed = ErrorBody::parse(body);
    let rate_limited = || ApiError::RateLimited {
        retry_after: retry_after(headers).or_else(|| {
            parsed
                .error_description
                .as_deref()
                .or(Some(body))
                .and_then(wait_from_description)
        }),
        quota: parse_quota_headers(headers),
    };

    match status.as_u16() {
        STATUS_ENHANCE_YOUR_CALM | 429 => rate_limited(),
        400 => {
            let description = parsed.error_description.as_deref().unwrap_or_default();
            if parsed.error.as_deref() == Some("invalid_value")
                && description.contains("must not be larger than")
            {
                ApiError::InvalidRequest {
                    code: parsed.error.clone(),
                    message: description.to_string(),
                }
            } else if parsed.is_rate_limit(body) {
                rate_limited()
            } else {
                ApiError::InvalidRequest {
                    code: parsed.error.clone(),
                    message: parsed.message(body),
                }
            }
        }
        401 => ApiError::Unauthorized(parsed.message(body)),
        403 if parsed.is_rate_limit(body) => rate_limited(),
        403 => ApiError::Forbidden(parsed.message(body)),
        404 | 410 => ApiError::NotFound(parsed.message(body)),
        s if (500..600).contains(&s) => ApiError::Server {
            status: s,
            message: parsed.message(body),
        },
        _ => ApiError::InvalidRequest {
            code: parsed.error.clone(),
            message: format!("HTTP {status}: {}", parsed.message(body)),
        },
    }
}

fn network_error(err: reqwest::Error) -> ApiError {
    ApiError::Network(err.to_string())
}

// ============================================================================
// PodioClient
// ============================================================================

/// HTTP client for Podio API calls
///
/// Wraps `reqwest::Client` with the `OAuth2` authorization header and
/// base URL construction.
#[derive(Debug, Clone)]
pub struct PodioClient {
    /// The underlying HTTP client
    client: Client,
    /// Base URL for API requests
    base_url: String,
    /// Current OAuth2 access token
    access_token: String,
}

impl PodioClient {
    /// Creates a client for the public Podio API
    pub fn new(access_token: impl Into<String>) -> Self {
        Self::with_base_url(access_token, PODIO_BASE_URL)
    }

    /// Creates a client against a custom base URL (useful for testing)
    pub fn with_base_url(access_token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            access_token: access_token.into(),
        }
    }

    /// Creates a client from the `remote` configuration section
    ///
    /// # Errors
    /// Fails if the base URL is invalid or the HTTP client cannot be built.
    pub fn from_config(
        config: &RemoteConfig,
        access_token: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Url::parse(&config.base_url)
            .with_context(|| format!("invalid base URL: {}", config.base_url))?;
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            access_token: access_token.into(),
        })
    }

    /// Updates the access token (e.g., after a token refresh)
    pub fn set_access_token(&mut self, token: impl Into<String>) {
        self.access_token = token.into();
        debug!("Updated PodioClient access token");
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolves `path` against the base URL; absolute URLs pass through
    ///
    /// # Errors
    /// `ApiError::InvalidRequest` if the result is not a valid URL.
    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        let resolved = if path.starts_with("http://") || path.starts_with("https://") {
            Url::parse(path)
        } else {
            Url::parse(&self.base_url).and_then(|base| base.join(path))
        };
        resolved.map_err(|e| ApiError::InvalidRequest {
            code: None,
            message: format!("invalid URL {path}: {e}"),
        })
    }

    /// Creates an authenticated request builder for the given method and path
    ///
    /// # Errors
    /// `ApiError::InvalidRequest` if the URL cannot be built.
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let url = self.url(path)?;
        Ok(self
            .client
            .request(method, url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("OAuth2 {}", self.access_token),
            ))
    }

    /// Sends a request and returns the successful response
    async fn execute(&self, builder: RequestBuilder, path: &str) -> Result<Response, ApiError> {
        let response = builder.send().await.map_err(network_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        let err = classify_error(status, &headers, &body);
        warn!(path, status = status.as_u16(), error = %err, "Podio request failed");
        Err(err)
    }

    /// Issues a request and decodes the JSON body
    ///
    /// # Errors
    /// Any [`ApiError`]; undecodable bodies are `InvalidResponse`.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
    ) -> Result<ApiReply<T>, ApiError> {
        self.send_json_with(method, path, None).await
    }

    /// Like [`PodioClient::send_json`], with an optional JSON request body
    ///
    /// # Errors
    /// See [`PodioClient::send_json`].
    pub async fn send_json_with<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiReply<T>, ApiError> {
        debug!(%method, path, "Podio request");
        let mut builder = self.request(method, path)?;
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = self.execute(builder, path).await?;
        let quota = parse_quota_headers(response.headers());
        let text = response.text().await.map_err(network_error)?;
        let value = serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("{path}: {e}: {}", truncate(&text)))
        })?;
        Ok(ApiReply { value, quota })
    }

    /// Issues a GET and returns the raw body
    ///
    /// # Errors
    /// Any [`ApiError`].
    pub async fn send_bytes(&self, path: &str) -> Result<ApiReply<Vec<u8>>, ApiError> {
        debug!(path, "Podio download");
        let builder = self.request(Method::GET, path)?;
        let response = self.execute(builder, path).await?;
        let quota = parse_quota_headers(response.headers());
        let bytes = response.bytes().await.map_err(network_error)?;
        debug!(path, len = bytes.len(), "Download complete");
        Ok(ApiReply {
            value: bytes.to_vec(),
            quota,
        })
    }
}
