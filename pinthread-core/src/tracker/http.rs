//! Shared HTTP plumbing for the REST providers: bounded retries with
//! exponential backoff on transport failures, 429 and 5xx responses.
//!
//! Only requests that are safe to repeat get the full treatment. A `POST`
//! creates something, so it is repeated only when the server provably did
//! not act on it: a 429, or a connection that was never established. A 5xx
//! or a timeout after the request went out may have created the issue or
//! comment already.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use super::TrackerSettings;
use crate::error::TrackerError;

const MAX_RETRY_DELAY_MS: u64 = 30_000;
const ERROR_BODY_LIMIT: usize = 800;

#[derive(Clone)]
pub(crate) struct HttpClient {
    http: Client,
    api_base: String,
    provider: &'static str,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl HttpClient {
    pub(crate) fn new(
        provider: &'static str,
        api_base: &str,
        headers: HeaderMap,
        settings: &TrackerSettings,
    ) -> Result<Self, TrackerError> {
        let http = Client::builder()
            .default_headers(headers)
            .timeout(settings.request_timeout())
            .build()
            .map_err(|error| {
                TrackerError::Configuration(format!("failed to build {provider} HTTP client: {error}"))
            })?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_owned(),
            provider,
            retry_max_attempts: settings.retry_max_attempts.max(1),
            retry_base_delay_ms: settings.retry_base_delay_ms.max(1),
        })
    }

    pub(crate) fn client(&self) -> &Client {
        &self.http
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    /// Sends the request built by `build`, rebuilding it for every attempt.
    /// Returns the first successful response.
    ///
    /// # Errors
    ///
    /// `Status` for a non-2xx response that is not retried (or is the last
    /// attempt), `Transport` when no response arrived.
    pub(crate) async fn send<F>(&self, operation: &str, mut build: F) -> Result<Response, TrackerError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            tracing::debug!(provider = self.provider, operation, attempt, "tracker request");
            let request = build()
                .header("x-pinthread-retry-attempt", attempt.saturating_sub(1).to_string())
                .build()
                .map_err(|error| {
                    TrackerError::Transport(format!("{} {operation} request is invalid: {error}", self.provider))
                })?;
            let repeatable = is_repeatable(request.method());
            match self.http.execute(request).await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < self.retry_max_attempts && is_retryable_status(status, repeatable) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, retry_after)).await;
                        continue;
                    }
                    return Err(TrackerError::Status {
                        status,
                        body: truncate_for_error(&body, ERROR_BODY_LIMIT),
                    });
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error, repeatable) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None)).await;
                        continue;
                    }
                    return Err(TrackerError::Transport(format!(
                        "{} {operation} request failed: {error}",
                        self.provider
                    )));
                }
            }
        }
    }

    pub(crate) async fn json<T, F>(&self, operation: &str, build: F) -> Result<T, TrackerError>
    where
        T: DeserializeOwned,
        F: FnMut() -> RequestBuilder,
    {
        let (value, _) = self.json_with_headers(operation, build).await?;
        Ok(value)
    }

    pub(crate) async fn json_with_headers<T, F>(
        &self,
        operation: &str,
        build: F,
    ) -> Result<(T, HeaderMap), TrackerError>
    where
        T: DeserializeOwned,
        F: FnMut() -> RequestBuilder,
    {
        let response = self.send(operation, build).await?;
        let headers = response.headers().clone();
        let body = response.text().await.map_err(|error| {
            TrackerError::Transport(format!("{} {operation} response read failed: {error}", self.provider))
        })?;
        let value = serde_json::from_str(&body).map_err(|error| {
            TrackerError::Decode(format!("{} {operation}: {error}", self.provider))
        })?;
        Ok((value, headers))
    }

    pub(crate) async fn status_only<F>(&self, operation: &str, build: F) -> Result<(), TrackerError>
    where
        F: FnMut() -> RequestBuilder,
    {
        self.send(operation, build).await.map(|_| ())
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?;
    let seconds = raw.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

pub(crate) fn retry_delay(base_delay_ms: u64, attempt: usize, retry_after: Option<Duration>) -> Duration {
    if let Some(delay) = retry_after {
        return delay.max(Duration::from_millis(base_delay_ms));
    }
    let exponent = attempt.saturating_sub(1).min(10) as u32;
    let scaled = base_delay_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(scaled.min(MAX_RETRY_DELAY_MS))
}

/// Everything except `POST` is idempotent for the endpoints used here.
fn is_repeatable(method: &Method) -> bool {
    *method != Method::POST
}

fn is_retryable_transport_error(error: &reqwest::Error, repeatable: bool) -> bool {
    error.is_connect() || (repeatable && (error.is_timeout() || error.is_request()))
}

fn is_retryable_status(status: u16, repeatable: bool) -> bool {
    status == 429 || (repeatable && status >= 500)
}

fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_exponentially_and_is_capped() {
        assert_eq!(retry_delay(100, 1, None), Duration::from_millis(100));
        assert_eq!(retry_delay(100, 2, None), Duration::from_millis(200));
        assert_eq!(retry_delay(100, 4, None), Duration::from_millis(800));
        assert_eq!(retry_delay(10_000, 9, None), Duration::from_millis(MAX_RETRY_DELAY_MS));
    }

    #[test]
    fn retry_after_header_wins_but_never_below_base() {
        assert_eq!(retry_delay(100, 3, Some(Duration::from_secs(2))), Duration::from_secs(2));
        assert_eq!(retry_delay(500, 1, Some(Duration::ZERO)), Duration::from_millis(500));
    }

    #[test]
    fn only_rate_limits_and_server_errors_are_retried() {
        assert!(is_retryable_status(429, true));
        assert!(is_retryable_status(502, true));
        assert!(!is_retryable_status(404, true));
        assert!(!is_retryable_status(422, true));
    }

    #[test]
    fn creates_are_repeated_only_on_rate_limits() {
        assert!(!is_repeatable(&Method::POST));
        assert!(is_repeatable(&Method::PATCH));
        assert!(is_repeatable(&Method::DELETE));
        assert!(is_retryable_status(429, false));
        assert!(!is_retryable_status(502, false));
        assert!(!is_retryable_status(504, false));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(900);
        let truncated = truncate_for_error(&body, 800);
        assert_eq!(truncated.chars().count(), 803);
        assert!(truncated.ends_with("..."));
    }
}
