//! Shared HTTP plumbing for provider-backed senders.
//!
//! Classification rules:
//! - network errors, timeouts, 408, 425, 5xx → transient
//! - 429 → rate limited (deferral), honouring `Retry-After`
//! - any other 4xx → permanent

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};

use crate::sender::SendError;

/// Deferral used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Longest provider error body kept on the delivery record.
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Build the HTTP client shared by all senders.
///
/// The dispatcher applies its own hard timeout around each send; this one
/// bounds a single request so a hung connection cannot outlive it.
pub fn build_client(timeout: Duration) -> anyhow::Result<Client> {
    let client = Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    Ok(client)
}

/// Map a non-success status to a [`SendError`].
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> SendError {
    let detail = format!(
        "HTTP {}: {}",
        status.as_u16(),
        body.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>()
    );

    if status == StatusCode::TOO_MANY_REQUESTS {
        return SendError::RateLimited {
            retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
        };
    }

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_EARLY
    {
        return SendError::Transient(detail);
    }

    SendError::Permanent(detail)
}

/// Map a transport-level failure to a [`SendError`].
pub fn classify_transport(err: &reqwest::Error) -> SendError {
    if err.is_builder() {
        return SendError::Permanent(format!("invalid request: {}", err));
    }
    SendError::Transient(format!("transport error: {}", err))
}

/// Parse a `Retry-After` header given in seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Pass successful responses through, classify everything else.
pub async fn check_response(response: Response) -> Result<Response, SendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, retry_after, &body))
}
