//! Classification of HTTP failures from external services

use std::time::Duration;

use reqwest::StatusCode;

/// How an HTTP call to a remote service failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpFailure {
    /// Connection problems, 5xx, 429, 408: worth another attempt
    Unavailable(String),
    /// The client-side timeout elapsed
    TimedOut(Duration),
    /// Any other 4xx: retrying will not help
    Rejected {
        /// Response status
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },
}

/// Longest response body kept in error messages
const MAX_BODY_CHARS: usize = 512;

/// Build a `reqwest` client bounded by `timeout`
///
/// Falls back to an unbounded default client if the builder fails; callers
/// still wrap every attempt in the retry policy's own timeout.
#[must_use]
pub fn client_with_timeout(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to build HTTP client, using defaults");
            reqwest::Client::new()
        })
}

/// Classify an error raised while sending or reading a request
#[must_use]
pub fn classify_error(error: &reqwest::Error, timeout: Duration) -> HttpFailure {
    if error.is_timeout() {
        return HttpFailure::TimedOut(timeout);
    }
    if let Some(status) = error.status() {
        return classify_status(status, &error.to_string());
    }
    HttpFailure::Unavailable(error.to_string())
}

/// Classify a non-success response status
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> HttpFailure {
    let body: String = body.chars().take(MAX_BODY_CHARS).collect();

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        HttpFailure::Unavailable(format!("{status}: {body}"))
    } else {
        HttpFailure::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}
