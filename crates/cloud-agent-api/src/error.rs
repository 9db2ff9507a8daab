use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Failure taxonomy shared by every gateway implementation.
///
/// The HTTP gateway is the only place that turns transport outcomes into
/// these variants; everything above it matches on them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("authentication failed: {message}")]
    Auth { message: String },
    #[error("rate limited{}", format_retry_after(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("malformed response: {message}")]
    MalformedResponse { message: String },
    #[error("request failed: {message}")]
    RequestFailed {
        status: Option<u16>,
        message: String,
    },
    #[error("request timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
}

impl ApiError {
    #[must_use]
    pub fn missing_credential() -> Self {
        Self::Auth {
            message: "no credential configured".to_string(),
        }
    }

    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn request_failed(message: impl Into<String>) -> Self {
        Self::RequestFailed {
            status: None,
            message: message.into(),
        }
    }

    /// Maps a non-success HTTP status onto the taxonomy.
    ///
    /// 401/403 are auth failures, 404/409 are not-found, 429 is a rate limit
    /// and anything else becomes a request failure carrying the body.
    #[must_use]
    pub fn from_status(status: StatusCode, body: &[u8], retry_after: Option<Duration>) -> Self {
        let message = non_empty_string(String::from_utf8_lossy(body).to_string())
            .unwrap_or_else(|| "<empty>".to_string());
        match status.as_u16() {
            401 | 403 => Self::Auth { message },
            404 | 409 => Self::NotFound { message },
            429 => Self::RateLimited { retry_after },
            code => Self::RequestFailed {
                status: Some(code),
                message,
            },
        }
    }

    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

fn format_retry_after(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|value| format!(" (retry after {}s)", value.as_secs()))
        .unwrap_or_default()
}

pub(crate) fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
