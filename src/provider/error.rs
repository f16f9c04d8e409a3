//! Provider error taxonomy and HTTP status classification.
//!
//! Classification feeds two different consumers: the circuit breaker (which
//! failures demote a provider) and the turn loop (which failures belong to the
//! caller's own input and must not demote anyone).

use std::fmt;
use std::time::Duration;

/// What went wrong when invoking a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Provider did not respond within its invoke timeout.
    Timeout,
    /// Provider rejected the request due to rate limiting (429-equivalent).
    RateLimited,
    /// 5xx-equivalent failure on the provider side.
    ServerError,
    /// Connection-level failure before a response was produced.
    Network,
    /// Authentication rejected (401/403). Will not self-heal until an
    /// operator rotates credentials.
    InvalidCredentials,
    /// The request we sent was unusable (empty audio, oversized payload).
    /// Indicates a bug or bad input on the calling side, not provider health.
    CallerInput,
    /// Response arrived but could not be understood.
    Protocol,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::Network => "network",
            Self::InvalidCredentials => "invalid_credentials",
            Self::CallerInput => "caller_input",
            Self::Protocol => "protocol",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a provider invocation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// HTTP status, when the failure came from an HTTP response.
    pub status_code: Option<u16>,
    /// Server-suggested wait before retrying (Retry-After).
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            status_code: Some(429),
            ..Self::new(ProviderErrorKind::RateLimited, message)
        }
    }

    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code),
            ..Self::new(ProviderErrorKind::ServerError, message)
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Network, message)
    }

    pub fn invalid_credentials(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code),
            ..Self::new(ProviderErrorKind::InvalidCredentials, message)
        }
    }

    pub fn caller_input(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::CallerInput, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Protocol, message)
    }

    /// Whether this failure counts toward the provider's circuit breaker.
    ///
    /// Everything except caller-input errors does: timeouts, rate limits, and
    /// 5xx all indicate the provider cannot serve traffic right now, and bad
    /// credentials keep failing until an operator intervenes.
    pub fn counts_toward_breaker(&self) -> bool {
        self.kind != ProviderErrorKind::CallerInput
    }

    /// Fatal configuration errors are logged at higher severity because they
    /// will not self-heal.
    pub fn is_fatal_config(&self) -> bool {
        self.kind == ProviderErrorKind::InvalidCredentials
    }
}

/// Map an HTTP status code to an error kind.
pub fn classify_http_status(status: u16) -> ProviderErrorKind {
    match status {
        401 | 403 => ProviderErrorKind::InvalidCredentials,
        408 => ProviderErrorKind::Timeout,
        429 => ProviderErrorKind::RateLimited,
        400 | 413 | 415 | 422 => ProviderErrorKind::CallerInput,
        500..=599 => ProviderErrorKind::ServerError,
        _ => ProviderErrorKind::Protocol,
    }
}

/// Build a `ProviderError` from an HTTP response status and body.
pub fn from_http_response(status: u16, body: &str, retry_after: Option<Duration>) -> ProviderError {
    let kind = classify_http_status(status);
    let message = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, body)
    };
    ProviderError {
        kind,
        message,
        status_code: Some(status),
        retry_after,
    }
}
