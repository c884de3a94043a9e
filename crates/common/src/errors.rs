//! Error taxonomy shared by every crate of the gateway.
//!
//! Transient failures (`ProviderError` with a transient kind, `HealthCheckFailure`)
//! are absorbed by retry and failover. Only `FailoverError` values that survive
//! every recovery path reach the HTTP caller.

use std::fmt;
use thiserror::Error;

/// Classification of a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The call did not complete within its deadline.
    Timeout,
    /// Connection refused, DNS failure, reset by peer.
    Network,
    /// 5xx from the backend.
    Server,
    /// 429 from the backend.
    RateLimited,
    /// 401 / 403, missing or rejected credentials.
    Unauthorized,
    /// 4xx other than auth and rate limiting: the request itself is wrong.
    InvalidRequest,
    /// The backend answered but the body could not be understood.
    Decode,
    /// No adapter is registered under the requested id.
    NotConfigured,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::Network => "network",
            ProviderErrorKind::Server => "server_error",
            ProviderErrorKind::RateLimited => "rate_limit",
            ProviderErrorKind::Unauthorized => "unauthorized",
            ProviderErrorKind::InvalidRequest => "bad_request",
            ProviderErrorKind::Decode => "decode",
            ProviderErrorKind::NotConfigured => "not_configured",
        }
    }

    /// Map an HTTP status of a failed response to an error kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimited,
            401 | 403 => ProviderErrorKind::Unauthorized,
            500..=599 => ProviderErrorKind::Server,
            _ => ProviderErrorKind::InvalidRequest,
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A specific backend rejected or failed a call.
#[derive(Debug, Clone, Error)]
#[error("provider '{provider}' failed ({kind}): {message}")]
pub struct ProviderError {
    pub provider: String,
    pub kind: ProviderErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn from_status(
        provider: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind: ProviderErrorKind::from_status(status),
            message: message.into(),
            status_code: Some(status),
        }
    }

    pub fn timeout(provider: impl Into<String>, after: std::time::Duration) -> Self {
        Self::new(
            provider,
            ProviderErrorKind::Timeout,
            format!("no response within {:?}", after),
        )
    }

    pub fn not_configured(provider: impl Into<String>) -> Self {
        let provider = provider.into();
        let message = format!("no adapter registered for '{}'", provider);
        Self::new(provider, ProviderErrorKind::NotConfigured, message)
    }

    /// Timeouts, network errors, 5xx and rate limiting are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Timeout
                | ProviderErrorKind::Network
                | ProviderErrorKind::Server
                | ProviderErrorKind::RateLimited
        )
    }

    /// Whether a failure of the primary should move the turn to an alternate.
    /// Only a request the backend judged malformed is surfaced as is.
    pub fn warrants_failover(&self) -> bool {
        self.kind != ProviderErrorKind::InvalidRequest
    }
}

/// Session or audit storage failed.
#[derive(Debug, Clone, Error)]
#[error("persistence operation '{operation}' failed: {reason}")]
pub struct PersistenceError {
    pub operation: String,
    pub reason: String,
}

impl PersistenceError {
    pub fn new(operation: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

/// Top-level outcome of a routed turn.
#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("primary health check failed: {reason}")]
    HealthCheckFailure { reason: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("failed to persist session context: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("no provider available: {reason}")]
    NoProviderAvailable {
        reason: String,
        #[source]
        last_error: Option<ProviderError>,
    },

    #[error("provider '{provider}' failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        provider: String,
        attempts: u32,
        #[source]
        last_error: ProviderError,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("request cancelled")]
    Cancelled,
}

impl FailoverError {
    pub fn no_provider(reason: impl Into<String>) -> Self {
        FailoverError::NoProviderAvailable {
            reason: reason.into(),
            last_error: None,
        }
    }

    /// HTTP status to report to the caller.
    pub fn status_code(&self) -> u16 {
        match self {
            FailoverError::InvalidRequest(_) => 400,
            FailoverError::Cancelled => 499,
            _ => 500,
        }
    }

    /// Component name for operator diagnosis.
    pub fn component(&self) -> &'static str {
        match self {
            FailoverError::HealthCheckFailure { .. } => "health_probe",
            FailoverError::Provider(_) | FailoverError::ExhaustedRetries { .. } => "provider",
            FailoverError::Persistence(_) => "session_store",
            FailoverError::NoProviderAvailable { .. } => "failover_controller",
            FailoverError::InvalidRequest(_) => "request",
            FailoverError::Configuration(_) => "configuration",
            FailoverError::Cancelled => "router",
        }
    }
}

pub type FailoverResult<T> = Result<T, FailoverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ProviderErrorKind::from_status(429), ProviderErrorKind::RateLimited);
        assert_eq!(ProviderErrorKind::from_status(503), ProviderErrorKind::Server);
        assert_eq!(ProviderErrorKind::from_status(401), ProviderErrorKind::Unauthorized);
        assert_eq!(ProviderErrorKind::from_status(400), ProviderErrorKind::InvalidRequest);
        assert_eq!(ProviderErrorKind::from_status(408), ProviderErrorKind::Timeout);
    }

    #[test]
    fn test_transient_errors() {
        assert!(ProviderError::from_status("openai", 502, "bad gateway").is_transient());
        assert!(ProviderError::from_status("openai", 429, "slow down").is_transient());
        let timeout = ProviderError::timeout("openai", std::time::Duration::from_secs(30));
        assert!(timeout.is_transient());
        assert!(!ProviderError::from_status("openai", 400, "malformed").is_transient());
        assert!(!ProviderError::from_status("openai", 401, "bad key").is_transient());
        assert!(!ProviderError::not_configured("groq").is_transient());
    }

    #[test]
    fn test_only_malformed_requests_skip_failover() {
        assert!(ProviderError::from_status("primary", 401, "bad key").warrants_failover());
        assert!(ProviderError::from_status("primary", 503, "busy").warrants_failover());
        assert!(ProviderError::not_configured("primary").warrants_failover());
        let decode = ProviderError::new("primary", ProviderErrorKind::Decode, "not json");
        assert!(decode.warrants_failover());
        assert!(!ProviderError::from_status("primary", 400, "malformed").warrants_failover());
    }

    #[test]
    fn test_failover_error_status_codes() {
        assert_eq!(FailoverError::InvalidRequest("empty".into()).status_code(), 400);
        assert_eq!(FailoverError::no_provider("none").status_code(), 500);

        let exhausted = FailoverError::ExhaustedRetries {
            provider: "primary".into(),
            attempts: 3,
            last_error: ProviderError::from_status("primary", 500, "boom"),
        };
        assert_eq!(exhausted.status_code(), 500);
        assert_eq!(exhausted.component(), "provider");
        assert!(exhausted.to_string().contains("3 attempts"));
    }
}
