use thiserror::Error;

use crate::connection::ConnectionError;
use crate::credentials::CredentialError;

/// A failure reported by (or on the way to) the remote data service.
///
/// Carries whatever classification signals the transport could recover:
/// an explicit error code, an HTTP-like status, and the human-readable
/// message. [`RetryPolicy::classify`](crate::retry::RetryPolicy) consumes
/// these in that order of preference.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TransportError {
    /// Explicit upstream error code, e.g. `UNAUTHORIZED` or `THROTTLING_ERROR`.
    pub code: Option<Box<str>>,
    /// HTTP status, when the transport saw one.
    pub status: Option<u16>,
    pub message: Box<str>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    pub fn message(message: impl Into<Box<str>>) -> Self {
        Self {
            code: None,
            status: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn service(code: impl Into<Box<str>>, message: impl Into<Box<str>>) -> Self {
        Self {
            code: Some(code.into()),
            status: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn status(status: u16, message: impl Into<Box<str>>) -> Self {
        Self {
            code: None,
            status: Some(status),
            message: message.into(),
            source: None,
        }
    }

    pub fn network(
        message: impl Into<Box<str>>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code: Some("NETWORK_ERROR".into()),
            status: None,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::network(format!("io error: {err}"), err)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            "TIMEOUT"
        } else if err.is_connect() {
            "CONNECTION_ERROR"
        } else {
            "NETWORK_ERROR"
        };
        Self {
            code: Some(code.into()),
            status: err.status().map(|s| s.as_u16()),
            message: format!("request failed: {err}").into(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        // Malformed payloads are not retryable: code stays empty so the
        // classifier falls through to its non-retryable default.
        Self {
            code: None,
            status: None,
            message: format!("malformed payload: {err}").into(),
            source: Some(Box::new(err)),
        }
    }
}

/// The closed error taxonomy surfaced to consumers of this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, rejected locally, never retried.
    Validation,
    /// Missing, expired, or denied credential.
    Auth,
    /// Local admission rejection; the caller may retry later.
    RateLimited,
    /// Transient upstream failure, retried automatically up to the budget.
    Transient,
    /// Retry budget exhausted or a non-retryable upstream failure.
    Terminal,
}

/// Error type for every operation exposed by this crate.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] CredentialError),

    /// An authorization failure that survived the single forced credential
    /// refresh. Terminal for the operation.
    #[error("authorization rejected after credential refresh")]
    AuthRejected(#[source] TransportError),

    #[error("rate limit exceeded for {0}")]
    RateLimited(Box<str>),

    #[error("retries exhausted after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("request failed")]
    Terminal(#[source] TransportError),

    /// The upstream answered with a structurally valid envelope whose shape
    /// does not match the operation that was issued.
    #[error("unexpected response shape")]
    UnexpectedResponse,

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

impl ClientError {
    /// Where this error falls in the taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Validation(_) => ErrorKind::Validation,
            ClientError::Auth(_) | ClientError::AuthRejected(_) => ErrorKind::Auth,
            ClientError::RateLimited(_) => ErrorKind::RateLimited,
            ClientError::Exhausted { .. }
            | ClientError::Terminal(_)
            | ClientError::UnexpectedResponse => ErrorKind::Terminal,
            // A shut-down controller never comes back; only live-channel
            // failures are worth retrying against.
            ClientError::Connection(ConnectionError::Closed) => ErrorKind::Terminal,
            ClientError::Connection(_) => ErrorKind::Transient,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_taxonomy() {
        assert_eq!(
            ClientError::Validation("bad window".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            ClientError::RateLimited("stats".into()).kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            ClientError::Terminal(TransportError::message("nope")).kind(),
            ErrorKind::Terminal
        );
    }

    #[test]
    fn closed_controller_errors_are_terminal() {
        assert_eq!(
            ClientError::Connection(ConnectionError::Closed).kind(),
            ErrorKind::Terminal
        );
        assert_eq!(
            ClientError::Connection(ConnectionError::Rejected(TransportError::message(
                "stream hiccup"
            )))
            .kind(),
            ErrorKind::Transient
        );
    }
}
