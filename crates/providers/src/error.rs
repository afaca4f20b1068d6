use std::time::Duration;

use thiserror::Error;

/// Failure talking to a lead provider.
///
/// The three variants are the retry classification the job queue relies on:
///
/// | Variant | Cause | Retryable |
/// |---|---|---|
/// | `NoResponse` | connect failure, timeout, dropped connection | yes |
/// | `Http` | provider answered with an error status (or an unreadable body) | 408/429/5xx only |
/// | `Setup` | missing credentials, bad base URL, unknown provider | never |
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no response from provider: {message}")]
    NoResponse { message: String },

    #[error("provider returned HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
        /// Parsed `Retry-After`, when the provider sent one.
        retry_after: Option<Duration>,
    },

    #[error("provider setup error: {0}")]
    Setup(String),
}

/// Coarse class of a [`ProviderError`], used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    NoResponse,
    HttpStatus,
    Setup,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::NoResponse => "no_response",
            ProviderErrorKind::HttpStatus => "http_status",
            ProviderErrorKind::Setup => "setup",
        }
    }
}

impl ProviderError {
    pub fn no_response(message: impl Into<String>) -> Self {
        Self::NoResponse {
            message: message.into(),
        }
    }

    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup(message.into())
    }

    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            ProviderError::NoResponse { .. } => ProviderErrorKind::NoResponse,
            ProviderError::Http { .. } => ProviderErrorKind::HttpStatus,
            ProviderError::Setup(_) => ProviderErrorKind::Setup,
        }
    }

    /// Whether the same request may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::NoResponse { .. } => true,
            ProviderError::Http { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            ProviderError::Setup(_) => false,
        }
    }

    /// Minimum wait the provider asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A single provider record could not be normalized.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record has no usable {0}")]
    MissingKey(&'static str),
}
