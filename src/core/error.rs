//! Error types for media-relay
//!
//! Every failure a transfer can hit is projected onto a small, user-facing
//! [`FailureKind`] taxonomy. The richer [`Error`] keeps the detail for logs.

use std::fmt;
use std::time::Duration;

/// Reason a transfer did not end in delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Declared or observed size is above the configured ceiling
    TooLarge,
    /// The hard time ceiling elapsed
    Timeout,
    /// The host says the file does not exist (or refuses to serve it)
    NotFound,
    /// The host answered with an error status
    ServerError,
    /// Connection, transport or mid-stream failure
    NetworkError,
    /// The delivery surface refused every send strategy
    UploadRejected,
    /// The delivery surface is temporarily unavailable
    PlatformTransient,
}

impl FailureKind {
    /// Short explanation suitable for a chat message
    pub fn describe(&self) -> &'static str {
        match self {
            FailureKind::TooLarge => "the file is too large to send here",
            FailureKind::Timeout => "the host was too slow and the transfer timed out",
            FailureKind::NotFound => "the host no longer has this file",
            FailureKind::ServerError => "the host returned an error",
            FailureKind::NetworkError => "the connection to the host was lost",
            FailureKind::UploadRejected => "the file could not be sent in chat",
            FailureKind::PlatformTransient => "the chat service is temporarily unavailable",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::TooLarge => "TooLarge",
            FailureKind::Timeout => "Timeout",
            FailureKind::NotFound => "NotFound",
            FailureKind::ServerError => "ServerError",
            FailureKind::NetworkError => "NetworkError",
            FailureKind::UploadRejected => "UploadRejected",
            FailureKind::PlatformTransient => "PlatformTransient",
        };
        f.write_str(name)
    }
}

/// Main error type for media-relay operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("payload of {size} bytes exceeds the {ceiling} byte ceiling")]
    TooLarge { size: u64, ceiling: u64 },

    #[error("transfer did not finish within {0:?}")]
    Timeout(Duration),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("delivery rejected: {0}")]
    UploadRejected(String),

    #[error("delivery surface unavailable: {0}")]
    PlatformTransient(String),

    /// The platform asked to wait before the next call
    #[error("rate limited for {retry_after:?}: {reason}")]
    RateLimited { retry_after: Duration, reason: String },

    /// The referenced chat message does not exist (anymore)
    #[error("message no longer exists")]
    MessageGone,

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Projects this error onto the user-facing taxonomy
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::TooLarge { .. } => FailureKind::TooLarge,
            Error::Timeout(_) => FailureKind::Timeout,
            Error::NotFound(_) => FailureKind::NotFound,
            Error::HttpError(_) => FailureKind::ServerError,
            Error::NetworkError(_) | Error::IoError(_) => FailureKind::NetworkError,
            Error::UploadRejected(_) | Error::InvalidInput(_) => FailureKind::UploadRejected,
            Error::PlatformTransient(_) | Error::RateLimited { .. } | Error::MessageGone => {
                FailureKind::PlatformTransient
            }
            Error::CatalogUnavailable(_) => FailureKind::ServerError,
        }
    }

    /// Whether repeating the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::PlatformTransient(_) | Error::RateLimited { .. })
    }

    /// Wait requested by the platform, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Maps a non-success HTTP status from a content host
    pub fn from_status(status: reqwest::StatusCode, url: &str) -> Self {
        match status.as_u16() {
            401 | 403 | 404 | 410 => Error::NotFound(format!("{status} for {url}")),
            _ => Error::HttpError(format!("host answered {status} for {url}")),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            let url = err.url().map(|u| u.to_string()).unwrap_or_default();
            return Error::from_status(status, &url);
        }
        if err.is_connect() || err.is_timeout() || err.is_body() || err.is_request() {
            Error::NetworkError(err.to_string())
        } else {
            Error::HttpError(err.to_string())
        }
    }
}

/// Convenience result type for media-relay operations
pub type Result<T> = std::result::Result<T, Error>;
