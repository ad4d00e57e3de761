//! Error types for the resilience layer
//!
//! Remote failures are classified where they are produced, so the retry loop
//! only ever asks [`Error::is_transient`] and never inspects message text.

use thiserror::Error;
use tower::BoxError;

/// Result type alias for the resilience layer
pub type Result<T> = std::result::Result<T, Error>;

/// Message fragments that mark a rate-limit or quota failure.
///
/// Matching is case-insensitive. A message that mentions "quota" or "429" for
/// an unrelated reason is misclassified as transient; callers that can see a
/// status code should build [`Error::Transient`] / [`Error::Permanent`] directly.
pub const TRANSIENT_MARKERS: &[&str] = &["429", "resource_exhausted", "quota"];

/// Main error type for the resilience layer
#[derive(Debug, Error)]
pub enum Error {
    /// Rate-limit or quota failure, eligible for retry
    #[error("{message}")]
    Transient {
        message: String,
        status: Option<u16>,
    },

    /// Any other remote failure
    #[error("{message}")]
    Permanent { message: String },

    /// Retry budget spent on transient failures
    #[error("Rate limit exceeded after {attempts} attempts. Please wait a moment and try again.")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },

    /// Invalid configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// A transient failure with an optional HTTP status.
    pub fn transient(message: impl Into<String>, status: Option<u16>) -> Self {
        Error::Transient {
            message: message.into(),
            status,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Error::Permanent {
            message: message.into(),
        }
    }

    /// Build an error from an HTTP status and body text.
    ///
    /// 429 is transient; everything else falls back to the message markers.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 429 || has_transient_marker(&message) {
            Error::Transient {
                message,
                status: Some(status),
            }
        } else {
            Error::Permanent { message }
        }
    }

    /// Build an error when the remote collaborator only hands back a message.
    pub fn from_remote_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if has_transient_marker(&message) {
            Error::Transient {
                message,
                status: None,
            }
        } else {
            Error::Permanent { message }
        }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }
}

/// Returns true when `message` contains one of [`TRANSIENT_MARKERS`].
pub fn has_transient_marker(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Classify a type-erased service error.
///
/// Errors of this crate's type keep their own classification; anything else
/// is judged by its display text.
pub fn classify_boxed(error: &BoxError) -> bool {
    match error.downcast_ref::<Error>() {
        Some(e) => e.is_transient(),
        None => has_transient_marker(&error.to_string()),
    }
}
