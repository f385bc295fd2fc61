//! Error classification for failed sync attempts

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Classification of a failed attempt
///
/// Transient codes are expected to succeed if retried; everything else is
/// permanent. [`ErrorCode::Unknown`] is permanent so that an unclassified
/// failure ends in the dead-letter state instead of retrying forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Upstream or downstream call timed out
    Timeout,
    /// Connection dropped or reset mid-call
    ConnectionReset,
    /// Rate limit response (e.g. HTTP 429)
    RateLimited,
    /// Dependency temporarily unavailable (e.g. HTTP 503)
    Unavailable,
    /// Payload failed validation
    Validation,
    /// Referenced record does not exist
    NotFound,
    /// Credentials rejected or permission denied
    Unauthorized,
    /// No handler registered for the entry's entity type
    HandlerNotFound,
    /// Anything not classified above
    Unknown,
}

impl ErrorCode {
    /// Whether a failure with this code may succeed on retry
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionReset | Self::RateLimited | Self::Unavailable
        )
    }

    /// Stable string form used for persistence
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::ConnectionReset => "CONNECTION_RESET",
            Self::RateLimited => "RATE_LIMITED",
            Self::Unavailable => "UNAVAILABLE",
            Self::Validation => "VALIDATION",
            Self::NotFound => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::HandlerNotFound => "HANDLER_NOT_FOUND",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = std::convert::Infallible;

    /// Unrecognised codes parse as [`ErrorCode::Unknown`]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "TIMEOUT" => Self::Timeout,
            "CONNECTION_RESET" => Self::ConnectionReset,
            "RATE_LIMITED" => Self::RateLimited,
            "UNAVAILABLE" => Self::Unavailable,
            "VALIDATION" => Self::Validation,
            "NOT_FOUND" => Self::NotFound,
            "UNAUTHORIZED" => Self::Unauthorized,
            "HANDLER_NOT_FOUND" => Self::HandlerNotFound,
            _ => Self::Unknown,
        })
    }
}

/// Classify an error code as retryable
pub fn is_transient(code: ErrorCode) -> bool {
    code.is_transient()
}
