//! Entity handler trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::persistence::OperationType;
use crate::reliability::ErrorCode;

/// Error type for handler failures
///
/// The [`ErrorCode`] decides whether the attempt is retried; the message is
/// stored on the entry for operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerError {
    /// Error message
    pub message: String,

    /// Classification used by the retry policy
    pub code: ErrorCode,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl HandlerError {
    /// Create an error with an explicit classification
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            details: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionReset, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimited, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether the failure may succeed on retry
    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Unclassified errors are permanent
impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(ErrorCode::Unknown, err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::validation(err.to_string())
    }
}

/// Result of a successful sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Identifier of the record created or updated locally
    pub target_entity_id: String,

    /// Anything else the handler wants recorded on the entry
    #[serde(default)]
    pub details: serde_json::Value,
}

impl SyncOutcome {
    pub fn new(target_entity_id: impl Into<String>) -> Self {
        Self {
            target_entity_id: target_entity_id.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Performs the actual synchronization for one entity type
///
/// # Example
///
/// ```ignore
/// use reconcile_queue::prelude::*;
///
/// struct ProductHandler { catalog: Catalog }
///
/// #[async_trait]
/// impl EntityHandler for ProductHandler {
///     async fn sync(
///         &self,
///         payload: &serde_json::Value,
///         operation: OperationType,
///     ) -> Result<SyncOutcome, HandlerError> {
///         let product: Product = serde_json::from_value(payload.clone())?;
///         let id = self.catalog.upsert(product).await?;
///         Ok(SyncOutcome::new(id))
///     }
/// }
/// ```
#[async_trait]
pub trait EntityHandler: Send + Sync + 'static {
    /// Apply `operation` using the entry's payload
    ///
    /// # Errors
    ///
    /// Return a transient [`ErrorCode`] for failures that should be retried
    /// and a permanent one for failures that never will succeed.
    async fn sync(
        &self,
        payload: &serde_json::Value,
        operation: OperationType,
    ) -> Result<SyncOutcome, HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_classification() {
        assert!(HandlerError::timeout("slow").is_transient());
        assert!(HandlerError::rate_limited("429").is_transient());
        assert!(!HandlerError::validation("bad sku").is_transient());
        assert!(!HandlerError::not_found("gone").is_transient());
    }

    #[test]
    fn test_anyhow_errors_are_permanent() {
        let error: HandlerError = anyhow::anyhow!("something odd").into();
        assert_eq!(error.code, ErrorCode::Unknown);
        assert!(!error.is_transient());
    }

    #[test]
    fn test_display_includes_code() {
        let error = HandlerError::unavailable("upstream 503");
        assert_eq!(error.to_string(), "UNAVAILABLE: upstream 503");
    }

    #[test]
    fn test_sync_outcome_details_default() {
        let outcome: SyncOutcome =
            serde_json::from_value(serde_json::json!({"target_entity_id": "inv-9"})).unwrap();
        assert_eq!(outcome, SyncOutcome::new("inv-9"));
    }
}
