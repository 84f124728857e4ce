//! # geosieve-error
//!
//! Unified error types for the geosieve spatial filter engine.
//!
//! Every failure that crosses a backend boundary is expressed as a [`SieveError`]:
//! - Numeric error codes (GEOSIEVE-XXXX) grouped into stable ranges
//! - Structured JSON context
//! - Optional hints describing how to correct the request
//!
//! The [`ErrorCategory`] of a code decides engine policy: lock errors are
//! retried, connection errors move the request to the next backend, and
//! everything else is reported on the `FilterResult`.

mod code;
mod context;
mod convert;

pub use code::{ErrorCategory, ErrorCode};
pub use context::ErrorContext;
pub use convert::find_closest_match;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The unified error type for all geosieve operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SieveError {
    /// Numeric error code (e.g., "GEOSIEVE-1004")
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Structured context for programmatic handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,

    /// Suggestion for correcting the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl SieveError {
    /// Create a new error with code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            hint: None,
        }
    }

    /// Add structured context
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Add a hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Transient write-lock contention on an embedded database file.
    pub fn is_lock(&self) -> bool {
        self.code == ErrorCode::DatabaseLocked
    }

    /// Connection-class failures (including an open circuit) move the
    /// request on to the next backend in the selection chain.
    pub fn triggers_fallback(&self) -> bool {
        self.category() == ErrorCategory::Connection
    }

    /// Whether this error should count against a circuit breaker.
    ///
    /// Malformed expressions and invalid input are the caller's fault and do
    /// not say anything about the health of the backend.
    pub fn counts_as_breaker_failure(&self) -> bool {
        match self.category() {
            ErrorCategory::Connection => self.code != ErrorCode::CircuitOpen,
            ErrorCategory::Storage => true,
            ErrorCategory::Internal => true,
            ErrorCategory::Expression => self.code == ErrorCode::QueryFailed,
            ErrorCategory::Config | ErrorCategory::Geometry => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::QueryCancelled
    }

    /// Serialize to JSON for API responses
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize SieveError: {}", e);
            format!(
                r#"{{"code":"{}","message":"Serialization failed"}}"#,
                self.code
            )
        })
    }

    /// Serialize to pretty JSON for logging
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| self.to_json())
    }

    // Shorthand constructors for the codes the engine raises most often.

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::QueryCancelled, "Filter request was cancelled")
    }

    pub fn circuit_open(resource: &str) -> Self {
        Self::new(
            ErrorCode::CircuitOpen,
            format!("Circuit breaker '{}' is OPEN", resource),
        )
        .with_hint("The backend failed repeatedly; the request will use the next backend")
    }

    pub fn expression(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidExpression, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalPanic, message)
    }
}

impl fmt::Display for SieveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " (Hint: {})", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for SieveError {}

/// Result type alias for geosieve operations
pub type Result<T> = std::result::Result<T, SieveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sieve_error_builder() {
        let err = SieveError::new(ErrorCode::MissingPrimaryKey, "No key for 'parcels'")
            .with_hint("Declare a primary key column");

        assert_eq!(err.code, ErrorCode::MissingPrimaryKey);
        assert_eq!(err.message, "No key for 'parcels'");
        assert_eq!(err.hint, Some("Declare a primary key column".to_string()));
        assert!(err.context.is_none());
    }

    #[test]
    fn test_display_implementation() {
        let err = SieveError::new(ErrorCode::InvalidExpression, "Unexpected token")
            .with_hint("Remove comma");

        assert_eq!(
            err.to_string(),
            "[GEOSIEVE-2001] Unexpected token (Hint: Remove comma)"
        );

        let err_no_hint = SieveError::new(ErrorCode::InternalPanic, "Crash");
        assert_eq!(err_no_hint.to_string(), "[GEOSIEVE-9002] Crash");
    }

    #[test]
    fn test_json_output() {
        let err = SieveError::new(ErrorCode::PoolExhausted, "Too many connections");
        let json = err.to_json();

        assert!(json.contains("\"code\":\"GEOSIEVE-1003\""));
        assert!(json.contains("\"message\":\"Too many connections\""));
    }

    #[test]
    fn test_policy_helpers() {
        assert!(SieveError::new(ErrorCode::DatabaseLocked, "busy").is_lock());
        assert!(!SieveError::new(ErrorCode::QueryFailed, "boom").is_lock());

        assert!(SieveError::circuit_open("relational").triggers_fallback());
        assert!(SieveError::new(ErrorCode::PoolExhausted, "x").triggers_fallback());
        assert!(!SieveError::expression("bad").triggers_fallback());
        assert!(!SieveError::new(ErrorCode::ViewCreationFailed, "x").triggers_fallback());
    }

    #[test]
    fn test_breaker_failure_classification() {
        assert!(SieveError::new(ErrorCode::ConnectionFailed, "x").counts_as_breaker_failure());
        assert!(SieveError::new(ErrorCode::QueryFailed, "x").counts_as_breaker_failure());
        assert!(!SieveError::expression("bad").counts_as_breaker_failure());
        assert!(!SieveError::circuit_open("embedded").counts_as_breaker_failure());
        assert!(!SieveError::new(ErrorCode::InvalidGeometry, "x").counts_as_breaker_failure());
    }
}
