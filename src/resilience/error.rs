//! Error taxonomy of the fault-tolerance layer.

use axum::http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by fault-tolerant execution.
///
/// `E` is the caller's own error type; it travels unchanged in `Inner`.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// No healthy instance could be selected.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The breaker rejected the call without attempting it.
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// The deadline expired; the in-flight call was abandoned.
    #[error("Operation '{operation}' timed out after {}ms", .timeout.as_millis())]
    Timeout { operation: String, timeout: Duration },

    /// No free permit in the bulkhead pool.
    #[error("Bulkhead pool '{pool}' is full")]
    BulkheadFull { pool: String },

    /// A bulkhead pool was referenced but never created.
    #[error("Bulkhead pool '{0}' does not exist")]
    UnknownPool(String),

    /// Every retry attempt failed. `last` holds the final attempt's error.
    #[error("Operation '{operation}' failed after {attempts} attempts")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<ResilienceError<E>>,
    },

    /// The wrapped operation failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> ResilienceError<E> {
    /// HTTP status class for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ResilienceError::ServiceUnavailable(_)
            | ResilienceError::CircuitOpen { .. }
            | ResilienceError::BulkheadFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ResilienceError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ResilienceError::UnknownPool(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ResilienceError::RetriesExhausted { last, .. } => last.status_code(),
            ResilienceError::Inner(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Error of the final attempt when retries were exhausted.
    pub fn last_error(&self) -> Option<&ResilienceError<E>> {
        match self {
            ResilienceError::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }

    /// The caller's own error, looking through retry exhaustion.
    pub fn inner(&self) -> Option<&E> {
        match self {
            ResilienceError::Inner(e) => Some(e),
            ResilienceError::RetriesExhausted { last, .. } => last.inner(),
            _ => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Inner(e) => Some(e),
            ResilienceError::RetriesExhausted { last, .. } => last.into_inner(),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            ResilienceError::Timeout { .. } => true,
            ResilienceError::RetriesExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestError = ResilienceError<std::io::Error>;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            TestError::CircuitOpen { name: "payments".into() }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            TestError::ServiceUnavailable("auth".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let timeout = TestError::Timeout {
            operation: "payments".into(),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);

        let exhausted = TestError::RetriesExhausted {
            operation: "payments".into(),
            attempts: 2,
            last: Box::new(timeout),
        };
        assert_eq!(exhausted.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert!(exhausted.is_timeout());
    }

    #[test]
    fn test_inner_is_unchanged() {
        let err = TestError::RetriesExhausted {
            operation: "kg".into(),
            attempts: 3,
            last: Box::new(TestError::Inner(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            ))),
        };
        assert_eq!(err.inner().unwrap().kind(), std::io::ErrorKind::ConnectionRefused);
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.to_string(), "Operation 'kg' failed after 3 attempts");
        assert_eq!(err.into_inner().unwrap().to_string(), "refused");
    }

    #[test]
    fn test_display() {
        let err = TestError::Timeout {
            operation: "docs".into(),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Operation 'docs' timed out after 1500ms");
    }
}
