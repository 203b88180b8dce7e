//! Error classification
//!
//! Decides whether a failed delivery is worth retrying. The classifier is pure and
//! configured per pipeline: a set of FATAL kinds is registered, anything else is
//! RETRYABLE.

use courier_error::{ErrorKind, ProcessingError};
use std::collections::HashSet;
use std::time::Duration;

/// Outcome of classifying a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// May succeed if attempted again
    Retryable,
    /// Will never succeed on retry
    Fatal,
}

impl Classification {
    /// True for [`Classification::Fatal`]
    pub fn is_fatal(self) -> bool {
        self == Classification::Fatal
    }
}

/// Trait for classifying errors as retryable or fatal
pub trait RetryClassifier: Send + Sync {
    /// Classify a failure
    fn classify(&self, error: &ProcessingError) -> Classification;

    /// Get suggested delay override for this error (if any)
    fn suggested_delay(&self, _error: &ProcessingError) -> Option<Duration> {
        None
    }
}

/// Set-based classifier: kinds in the FATAL set are fatal, everything else retryable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorClassifier {
    fatal: HashSet<ErrorKind>,
}

impl ErrorClassifier {
    /// Classifier with an empty FATAL set (everything retryable)
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more FATAL kind
    pub fn with_fatal(mut self, kind: ErrorKind) -> Self {
        self.fatal.insert(kind);
        self
    }

    /// Register several FATAL kinds
    pub fn with_fatal_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.fatal.extend(kinds);
        self
    }

    /// Malformed payloads, validation failures, missing references, business-rule
    /// violations and constraint violations.
    pub fn standard() -> Self {
        Self::new().with_fatal_kinds([
            ErrorKind::Deserialization,
            ErrorKind::JsonParse,
            ErrorKind::JsonMapping,
            ErrorKind::IllegalArgument,
            ErrorKind::NumberFormat,
            ErrorKind::ClassCast,
            ErrorKind::UserValidation,
            ErrorKind::OrderValidation,
            ErrorKind::ServiceNotFound,
            ErrorKind::UserNotFound,
            ErrorKind::InsufficientBalance,
            ErrorKind::DataIntegrityViolation,
            ErrorKind::ConstraintViolation,
        ])
    }

    /// Order pipeline: business-rule violations plus undecodable payloads.
    pub fn order_processing() -> Self {
        Self::new().with_fatal_kinds([
            ErrorKind::Deserialization,
            ErrorKind::JsonParse,
            ErrorKind::JsonMapping,
            ErrorKind::IllegalArgument,
            ErrorKind::InsufficientBalance,
            ErrorKind::UserValidation,
            ErrorKind::ServiceNotFound,
        ])
    }

    /// Dead-letter reprocessing: only transient errors are retried.
    pub fn dead_letter_processing() -> Self {
        Self::new().with_fatal_kinds([
            ErrorKind::IllegalArgument,
            ErrorKind::NumberFormat,
            ErrorKind::ClassCast,
            ErrorKind::Deserialization,
            ErrorKind::DataIntegrityViolation,
        ])
    }

    /// Whether `kind` is in the FATAL set
    pub fn is_fatal(&self, kind: &ErrorKind) -> bool {
        self.fatal.contains(kind)
    }

    /// Registered FATAL kinds
    pub fn fatal_kinds(&self) -> impl Iterator<Item = &ErrorKind> {
        self.fatal.iter()
    }
}

impl RetryClassifier for ErrorClassifier {
    fn classify(&self, error: &ProcessingError) -> Classification {
        if self.is_fatal(error.kind()) {
            Classification::Fatal
        } else {
            Classification::Retryable
        }
    }

    fn suggested_delay(&self, error: &ProcessingError) -> Option<Duration> {
        // Throttled dependencies need longer than the backoff's first step
        match error.kind() {
            ErrorKind::RateLimited => Some(Duration::from_secs(5)),
            _ => None,
        }
    }
}

/// HTTP status helpers for downstream calls
#[derive(Debug, Clone, Default)]
pub struct HttpRetryClassifier;

impl HttpRetryClassifier {
    /// Check if HTTP status code is retryable
    pub fn is_status_retryable(status: u16) -> bool {
        matches!(
            status,
            408 | // Request Timeout
            425 | // Too Early
            429 | // Too Many Requests
            500 | // Internal Server Error
            502 | // Bad Gateway
            503 | // Service Unavailable
            504   // Gateway Timeout
        )
    }

    /// Get retry delay from a Retry-After header value (seconds form)
    pub fn parse_retry_after(value: &str) -> Option<Duration> {
        value.trim().parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: ErrorKind) -> ProcessingError {
        ProcessingError::new(kind, "boom")
    }

    #[test]
    fn test_unmatched_kinds_are_retryable() {
        let classifier = ErrorClassifier::new();
        assert_eq!(classifier.classify(&err(ErrorKind::IllegalArgument)), Classification::Retryable);
        assert_eq!(classifier.classify(&err(ErrorKind::Custom("Weird".into()))), Classification::Retryable);
    }

    #[test]
    fn test_standard_fatal_set() {
        let classifier = ErrorClassifier::standard();
        for kind in [
            ErrorKind::Deserialization,
            ErrorKind::JsonParse,
            ErrorKind::IllegalArgument,
            ErrorKind::ServiceNotFound,
            ErrorKind::InsufficientBalance,
            ErrorKind::ConstraintViolation,
        ] {
            assert!(classifier.classify(&err(kind)).is_fatal());
        }
        for kind in [
            ErrorKind::Connect,
            ErrorKind::Timeout,
            ErrorKind::ServiceUnavailable,
            ErrorKind::TransientDataAccess,
        ] {
            assert_eq!(classifier.classify(&err(kind)), Classification::Retryable);
        }
    }

    #[test]
    fn test_order_processing_set() {
        let classifier = ErrorClassifier::order_processing();
        assert!(classifier.is_fatal(&ErrorKind::InsufficientBalance));
        assert!(classifier.is_fatal(&ErrorKind::UserValidation));
        assert!(!classifier.is_fatal(&ErrorKind::Connect));
    }

    #[test]
    fn test_custom_kind_registration() {
        let quota = ErrorKind::Custom("QuotaExceededException".into());
        let classifier = ErrorClassifier::new().with_fatal(quota.clone());
        assert!(classifier.classify(&err(quota)).is_fatal());
    }

    #[test]
    fn test_rate_limited_suggested_delay() {
        let classifier = ErrorClassifier::standard();
        assert_eq!(
            classifier.suggested_delay(&err(ErrorKind::RateLimited)),
            Some(Duration::from_secs(5))
        );
        assert_eq!(classifier.suggested_delay(&err(ErrorKind::Connect)), None);
    }

    #[test]
    fn test_retryable_statuses_map_to_retryable_kinds() {
        let classifier = ErrorClassifier::standard();
        for status in [408u16, 425, 429, 500, 502, 503, 504] {
            assert!(HttpRetryClassifier::is_status_retryable(status));
            let e = ProcessingError::from_status(status, "downstream").unwrap();
            assert_eq!(classifier.classify(&e), Classification::Retryable);
        }
        let bad_request = ProcessingError::from_status(400, "bad").unwrap();
        assert!(classifier.classify(&bad_request).is_fatal());
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(HttpRetryClassifier::parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(HttpRetryClassifier::parse_retry_after("soon"), None);
    }
}
