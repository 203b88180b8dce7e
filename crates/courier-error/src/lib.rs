//! # Courier Error
//!
//! Unified error types for the Courier message-processing reliability layer.
//!
//! Two families of errors live here:
//!
//! - [`ProcessingError`] - a failure raised while handling a message or calling a
//!   downstream dependency. It carries an [`ErrorKind`], the tagged variant that the
//!   classifier matches on. The kind is decided once, where the underlying error is
//!   caught, and never re-derived from strings afterwards.
//! - [`CourierError`] - infrastructure errors of the reliability layer itself
//!   (configuration, publishing, committing, spilling).
//!
//! ## Example
//!
//! ```
//! use courier_error::{ErrorKind, ProcessingError};
//!
//! let err = ProcessingError::new(ErrorKind::IllegalArgument, "quantity must be positive");
//! assert_eq!(err.kind().class_name(), "IllegalArgumentException");
//! assert_eq!(ErrorKind::from_class_name("IllegalArgumentException"), ErrorKind::IllegalArgument);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;
use std::time::Duration;
use thiserror::Error;

// ============ Error Kinds ============

/// Tagged failure variant attached to every [`ProcessingError`].
///
/// The wire name of each kind (see [`ErrorKind::class_name`]) is what ends up in the
/// `dlt-exception-class` dead-letter header, so it is stable across releases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(into = "String", from = "String")
)]
pub enum ErrorKind {
    // ============ Transient ============
    /// Connection could not be established
    Connect,
    /// Socket or request timed out
    Timeout,
    /// Connection reset by peer
    ConnectionReset,
    /// Downstream answered with a 5xx-class status
    ServiceUnavailable,
    /// Downstream throttled the request
    RateLimited,
    /// Transient failure in the data-access layer (deadlock, pool exhaustion)
    TransientDataAccess,

    // ============ Serialization ============
    /// Payload could not be decoded at all
    Deserialization,
    /// Payload is not well-formed JSON
    JsonParse,
    /// Payload is JSON but does not match the expected shape
    JsonMapping,
    /// A numeric field could not be parsed
    NumberFormat,
    /// A value had an unexpected runtime type
    ClassCast,

    // ============ Validation / Business ============
    /// Generic invalid input
    IllegalArgument,
    /// User-supplied data failed validation
    UserValidation,
    /// Order data failed validation
    OrderValidation,
    /// Referenced service does not exist
    ServiceNotFound,
    /// Referenced user does not exist
    UserNotFound,
    /// Account balance too low for the requested operation
    InsufficientBalance,
    /// Referential-integrity violation in storage
    DataIntegrityViolation,
    /// Storage constraint violation
    ConstraintViolation,

    // ============ Generic ============
    /// Unclassified runtime failure
    Runtime,
    /// Application-defined kind, identified by its wire name
    Custom(String),
}

/// Coarse category of an [`ErrorKind`], used for logging and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network, timeout and 5xx failures
    Transient,
    /// Malformed input or broken business invariant
    Validation,
    /// Payload cannot be decoded
    Serialization,
    /// Anything not otherwise categorised
    Unknown,
}

impl ErrorKind {
    /// Stable wire name written to `dlt-exception-class`.
    pub fn class_name(&self) -> &str {
        match self {
            ErrorKind::Connect => "ConnectException",
            ErrorKind::Timeout => "SocketTimeoutException",
            ErrorKind::ConnectionReset => "ConnectionResetException",
            ErrorKind::ServiceUnavailable => "ServiceUnavailableException",
            ErrorKind::RateLimited => "RateLimitExceededException",
            ErrorKind::TransientDataAccess => "TransientDataAccessException",
            ErrorKind::Deserialization => "DeserializationException",
            ErrorKind::JsonParse => "JsonParseException",
            ErrorKind::JsonMapping => "JsonMappingException",
            ErrorKind::NumberFormat => "NumberFormatException",
            ErrorKind::ClassCast => "ClassCastException",
            ErrorKind::IllegalArgument => "IllegalArgumentException",
            ErrorKind::UserValidation => "UserValidationException",
            ErrorKind::OrderValidation => "OrderValidationException",
            ErrorKind::ServiceNotFound => "ServiceNotFoundException",
            ErrorKind::UserNotFound => "UserNotFoundException",
            ErrorKind::InsufficientBalance => "InsufficientBalanceException",
            ErrorKind::DataIntegrityViolation => "DataIntegrityViolationException",
            ErrorKind::ConstraintViolation => "ConstraintViolationException",
            ErrorKind::Runtime => "RuntimeException",
            ErrorKind::Custom(name) => name,
        }
    }

    /// Inverse of [`ErrorKind::class_name`]. Unknown names become [`ErrorKind::Custom`].
    pub fn from_class_name(name: &str) -> Self {
        match name {
            "ConnectException" => ErrorKind::Connect,
            "SocketTimeoutException" => ErrorKind::Timeout,
            "ConnectionResetException" => ErrorKind::ConnectionReset,
            "ServiceUnavailableException" => ErrorKind::ServiceUnavailable,
            "RateLimitExceededException" => ErrorKind::RateLimited,
            "TransientDataAccessException" => ErrorKind::TransientDataAccess,
            "DeserializationException" => ErrorKind::Deserialization,
            "JsonParseException" => ErrorKind::JsonParse,
            "JsonMappingException" => ErrorKind::JsonMapping,
            "NumberFormatException" => ErrorKind::NumberFormat,
            "ClassCastException" => ErrorKind::ClassCast,
            "IllegalArgumentException" => ErrorKind::IllegalArgument,
            "UserValidationException" => ErrorKind::UserValidation,
            "OrderValidationException" => ErrorKind::OrderValidation,
            "ServiceNotFoundException" => ErrorKind::ServiceNotFound,
            "UserNotFoundException" => ErrorKind::UserNotFound,
            "InsufficientBalanceException" => ErrorKind::InsufficientBalance,
            "DataIntegrityViolationException" => ErrorKind::DataIntegrityViolation,
            "ConstraintViolationException" => ErrorKind::ConstraintViolation,
            "RuntimeException" => ErrorKind::Runtime,
            other => ErrorKind::Custom(other.to_string()),
        }
    }

    /// Coarse category of this kind.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::Connect
            | ErrorKind::Timeout
            | ErrorKind::ConnectionReset
            | ErrorKind::ServiceUnavailable
            | ErrorKind::RateLimited
            | ErrorKind::TransientDataAccess => ErrorCategory::Transient,
            ErrorKind::Deserialization
            | ErrorKind::JsonParse
            | ErrorKind::JsonMapping
            | ErrorKind::NumberFormat
            | ErrorKind::ClassCast => ErrorCategory::Serialization,
            ErrorKind::IllegalArgument
            | ErrorKind::UserValidation
            | ErrorKind::OrderValidation
            | ErrorKind::ServiceNotFound
            | ErrorKind::UserNotFound
            | ErrorKind::InsufficientBalance
            | ErrorKind::DataIntegrityViolation
            | ErrorKind::ConstraintViolation => ErrorCategory::Validation,
            ErrorKind::Runtime | ErrorKind::Custom(_) => ErrorCategory::Unknown,
        }
    }

    /// Map a downstream HTTP status to a kind at the call boundary.
    ///
    /// Returns `None` for non-error statuses.
    pub fn for_http_status(status: u16) -> Option<Self> {
        let kind = match status {
            408 | 504 => ErrorKind::Timeout,
            425 | 429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::ServiceUnavailable,
            400 | 422 => ErrorKind::IllegalArgument,
            404 => ErrorKind::ServiceNotFound,
            409 => ErrorKind::DataIntegrityViolation,
            400..=499 => ErrorKind::Runtime,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

impl From<String> for ErrorKind {
    fn from(name: String) -> Self {
        ErrorKind::from_class_name(&name)
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        kind.class_name().to_string()
    }
}

// ============ Processing Errors ============

/// A failure raised by a message handler or a guarded downstream call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProcessingError {
    kind: ErrorKind,
    message: String,
    stack_trace: Option<String>,
}

impl ProcessingError {
    /// Create a new processing error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack_trace: None,
        }
    }

    /// Attach a captured stack trace / cause chain
    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    /// Build from a foreign error, recording its source chain as the stack trace.
    pub fn from_error(kind: ErrorKind, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut trace = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push_str("\ncaused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            kind,
            message: err.to_string(),
            stack_trace: Some(trace),
        }
    }

    /// Build from a downstream HTTP status, if the status is an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Option<Self> {
        ErrorKind::for_http_status(status).map(|kind| Self::new(kind, message))
    }

    /// The failure kind
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Human-readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Captured stack trace, if any
    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }
}

// ============ Infrastructure Errors ============

/// Errors raised by the reliability layer itself.
#[derive(Error, Debug)]
pub enum CourierError {
    // ============ Configuration Errors ============
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation name not present in the retry registry
    #[error("Unknown retry policy: {0}")]
    UnknownPolicy(String),

    /// Breaker name not present in the breaker registry
    #[error("Unknown circuit breaker: {0}")]
    UnknownBreaker(String),

    // ============ Broker Errors ============
    /// Publishing a record failed
    #[error("Failed to publish to '{topic}': {reason}")]
    Publish {
        /// Destination topic
        topic: String,
        /// Error reason
        reason: String,
    },

    /// Synchronous offset commit failed
    #[error("Offset commit failed: {0}")]
    Commit(String),

    /// Polling the source failed
    #[error("Poll failed: {0}")]
    Poll(String),

    // ============ Resilience Errors ============
    /// Call rejected by an open circuit
    #[error("Circuit '{name}' is open, retry after {retry_after:?}")]
    CircuitOpen {
        /// Breaker name
        name: String,
        /// Remaining open-state wait
        retry_after: Duration,
    },

    /// Operation exceeded its time budget
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        /// Operation name
        operation: String,
        /// Budget that was exceeded
        timeout: Duration,
    },

    // ============ Storage Errors ============
    /// Payload (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// File IO error
    #[error("IO error: {0}")]
    Io(String),

    // ============ Lifecycle ============
    /// Runtime is shutting down
    #[error("Shutting down")]
    Shutdown,

    // ============ Generic ============
    /// Unknown/other error
    #[error("{0}")]
    Other(String),

    /// Wrapped error from external source
    #[error("External error: {message}")]
    External {
        /// Error message
        message: String,
    },
}

/// Convenient Result type using CourierError
pub type Result<T> = std::result::Result<T, CourierError>;

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Adds context to an error
    fn context(self, ctx: impl Into<String>) -> Result<T>;

    /// Adds context using a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| CourierError::External {
            message: format!("{}: {}", ctx.into(), e),
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| CourierError::External {
            message: format!("{}: {}", f(), e),
        })
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| CourierError::Other(ctx.into()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| CourierError::Other(f()))
    }
}

// ============ From implementations for common error types ============

impl From<std::io::Error> for CourierError {
    fn from(err: std::io::Error) -> Self {
        CourierError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        CourierError::Serialization(err.to_string())
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Configuration error
    Config = 1001,
    /// Unknown retry policy
    UnknownPolicy = 1002,
    /// Unknown circuit breaker
    UnknownBreaker = 1003,
    /// Publish failure
    Publish = 2001,
    /// Commit failure
    Commit = 2002,
    /// Poll failure
    Poll = 2003,
    /// Circuit open
    CircuitOpen = 3001,
    /// Timeout
    Timeout = 3002,
    /// Serialization failure
    Serialization = 4001,
    /// IO failure
    Io = 4002,
    /// Shutdown in progress
    Shutdown = 9001,
}

impl CourierError {
    /// Returns the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            CourierError::Config(_) => ErrorCode::Config,
            CourierError::UnknownPolicy(_) => ErrorCode::UnknownPolicy,
            CourierError::UnknownBreaker(_) => ErrorCode::UnknownBreaker,
            CourierError::Publish { .. } => ErrorCode::Publish,
            CourierError::Commit(_) => ErrorCode::Commit,
            CourierError::Poll(_) => ErrorCode::Poll,
            CourierError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            CourierError::Timeout { .. } => ErrorCode::Timeout,
            CourierError::Serialization(_) => ErrorCode::Serialization,
            CourierError::Io(_) => ErrorCode::Io,
            CourierError::Shutdown => ErrorCode::Shutdown,
            _ => ErrorCode::Unknown,
        }
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CourierError::Publish { .. }
                | CourierError::Commit(_)
                | CourierError::Poll(_)
                | CourierError::CircuitOpen { .. }
                | CourierError::Timeout { .. }
                | CourierError::Io(_)
        )
    }

    /// Returns suggested retry delay if applicable
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CourierError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Helper to create a publish error
    pub fn publish(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        CourierError::Publish {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}
