//! # Courier Resilience
//!
//! Resilience patterns for the Courier message-processing reliability layer:
//!
//! - **Error Classifier**: maps a failure to RETRYABLE or FATAL from a configured set
//! - **Backoff Policy**: bounded fixed or exponential retry delays
//! - **Retry Policy Registry**: named, immutable policies for downstream operations
//! - **Circuit Breaker**: sliding-window breaker per downstream dependency
//! - **Call Guard**: breaker + retry policy pair wrapping each external call
//! - **Timeouts**: call timeouts and deadlines
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use courier_resilience::{CallGuard, CircuitBreakerRegistry, RetryRegistry};
//! use courier_error::{ErrorKind, ProcessingError};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breakers = CircuitBreakerRegistry::with_defaults();
//! let policies = RetryRegistry::with_defaults();
//! let guard = CallGuard::from_registries(&breakers, "campaign-api", &policies, "campaign-read")?;
//!
//! let clicks = guard
//!     .call(|_attempt| async {
//!         // Your downstream call here
//!         Ok::<_, ProcessingError>(42)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Circuit Breaker
//!
//! ```rust
//! use courier_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::new("payment-api")
//!     .with_failure_rate_threshold(40.0)
//!     .with_minimum_number_of_calls(10)
//!     .with_wait_duration_in_open_state(Duration::from_secs(60));
//!
//! let cb = CircuitBreaker::new(config);
//! assert_eq!(cb.state(), CircuitState::Closed);
//! # }
//! ```
//!
//! ## Backoff
//!
//! ```rust
//! use courier_resilience::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::exponential(
//!     Duration::from_millis(100),
//!     Duration::from_secs(30),
//!     2.0,
//!     3,
//! );
//! let delays: Vec<_> = policy.delays().collect();
//! assert_eq!(delays, vec![
//!     Duration::from_millis(100),
//!     Duration::from_millis(200),
//!     Duration::from_millis(400),
//! ]);
//! ```
//!
//! ## Classification
//!
//! ```rust
//! use courier_resilience::{Classification, ErrorClassifier, RetryClassifier};
//! use courier_error::{ErrorKind, ProcessingError};
//!
//! let classifier = ErrorClassifier::standard();
//! let fatal = ProcessingError::new(ErrorKind::IllegalArgument, "negative quantity");
//! let transient = ProcessingError::new(ErrorKind::Connect, "connection refused");
//! assert_eq!(classifier.classify(&fatal), Classification::Fatal);
//! assert_eq!(classifier.classify(&transient), Classification::Retryable);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod circuit_breaker;
pub mod classifier;
pub mod guard;
pub mod retry;
pub mod timeout;

// Re-exports for convenience
pub use backoff::{Backoff, BackoffPolicy, BackoffStrategy};
pub use circuit_breaker::{
    CallNotPermitted, CallOutcome, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitBreakerRegistry, CircuitMetrics, CircuitState,
};
pub use classifier::{Classification, ErrorClassifier, HttpRetryClassifier, RetryClassifier};
pub use guard::{CallGuard, GuardError};
pub use retry::{AttemptError, RetryError, RetryPolicy, RetryRegistry};
pub use timeout::{with_timeout, Deadline};
