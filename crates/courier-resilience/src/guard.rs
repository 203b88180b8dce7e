//! Circuit breaker + retry policy pairs for downstream calls
//!
//! Handlers wrap every externally-facing call in a [`CallGuard`]. Each attempt is
//! gated by the breaker; failed attempts are retried under the policy. A call the
//! breaker refuses is returned at once and never retried.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerRegistry};
use crate::retry::{AttemptError, RetryError, RetryPolicy, RetryRegistry};
use courier_error::{ErrorCategory, ErrorKind, ProcessingError, Result};
use std::future::Future;
use std::sync::Arc;

/// Failure of a guarded call
pub type GuardError = RetryError<CircuitBreakerError<ProcessingError>>;

impl AttemptError for CircuitBreakerError<ProcessingError> {
    fn retry_kind(&self) -> Option<ErrorKind> {
        match self {
            CircuitBreakerError::NotPermitted(_) => None,
            CircuitBreakerError::Timeout { .. } => Some(ErrorKind::Timeout),
            CircuitBreakerError::Inner(e) => Some(e.kind().clone()),
        }
    }
}

impl From<CircuitBreakerError<ProcessingError>> for ProcessingError {
    fn from(err: CircuitBreakerError<ProcessingError>) -> Self {
        match err {
            CircuitBreakerError::NotPermitted(rejection) => {
                ProcessingError::new(ErrorKind::ServiceUnavailable, rejection.to_string())
            }
            CircuitBreakerError::Timeout { timeout } => ProcessingError::new(
                ErrorKind::Timeout,
                format!("downstream call timed out after {:?}", timeout),
            ),
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

impl From<GuardError> for ProcessingError {
    fn from(err: GuardError) -> Self {
        err.last_error.into()
    }
}

/// A named breaker paired with a named retry policy
#[derive(Debug, Clone)]
pub struct CallGuard {
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
}

impl CallGuard {
    /// Pair a breaker with a policy
    pub fn new(breaker: Arc<CircuitBreaker>, policy: RetryPolicy) -> Self {
        Self { breaker, policy }
    }

    /// Look both halves up by name
    pub fn from_registries(
        breakers: &CircuitBreakerRegistry,
        breaker: &str,
        policies: &RetryRegistry,
        operation: &str,
    ) -> Result<Self> {
        Ok(Self::new(breakers.get(breaker)?, policies.get(operation)?.clone()))
    }

    /// The breaker
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The retry policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `f` through the breaker, retrying under the policy.
    ///
    /// Validation-category errors are client mistakes and are not recorded against
    /// the breaker.
    pub async fn call<F, Fut, T>(&self, mut f: F) -> std::result::Result<T, GuardError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, ProcessingError>>,
    {
        let breaker = &self.breaker;
        self.policy
            .execute(|attempt| {
                let fut = f(attempt);
                async move {
                    breaker
                        .execute_filtered(
                            || fut,
                            |e: &ProcessingError| e.kind().category() != ErrorCategory::Validation,
                        )
                        .await
                }
            })
            .await
    }
}
