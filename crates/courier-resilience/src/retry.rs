//! Named retry policies for downstream operations
//!
//! A [`RetryPolicy`] binds an operation name to a backoff plus an attempt ceiling.
//! Idempotent operations retry with exponential backoff; non-idempotent ones run
//! exactly once. The [`RetryRegistry`] is built at startup and never mutated.

use crate::backoff::{BackoffPolicy, BackoffStrategy};
use crate::classifier::ErrorClassifier;
use crate::timeout::Deadline;
use courier_error::{CourierError, ErrorKind, ProcessingError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry policy for one named operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    name: String,
    max_attempts: u32,
    backoff: BackoffPolicy,
    classifier: ErrorClassifier,
    idempotent: bool,
}

impl RetryPolicy {
    /// Exponential retries for an idempotent operation.
    ///
    /// `max_attempts` counts every call, including the first.
    pub fn idempotent(
        name: impl Into<String>,
        max_attempts: u32,
        initial_interval: Duration,
        max_interval: Duration,
        multiplier: f64,
    ) -> Self {
        let retries = max_attempts.saturating_sub(1);
        Self {
            name: name.into(),
            max_attempts,
            backoff: BackoffPolicy::exponential(initial_interval, max_interval, multiplier, retries),
            classifier: ErrorClassifier::standard(),
            idempotent: true,
        }
    }

    /// Single attempt, never retried
    pub fn non_idempotent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_attempts: 1,
            backoff: BackoffPolicy::fixed(Duration::ZERO, 0),
            classifier: ErrorClassifier::standard(),
            idempotent: false,
        }
    }

    /// Three attempts, 500ms apart
    pub fn default_for(name: impl Into<String>) -> Self {
        let mut policy = Self::idempotent(
            name,
            3,
            Duration::from_millis(500),
            Duration::from_millis(500),
            1.0,
        );
        policy.backoff = BackoffPolicy::fixed(Duration::from_millis(500), 2);
        policy
    }

    /// Set the cumulative delay ceiling
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.backoff.max_elapsed = Some(max_elapsed);
        self
    }

    /// Register a kind that must never be retried
    pub fn with_non_retryable(mut self, kind: ErrorKind) -> Self {
        self.classifier = self.classifier.with_fatal(kind);
        self
    }

    /// Replace the classifier
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replace the backoff. The retry budget stays `max_attempts - 1`.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff.with_max_retries(self.max_attempts.saturating_sub(1));
        self
    }

    /// Operation name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total calls allowed, first call included
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the first retry
    pub fn initial_interval(&self) -> Duration {
        self.backoff.initial_interval
    }

    /// Delay cap
    pub fn max_interval(&self) -> Duration {
        self.backoff.max_interval
    }

    /// Growth factor between retries
    pub fn multiplier(&self) -> f64 {
        match self.backoff.strategy {
            BackoffStrategy::Fixed => 1.0,
            BackoffStrategy::Exponential => self.backoff.multiplier,
        }
    }

    /// Ceiling on the total time spent retrying
    pub fn max_elapsed(&self) -> Option<Duration> {
        self.backoff.max_elapsed
    }

    /// Kinds that are never retried
    pub fn non_retryable_kinds(&self) -> impl Iterator<Item = &ErrorKind> {
        self.classifier.fatal_kinds()
    }

    /// Whether repeating the operation is safe
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// Underlying backoff
    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Check the policy's invariants
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(CourierError::Config(format!(
                "retry policy '{}': max attempts must be >= 1",
                self.name
            )));
        }
        if !self.idempotent && self.max_attempts != 1 {
            return Err(CourierError::Config(format!(
                "retry policy '{}': non-idempotent operations must use a single attempt, got {}",
                self.name, self.max_attempts
            )));
        }
        self.backoff.validate()
    }

    /// Run `f` under this policy.
    ///
    /// Stops on success, on a non-retryable error, after `max_attempts` calls, or when
    /// the next delay would exceed the elapsed ceiling. `f` receives the 1-based
    /// attempt number.
    pub async fn execute<F, Fut, T, E>(&self, mut f: F) -> std::result::Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: AttemptError,
    {
        let deadline = self.backoff.max_elapsed.map(Deadline::new);
        let mut delays = self.backoff.delays();
        let mut attempt = 1u32;

        loop {
            let error = match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let give_up = |last_error| Err(RetryError { attempts: attempt, last_error });
            let Some(kind) = error.retry_kind() else {
                return give_up(error);
            };
            if self.classifier.is_fatal(&kind) {
                tracing::debug!(operation = %self.name, attempt, kind = %kind, "Non-retryable failure");
                return give_up(error);
            }
            if attempt >= self.max_attempts {
                return give_up(error);
            }
            let Some(delay) = delays.next() else {
                return give_up(error);
            };
            if let Some(deadline) = &deadline {
                if !deadline.has_time_for(delay) {
                    return give_up(error);
                }
            }

            tracing::debug!(
                operation = %self.name,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Operation failed, will retry"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Errors a [`RetryPolicy`] can reason about
pub trait AttemptError: std::fmt::Display {
    /// Kind used for classification. `None` stops retrying immediately.
    fn retry_kind(&self) -> Option<ErrorKind>;
}

impl AttemptError for ProcessingError {
    fn retry_kind(&self) -> Option<ErrorKind> {
        Some(self.kind().clone())
    }
}

/// Error when a policy gives up
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Gave up after {attempts} attempt(s); last error: {last_error}")]
pub struct RetryError<E> {
    /// Number of calls made
    pub attempts: u32,
    /// Last error encountered
    #[source]
    pub last_error: E,
}

/// Immutable mapping from operation name to retry policy
#[derive(Debug, Clone, Default)]
pub struct RetryRegistry {
    policies: Arc<HashMap<String, RetryPolicy>>,
}

impl RetryRegistry {
    /// Build from policies, validating each. Duplicate names are rejected.
    pub fn new(policies: impl IntoIterator<Item = RetryPolicy>) -> Result<Self> {
        let mut map = HashMap::new();
        for policy in policies {
            policy.validate()?;
            let name = policy.name().to_string();
            if map.insert(name.clone(), policy).is_some() {
                return Err(CourierError::Config(format!("duplicate retry policy '{}'", name)));
            }
        }
        Ok(Self {
            policies: Arc::new(map),
        })
    }

    /// Read operations retry, write operations run once
    pub fn with_defaults() -> Self {
        let read = |name: &str| {
            RetryPolicy::idempotent(
                name,
                5,
                Duration::from_millis(1000),
                Duration::from_secs(10),
                2.0,
            )
        };
        let policies = [
            read("exchange-rate"),
            read("campaign-read"),
            read("payment-read"),
            RetryPolicy::non_idempotent("campaign-write"),
            RetryPolicy::non_idempotent("payment-write"),
        ];
        let map = policies
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        Self {
            policies: Arc::new(map),
        }
    }

    /// Policy by operation name
    pub fn get(&self, name: &str) -> Result<&RetryPolicy> {
        self.policies
            .get(name)
            .ok_or_else(|| CourierError::UnknownPolicy(name.to_string()))
    }

    /// Registered operation names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of policies
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// True if empty
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn transient() -> ProcessingError {
        ProcessingError::new(ErrorKind::Connect, "connection refused")
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let policy = RetryPolicy::idempotent("read", 5, Duration::from_millis(100), Duration::from_secs(5), 2.0);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let start = Instant::now();

        let result = policy
            .execute(move |_| async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok::<_, ProcessingError>("rate")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "rate");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::idempotent("read", 3, Duration::from_millis(10), Duration::from_secs(1), 2.0);
        let result: std::result::Result<(), RetryError<ProcessingError>> =
            policy.execute(|_| async { Err(transient()) }).await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error.kind(), &ErrorKind::Connect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_idempotent_runs_once() {
        let policy = RetryPolicy::non_idempotent("payment-write");
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: std::result::Result<(), RetryError<ProcessingError>> = policy
            .execute(move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_not_retried() {
        let policy = RetryRegistry::with_defaults().get("exchange-rate").unwrap().clone();
        let result: std::result::Result<(), RetryError<ProcessingError>> = policy
            .execute(|_| async { Err(ProcessingError::new(ErrorKind::IllegalArgument, "bad pair")) })
            .await;
        assert_eq!(result.unwrap_err().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_elapsed() {
        let policy = RetryPolicy::idempotent("read", 10, Duration::from_secs(1), Duration::from_secs(8), 2.0)
            .with_max_elapsed(Duration::from_secs(5));
        let start = Instant::now();
        let result: std::result::Result<(), RetryError<ProcessingError>> =
            policy.execute(|_| async { Err(transient()) }).await;

        // 1s + 2s = 3s; a 4s delay would overshoot
        assert_eq!(result.unwrap_err().attempts, 3);
        assert!(start.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_number_passed() {
        let policy = RetryPolicy::idempotent("read", 3, Duration::from_millis(1), Duration::from_millis(1), 1.0);
        let seen = std::sync::Mutex::new(Vec::new());
        let _: std::result::Result<(), RetryError<ProcessingError>> = policy
            .execute(|attempt| {
                seen.lock().unwrap().push(attempt);
                async { Err(transient()) }
            })
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_validate_non_idempotent_single_attempt() {
        assert!(RetryPolicy::non_idempotent("w").validate().is_ok());
        let mut bad = RetryPolicy::non_idempotent("w");
        bad.max_attempts = 3;
        assert!(bad.validate().is_err());
        let mut zero = RetryPolicy::idempotent("r", 3, Duration::from_millis(1), Duration::from_millis(2), 2.0);
        zero.max_attempts = 0;
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_registry_defaults() {
        let registry = RetryRegistry::with_defaults();
        assert_eq!(registry.len(), 5);
        let read = registry.get("campaign-read").unwrap();
        assert!(read.is_idempotent());
        assert_eq!(read.max_attempts(), 5);
        let write = registry.get("payment-write").unwrap();
        assert!(!write.is_idempotent());
        assert_eq!(write.max_attempts(), 1);
        assert!(matches!(registry.get("missing"), Err(CourierError::UnknownPolicy(_))));
    }

    #[test]
    fn test_registry_rejects_duplicates_and_invalid() {
        let dup = RetryRegistry::new([
            RetryPolicy::non_idempotent("w"),
            RetryPolicy::non_idempotent("w"),
        ]);
        assert!(dup.is_err());

        let inverted = RetryPolicy::idempotent("r", 3, Duration::from_secs(5), Duration::from_secs(1), 2.0);
        assert!(RetryRegistry::new([inverted]).is_err());
    }

    #[test]
    fn test_default_policy_shape() {
        let policy = RetryPolicy::default_for("anything");
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.initial_interval(), Duration::from_millis(500));
        assert_eq!(policy.multiplier(), 1.0);
        assert!(policy.validate().is_ok());
    }
}
