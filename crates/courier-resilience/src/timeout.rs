//! Timeouts and deadlines
//!
//! Guarded calls carry an explicit timeout; multi-step work (a retry loop, a
//! shutdown drain) is bounded by a [`Deadline`].

use courier_error::{CourierError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{timeout, Instant};

/// Run `future`, failing with [`CourierError::Timeout`] after `duration`
pub async fn with_timeout<T>(
    duration: Duration,
    operation: impl Into<String>,
    future: impl Future<Output = T>,
) -> Result<T> {
    let op = operation.into();
    timeout(duration, future)
        .await
        .map_err(|_| CourierError::Timeout {
            operation: op,
            timeout: duration,
        })
}

/// Time budget shared by the steps of one operation
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Budget of `timeout` starting now
    pub fn new(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    /// Budget used up
    pub fn is_expired(&self) -> bool {
        self.start.elapsed() >= self.timeout
    }

    /// Budget left
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start.elapsed())
    }

    /// Time since creation
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Whether `operation_estimate` still fits in the budget
    pub fn has_time_for(&self, operation_estimate: Duration) -> bool {
        self.remaining() >= operation_estimate
    }

    /// Run `future` with the remaining time as its timeout
    pub async fn execute<T>(&self, operation: impl Into<String>, future: impl Future<Output = T>) -> Result<T> {
        let operation = operation.into();
        if self.is_expired() {
            return Err(CourierError::Timeout {
                operation,
                timeout: self.timeout,
            });
        }
        timeout(self.remaining(), future)
            .await
            .map_err(|_| CourierError::Timeout {
                operation,
                timeout: self.timeout,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;
        match result {
            Err(CourierError::Timeout { operation, timeout }) => {
                assert_eq!(operation, "slow");
                assert_eq!(timeout, Duration::from_millis(10));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_passes_value() {
        let value = with_timeout(Duration::from_secs(1), "fast", async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_tracking() {
        let deadline = Deadline::new(Duration::from_secs(5));
        assert!(deadline.has_time_for(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(deadline.remaining(), Duration::from_secs(2));
        assert!(!deadline.has_time_for(Duration::from_secs(3)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_execute_uses_remaining() {
        let deadline = Deadline::new(Duration::from_secs(2));
        tokio::time::advance(Duration::from_secs(1)).await;
        let result = deadline
            .execute("drain", tokio::time::sleep(Duration::from_millis(1500)))
            .await;
        assert!(matches!(result, Err(CourierError::Timeout { .. })));

        let expired = Deadline::new(Duration::ZERO);
        assert!(expired.execute("noop", async {}).await.is_err());
    }
}
