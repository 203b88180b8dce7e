//! Circuit breaker pattern implementation
//!
//! Count-based sliding window breaker. Each protected downstream dependency gets
//! its own instance, shared by every caller of that dependency.
//!
//! - **CLOSED**: calls pass, outcomes fill a window of `sliding_window_size`. Once
//!   `minimum_number_of_calls` outcomes exist, the failure and slow-call rates are
//!   compared against their thresholds; reaching either opens the circuit.
//! - **OPEN**: calls are rejected without running. The first call after
//!   `wait_duration_in_open_state` moves the circuit to HALF_OPEN.
//! - **HALF_OPEN**: exactly `permitted_calls_in_half_open` trial calls run. Their
//!   aggregate rates decide between CLOSED (fresh window) and OPEN (timer restarts).

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use courier_error::{CourierError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally
    Closed = 0,
    /// Circuit is open - requests are rejected
    Open = 1,
    /// Circuit is half-open - trial calls decide recovery
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Recorded result of one protected call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Completed in time without error
    Success,
    /// Returned an error
    Failure,
    /// Exceeded the slow-call threshold or the call timeout
    Slow,
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Name for logging/metrics
    pub name: String,
    /// Failure percentage (0-100] that opens the circuit
    pub failure_rate_threshold: f64,
    /// Slow-call percentage (0-100] that opens the circuit
    pub slow_call_rate_threshold: f64,
    /// Calls slower than this count as slow
    pub slow_call_duration_threshold: Duration,
    /// How long the circuit stays open before allowing trial calls
    pub wait_duration_in_open_state: Duration,
    /// Outcomes required before rates are evaluated
    pub minimum_number_of_calls: u32,
    /// Number of most recent outcomes kept
    pub sliding_window_size: u32,
    /// Trial calls allowed while half-open
    pub permitted_calls_in_half_open: u32,
    /// Hard timeout applied by [`CircuitBreaker::execute`]
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            wait_duration_in_open_state: Duration::from_secs(30),
            minimum_number_of_calls: 5,
            sliding_window_size: 10,
            permitted_calls_in_half_open: 3,
            call_timeout: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Payment gateway: trips early, recovers quickly
    pub fn payment_api() -> Self {
        Self::new("payment-api")
            .with_failure_rate_threshold(40.0)
            .with_slow_call_rate_threshold(50.0)
            .with_slow_call_duration_threshold(Duration::from_secs(8))
            .with_wait_duration_in_open_state(Duration::from_secs(60))
            .with_minimum_number_of_calls(8)
            .with_sliding_window_size(25)
            .with_permitted_calls_in_half_open(3)
    }

    /// Campaign-management API
    pub fn campaign_api() -> Self {
        Self::new("campaign-api")
            .with_failure_rate_threshold(50.0)
            .with_slow_call_rate_threshold(50.0)
            .with_slow_call_duration_threshold(Duration::from_secs(5))
            .with_wait_duration_in_open_state(Duration::from_secs(30))
            .with_minimum_number_of_calls(10)
            .with_sliding_window_size(20)
            .with_permitted_calls_in_half_open(5)
    }

    /// Bulk read-only video-data integration: tolerant, long cooldown
    pub fn video_api() -> Self {
        Self::new("video-api")
            .with_failure_rate_threshold(60.0)
            .with_slow_call_rate_threshold(60.0)
            .with_slow_call_duration_threshold(Duration::from_secs(10))
            .with_wait_duration_in_open_state(Duration::from_secs(120))
            .with_minimum_number_of_calls(15)
            .with_sliding_window_size(30)
            .with_permitted_calls_in_half_open(3)
    }

    /// Primary database
    pub fn database() -> Self {
        Self::new("database")
            .with_failure_rate_threshold(80.0)
            .with_slow_call_rate_threshold(70.0)
            .with_slow_call_duration_threshold(Duration::from_secs(3))
            .with_wait_duration_in_open_state(Duration::from_secs(10))
            .with_minimum_number_of_calls(20)
            .with_sliding_window_size(50)
            .with_permitted_calls_in_half_open(10)
    }

    /// Set failure rate threshold (percent)
    pub fn with_failure_rate_threshold(mut self, percent: f64) -> Self {
        self.failure_rate_threshold = percent;
        self
    }

    /// Set slow-call rate threshold (percent)
    pub fn with_slow_call_rate_threshold(mut self, percent: f64) -> Self {
        self.slow_call_rate_threshold = percent;
        self
    }

    /// Set slow-call duration threshold
    pub fn with_slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.slow_call_duration_threshold = threshold;
        self
    }

    /// Set open-state wait duration
    pub fn with_wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.wait_duration_in_open_state = wait;
        self
    }

    /// Set minimum number of calls
    pub fn with_minimum_number_of_calls(mut self, calls: u32) -> Self {
        self.minimum_number_of_calls = calls;
        self
    }

    /// Set sliding window size
    pub fn with_sliding_window_size(mut self, size: u32) -> Self {
        self.sliding_window_size = size;
        self
    }

    /// Set permitted trial calls in half-open state
    pub fn with_permitted_calls_in_half_open(mut self, calls: u32) -> Self {
        self.permitted_calls_in_half_open = calls;
        self
    }

    /// Set the hard call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Check the configuration's invariants
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(CourierError::Config(format!("breaker '{}': {}", self.name, reason)));
        for (label, value) in [
            ("failure rate threshold", self.failure_rate_threshold),
            ("slow call rate threshold", self.slow_call_rate_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return invalid(format!("{} must be in (0, 100], got {}", label, value));
            }
        }
        if self.sliding_window_size == 0 {
            return invalid("sliding window size must be >= 1".to_string());
        }
        if self.minimum_number_of_calls == 0 {
            return invalid("minimum number of calls must be >= 1".to_string());
        }
        if self.permitted_calls_in_half_open == 0 {
            return invalid("permitted calls in half-open state must be >= 1".to_string());
        }
        Ok(())
    }

    fn effective_minimum_calls(&self) -> usize {
        self.minimum_number_of_calls.min(self.sliding_window_size) as usize
    }
}

/// Ring buffer of the most recent outcomes with running totals
#[derive(Debug)]
struct SlidingWindow {
    outcomes: VecDeque<CallOutcome>,
    capacity: usize,
    failures: usize,
    slow: usize,
}

impl SlidingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
            failures: 0,
            slow: 0,
        }
    }

    fn record(&mut self, outcome: CallOutcome) {
        if self.outcomes.len() == self.capacity {
            if let Some(evicted) = self.outcomes.pop_front() {
                self.adjust(evicted, false);
            }
        }
        self.outcomes.push_back(outcome);
        self.adjust(outcome, true);
    }

    fn adjust(&mut self, outcome: CallOutcome, add: bool) {
        let counter = match outcome {
            CallOutcome::Failure => &mut self.failures,
            CallOutcome::Slow => &mut self.slow,
            CallOutcome::Success => return,
        };
        if add {
            *counter += 1;
        } else {
            *counter -= 1;
        }
    }

    fn len(&self) -> usize {
        self.outcomes.len()
    }

    fn failure_rate(&self) -> f64 {
        percentage(self.failures, self.len())
    }

    fn slow_call_rate(&self) -> f64 {
        percentage(self.slow, self.len())
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
        self.slow = 0;
    }
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

#[derive(Debug)]
struct BreakerInner {
    window: SlidingWindow,
    trial: SlidingWindow,
    opened_at: Option<Instant>,
}

/// Half-open trial permits issued so far, tagged with the half-open period
/// they belong to: the period in the high 32 bits, the count in the low 32.
#[derive(Debug, Default)]
struct TrialPermits(AtomicU64);

impl TrialPermits {
    fn period(raw: u64) -> u32 {
        (raw >> 32) as u32
    }

    fn issued(raw: u64) -> u32 {
        raw as u32
    }

    /// Start a new period with no permits out; permits of earlier periods go stale
    fn restart(&self) {
        let period = Self::period(self.0.load(Ordering::SeqCst)).wrapping_add(1);
        self.0.store(u64::from(period) << 32, Ordering::SeqCst);
    }

    /// Take a permit if fewer than `limit` are out, returning its period
    fn try_take(&self, limit: u32) -> Option<u32> {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                (Self::issued(raw) < limit).then_some(raw + 1)
            })
            .ok()
            .map(Self::period)
    }

    /// Hand back a permit taken in `period`; no-op once the period is over
    fn give_back(&self, period: u32) {
        let _ = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
            (Self::period(raw) == period && Self::issued(raw) > 0).then_some(raw - 1)
        });
    }
}

/// A permitted call that has not reported its outcome yet.
///
/// Dropping it unsettled, e.g. when the caller's future is cancelled, returns
/// the half-open trial permit it holds.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial_period: Option<u32>,
}

impl Permit<'_> {
    /// The call reported an outcome; the permit is consumed
    fn settle(mut self) {
        self.trial_period = None;
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(period) = self.trial_period.take() {
            self.breaker.trial_permits.give_back(period);
            tracing::debug!(circuit = %self.breaker.config.name, "Half-open trial permit returned unused");
        }
    }
}

/// Rejection returned when the circuit does not permit a call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Call not permitted: circuit '{name}' is {state:?}, retry after {retry_after:?}")]
pub struct CallNotPermitted {
    /// Name of the circuit breaker
    pub name: String,
    /// State that rejected the call
    pub state: CircuitState,
    /// Time until trial calls may be permitted
    pub retry_after: Duration,
}

impl From<CallNotPermitted> for CourierError {
    fn from(err: CallNotPermitted) -> Self {
        CourierError::CircuitOpen {
            name: err.name,
            retry_after: err.retry_after,
        }
    }
}

/// Error type for circuit breaker operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit rejected the call; the operation did not run
    #[error(transparent)]
    NotPermitted(CallNotPermitted),

    /// Operation exceeded the call timeout
    #[error("Circuit breaker timeout ({timeout:?}) exceeded")]
    Timeout {
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// Underlying operation failed
    #[error("Operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitBreakerError<E> {
    /// True if the operation never ran
    pub fn is_not_permitted(&self) -> bool {
        matches!(self, CircuitBreakerError::NotPermitted(_))
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitMetrics {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Failure percentage of the current window, `None` below the minimum calls
    pub failure_rate: Option<f64>,
    /// Slow-call percentage of the current window, `None` below the minimum calls
    pub slow_call_rate: Option<f64>,
    /// Outcomes currently in the window
    pub buffered_calls: u32,
    /// Failures currently in the window
    pub failed_calls: u32,
    /// Slow calls currently in the window
    pub slow_calls: u32,
    /// Calls rejected since creation
    pub not_permitted_calls: u64,
    /// State transitions since creation
    pub transitions: u64,
}

/// Circuit breaker for preventing cascading failures
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    not_permitted: AtomicU64,
    transitions: AtomicU64,
    trial_permits: TrialPermits,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with config
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let window = config.sliding_window_size.max(1) as usize;
        let trial = config.permitted_calls_in_half_open.max(1) as usize;
        Self {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            not_permitted: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            trial_permits: TrialPermits::default(),
            inner: Mutex::new(BreakerInner {
                window: SlidingWindow::new(window),
                trial: SlidingWindow::new(trial),
                opened_at: None,
            }),
        }
    }

    /// Create with default config and name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::new(name))
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    /// Ask for permission to run one call.
    ///
    /// Moves OPEN to HALF_OPEN once the wait has elapsed and hands out trial
    /// permits. A permit obtained here is held until an outcome is recorded.
    pub async fn acquire_permission(&self) -> std::result::Result<(), CallNotPermitted> {
        self.permit().await.map(Permit::settle)
    }

    async fn permit(&self) -> std::result::Result<Permit<'_>, CallNotPermitted> {
        let mut inner = self.inner.lock().await;

        if self.state() == CircuitState::Open {
            let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
            if elapsed >= self.config.wait_duration_in_open_state {
                self.transition(&mut inner, CircuitState::HalfOpen);
            } else {
                return Err(self.reject(
                    CircuitState::Open,
                    self.config.wait_duration_in_open_state - elapsed,
                ));
            }
        }

        match self.state() {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                trial_period: None,
            }),
            CircuitState::HalfOpen => match self.trial_permits.try_take(self.config.permitted_calls_in_half_open) {
                Some(period) => Ok(Permit {
                    breaker: self,
                    trial_period: Some(period),
                }),
                None => Err(self.reject(CircuitState::HalfOpen, Duration::ZERO)),
            },
            CircuitState::Open => Err(self.reject(CircuitState::Open, Duration::ZERO)),
        }
    }

    fn reject(&self, state: CircuitState, retry_after: Duration) -> CallNotPermitted {
        self.not_permitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            circuit = %self.config.name,
            state = ?state,
            retry_after_ms = retry_after.as_millis() as u64,
            "Call not permitted"
        );
        CallNotPermitted {
            name: self.config.name.clone(),
            state,
            retry_after,
        }
    }

    /// Record the outcome of a permitted call
    pub async fn on_outcome(&self, outcome: CallOutcome) {
        let mut inner = self.inner.lock().await;

        match self.state() {
            CircuitState::Closed => {
                inner.window.record(outcome);
                if inner.window.len() < self.config.effective_minimum_calls() {
                    return;
                }
                if self.rates_exceeded(&inner.window) {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.trial.record(outcome);
                if inner.trial.len() < self.config.permitted_calls_in_half_open as usize {
                    return;
                }
                if self.rates_exceeded(&inner.trial) {
                    self.transition(&mut inner, CircuitState::Open);
                } else {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                // Late completion of a call permitted before the trip
            }
        }
    }

    /// Record a successful call
    pub async fn record_success(&self) {
        self.on_outcome(CallOutcome::Success).await;
    }

    /// Record a failed call
    pub async fn record_failure(&self) {
        self.on_outcome(CallOutcome::Failure).await;
    }

    /// Record a slow call
    pub async fn record_slow(&self) {
        self.on_outcome(CallOutcome::Slow).await;
    }

    fn rates_exceeded(&self, window: &SlidingWindow) -> bool {
        let failure_rate = window.failure_rate();
        let slow_rate = window.slow_call_rate();

        if failure_rate >= self.config.failure_rate_threshold {
            tracing::warn!(
                circuit = %self.config.name,
                failure_rate,
                threshold = self.config.failure_rate_threshold,
                calls = window.len(),
                "Failure rate exceeded"
            );
            return true;
        }
        if slow_rate >= self.config.slow_call_rate_threshold {
            tracing::warn!(
                circuit = %self.config.name,
                slow_call_rate = slow_rate,
                threshold = self.config.slow_call_rate_threshold,
                calls = window.len(),
                "Slow call rate exceeded"
            );
            return true;
        }
        false
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = self.state();
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                inner.trial.clear();
            }
            CircuitState::Closed => {
                inner.window.clear();
                inner.trial.clear();
                inner.opened_at = None;
            }
        }
        self.trial_permits.restart();
        self.state.store(to as u8, Ordering::SeqCst);
        self.transitions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            circuit = %self.config.name,
            from = ?from,
            to = ?to,
            "Circuit breaker state transition"
        );
    }

    /// Execute a function with circuit breaker protection.
    ///
    /// Every error counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.execute_filtered(f, |_| true).await
    }

    /// Execute a function, recording an error only when `records` returns true.
    ///
    /// Ignored errors leave no trace in the window.
    pub async fn execute_filtered<F, Fut, T, E, P>(
        &self,
        f: F,
        records: P,
    ) -> std::result::Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let permit = self.permit().await.map_err(CircuitBreakerError::NotPermitted)?;

        let started = Instant::now();
        let result = match self.config.call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, f()).await {
                Ok(result) => result,
                Err(_) => {
                    self.on_outcome(CallOutcome::Slow).await;
                    permit.settle();
                    tracing::warn!(
                        circuit = %self.config.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "Circuit breaker call timed out"
                    );
                    return Err(CircuitBreakerError::Timeout { timeout });
                }
            },
            None => f().await,
        };

        match result {
            Ok(value) => {
                if started.elapsed() > self.config.slow_call_duration_threshold {
                    self.on_outcome(CallOutcome::Slow).await;
                } else {
                    self.on_outcome(CallOutcome::Success).await;
                }
                permit.settle();
                Ok(value)
            }
            Err(e) => {
                if records(&e) {
                    self.on_outcome(CallOutcome::Failure).await;
                    permit.settle();
                } else {
                    drop(permit);
                }
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Get metrics
    pub async fn metrics(&self) -> CircuitMetrics {
        let inner = self.inner.lock().await;
        let state = self.state();
        let window = if state == CircuitState::HalfOpen {
            &inner.trial
        } else {
            &inner.window
        };
        let evaluable = match state {
            CircuitState::HalfOpen => window.len() > 0,
            _ => window.len() >= self.config.effective_minimum_calls(),
        };
        CircuitMetrics {
            name: self.config.name.clone(),
            state,
            failure_rate: evaluable.then(|| window.failure_rate()),
            slow_call_rate: evaluable.then(|| window.slow_call_rate()),
            buffered_calls: window.len() as u32,
            failed_calls: window.failures as u32,
            slow_calls: window.slow as u32,
            not_permitted_calls: self.not_permitted.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
        }
    }

    /// Force close the circuit (admin)
    pub async fn force_close(&self) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Force open the circuit (admin)
    pub async fn force_open(&self) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Return to a fresh CLOSED breaker, clearing counters (admin)
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.window.clear();
        inner.trial.clear();
        inner.opened_at = None;
        self.trial_permits.restart();
        self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
        self.not_permitted.store(0, Ordering::Relaxed);
        self.transitions.store(0, Ordering::Relaxed);
        tracing::info!(circuit = %self.config.name, "Circuit breaker reset");
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Named breakers, one per protected dependency
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the payment, campaign, video and database breakers
    pub fn with_defaults() -> Self {
        Self::from_configs([
            CircuitBreakerConfig::payment_api(),
            CircuitBreakerConfig::campaign_api(),
            CircuitBreakerConfig::video_api(),
            CircuitBreakerConfig::database(),
        ])
    }

    /// Build from configs; later duplicates replace earlier ones
    pub fn from_configs(configs: impl IntoIterator<Item = CircuitBreakerConfig>) -> Self {
        let registry = Self::new();
        for config in configs {
            registry.register(config);
        }
        registry
    }

    /// Register (or replace) a breaker
    pub fn register(&self, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(config));
        self.breakers
            .insert(breaker.name().to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Breaker by name
    pub fn get(&self, name: &str) -> Result<Arc<CircuitBreaker>> {
        self.breakers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CourierError::UnknownBreaker(name.to_string()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Metrics of every breaker, sorted by name
    pub async fn metrics(&self) -> Vec<CircuitMetrics> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| Arc::clone(e.value())).collect();
        let mut metrics = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            metrics.push(breaker.metrics().await);
        }
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Number of registered breakers
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// True if no breaker is registered
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn small(name: &str) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(name)
            .with_failure_rate_threshold(50.0)
            .with_minimum_number_of_calls(4)
            .with_sliding_window_size(4)
            .with_permitted_calls_in_half_open(2)
            .with_wait_duration_in_open_state(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::with_name("test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.acquire_permission().await.is_ok());
    }

    #[tokio::test]
    async fn test_no_transition_below_minimum_calls() {
        let cb = CircuitBreaker::new(small("test"));
        for _ in 0..3 {
            cb.record_failure().await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().await.failure_rate, None);

        cb.record_failure().await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let cb = CircuitBreaker::new(small("test"));
        cb.record_success().await;
        cb.record_success().await;
        cb.record_failure().await;
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure().await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_window_evicts_oldest() {
        let cb = CircuitBreaker::new(small("test").with_failure_rate_threshold(75.0));
        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        cb.record_success().await;
        // window: F F S S -> 50%
        cb.record_success().await;
        // window: F S S S -> 25%
        let metrics = cb.metrics().await;
        assert_eq!(metrics.failed_calls, 1);
        assert_eq!(metrics.failure_rate, Some(25.0));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_slow_calls_open_circuit() {
        let cb = CircuitBreaker::new(small("test").with_slow_call_rate_threshold(50.0));
        cb.record_slow().await;
        cb.record_success().await;
        cb.record_slow().await;
        cb.record_success().await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_rejects_without_running() {
        let cb = CircuitBreaker::with_name("test");
        cb.force_open().await;

        let ran = AtomicU32::new(0);
        let counter = &ran;
        let result: std::result::Result<(), CircuitBreakerError<&str>> = cb
            .execute(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_not_permitted());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(cb.metrics().await.not_permitted_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_wait_then_closes() {
        let cb = CircuitBreaker::new(small("test"));
        cb.force_open().await;

        let err = cb.acquire_permission().await.unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.acquire_permission().await.is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success().await;

        assert!(cb.acquire_permission().await.is_ok());
        // Both trial permits are out
        assert!(cb.acquire_permission().await.is_err());
        cb.record_success().await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().await.buffered_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_reopens_on_bad_trials() {
        let cb = CircuitBreaker::new(small("test"));
        cb.force_open().await;
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(cb.acquire_permission().await.is_ok());
        cb.record_failure().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.acquire_permission().await.is_ok());
        cb.record_success().await;
        assert_eq!(cb.state(), CircuitState::Open);

        // Timer restarted
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cb.acquire_permission().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_call_returns_its_permit() {
        let config = CircuitBreakerConfig::new("test")
            .with_minimum_number_of_calls(1)
            .with_sliding_window_size(1)
            .with_permitted_calls_in_half_open(1)
            .with_wait_duration_in_open_state(Duration::from_secs(10));
        let cb = CircuitBreaker::new(config);

        let tripped: std::result::Result<(), _> = cb.execute(|| async { Err("down") }).await;
        assert!(tripped.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(10)).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            cb.execute(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, &str>(())
            }),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        tokio::time::advance(Duration::from_secs(3600)).await;
        let trial: std::result::Result<u8, CircuitBreakerError<&str>> = cb.execute(|| async { Ok(7) }).await;
        assert_eq!(trial.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_from_earlier_half_open_period_is_not_returned_twice() {
        let cb = CircuitBreaker::new(small("test"));
        cb.force_open().await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let stale = cb.permit().await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.force_open().await;
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(cb.acquire_permission().await.is_ok());
        assert!(cb.acquire_permission().await.is_ok());
        drop(stale);
        assert!(cb.acquire_permission().await.is_err(), "stale permit freed a slot");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_success_counts_as_slow() {
        let config = small("test").with_slow_call_duration_threshold(Duration::from_millis(100));
        let cb = CircuitBreaker::new(config);

        let result: std::result::Result<u8, CircuitBreakerError<&str>> = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(1)
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(cb.metrics().await.slow_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_slow() {
        let config = small("test").with_call_timeout(Duration::from_millis(50));
        let cb = CircuitBreaker::new(config);

        let result: std::result::Result<u8, CircuitBreakerError<&str>> = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(1)
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Timeout { .. })));
        let metrics = cb.metrics().await;
        assert_eq!(metrics.slow_calls, 1);
        assert_eq!(metrics.failed_calls, 0);
    }

    #[tokio::test]
    async fn test_ignored_errors_not_recorded() {
        let cb = CircuitBreaker::new(small("test"));
        let result: std::result::Result<(), _> =
            cb.execute_filtered(|| async { Err::<(), _>("not found") }, |_| false).await;
        assert!(matches!(result, Err(CircuitBreakerError::Inner("not found"))));
        assert_eq!(cb.metrics().await.buffered_calls, 0);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let cb = CircuitBreaker::with_name("test");
        cb.force_open().await;
        let _ = cb.acquire_permission().await;
        cb.reset().await;
        let metrics = cb.metrics().await;
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.not_permitted_calls, 0);
        assert_eq!(metrics.transitions, 0);
    }

    #[test]
    fn test_presets_are_valid() {
        for config in [
            CircuitBreakerConfig::payment_api(),
            CircuitBreakerConfig::campaign_api(),
            CircuitBreakerConfig::video_api(),
            CircuitBreakerConfig::database(),
        ] {
            assert!(config.validate().is_ok(), "{}", config.name);
        }
        let payment = CircuitBreakerConfig::payment_api();
        let video = CircuitBreakerConfig::video_api();
        assert!(payment.failure_rate_threshold < video.failure_rate_threshold);
        assert!(payment.wait_duration_in_open_state < video.wait_duration_in_open_state);
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        assert!(CircuitBreakerConfig::new("x").with_failure_rate_threshold(0.0).validate().is_err());
        assert!(CircuitBreakerConfig::new("x").with_slow_call_rate_threshold(101.0).validate().is_err());
        assert!(CircuitBreakerConfig::new("x").with_sliding_window_size(0).validate().is_err());
        assert!(CircuitBreakerConfig::new("x").with_permitted_calls_in_half_open(0).validate().is_err());
    }

    #[tokio::test]
    async fn test_effective_minimum_is_capped_by_window() {
        let config = CircuitBreakerConfig::new("test")
            .with_minimum_number_of_calls(100)
            .with_sliding_window_size(3);
        let cb = CircuitBreaker::new(config);
        for _ in 0..3 {
            cb.record_failure().await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_registry() {
        let registry = CircuitBreakerRegistry::with_defaults();
        assert_eq!(registry.len(), 4);
        assert_eq!(
            registry.names(),
            vec!["campaign-api", "database", "payment-api", "video-api"]
        );
        let payment = registry.get("payment-api").unwrap();
        let again = registry.get("payment-api").unwrap();
        assert!(Arc::ptr_eq(&payment, &again));
        assert!(matches!(registry.get("nope"), Err(CourierError::UnknownBreaker(_))));
        assert_eq!(registry.metrics().await.len(), 4);
    }
}
