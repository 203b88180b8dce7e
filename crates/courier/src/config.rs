//! Configuration
//!
//! All durations are milliseconds. Configuration is read once at startup; the
//! registries built from it never change afterwards.

use crate::pipeline::{PipelineConfig, TerminalAction};
use crate::rebalance::RebalanceSettings;
use crate::runtime::RuntimeSettings;
use courier_error::{CourierError, ErrorKind, Result};
use courier_resilience::{
    BackoffPolicy, BackoffStrategy, CircuitBreakerConfig, ErrorClassifier, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReliabilityConfig {
    /// Consumer pipelines by name
    pub pipelines: BTreeMap<String, PipelineSettings>,
    /// Circuit breakers by downstream dependency
    pub breakers: BTreeMap<String, BreakerSettings>,
    /// Retry policies by operation
    pub retry_policies: BTreeMap<String, RetryPolicySettings>,
    /// Dead-letter routing
    pub dead_letter: DeadLetterSettings,
    /// Consumer runtime and rebalance handling
    pub consumer: ConsumerSettings,
}

/// Terminal action of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminalActionSetting {
    /// Publish to the dead-letter topic
    DeadLetter,
    /// Raise a manual-intervention alert
    Alert,
}

/// One consumer pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    /// Retries after the first delivery. `None` bounds retrying by time only.
    pub max_retries: Option<u32>,
    /// Delay before the first retry
    pub initial_interval: u64,
    /// Delay cap
    pub max_interval: u64,
    /// Growth factor
    pub multiplier: f64,
    /// Exponential (true) or fixed (false) delays
    pub use_exponential_backoff: bool,
    /// Ceiling on cumulative delay. Defaults to `maxInterval * maxRetries` for
    /// exponential backoff.
    pub max_elapsed_time: Option<u64>,
    /// Copy stack traces into dead-letter envelopes
    pub include_stack_trace: bool,
    /// `dlt-priority` value
    pub priority: Option<String>,
    /// FATAL kinds; the standard set when absent
    pub fatal_kinds: Option<Vec<ErrorKind>>,
    /// What happens once retrying is over
    pub terminal_action: TerminalActionSetting,
    /// Retry through `{topic}{suffix}` instead of sleeping
    pub redelivery_topic_suffix: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_retries: Some(5),
            initial_interval: 1000,
            max_interval: 30_000,
            multiplier: 2.0,
            use_exponential_backoff: true,
            max_elapsed_time: None,
            include_stack_trace: false,
            priority: None,
            fatal_kinds: None,
            terminal_action: TerminalActionSetting::DeadLetter,
            redelivery_topic_suffix: None,
        }
    }
}

impl PipelineSettings {
    fn backoff(&self) -> BackoffPolicy {
        let strategy = if self.use_exponential_backoff {
            BackoffStrategy::Exponential
        } else {
            BackoffStrategy::Fixed
        };
        let max_interval = if self.use_exponential_backoff {
            ms(self.max_interval)
        } else {
            ms(self.initial_interval)
        };
        let max_elapsed = match (self.max_elapsed_time, self.use_exponential_backoff, self.max_retries) {
            (Some(limit), _, _) => Some(ms(limit)),
            (None, true, Some(retries)) => Some(max_interval.saturating_mul(retries)),
            (None, _, _) => None,
        };
        BackoffPolicy {
            strategy,
            initial_interval: ms(self.initial_interval),
            max_interval,
            multiplier: if self.use_exponential_backoff { self.multiplier } else { 1.0 },
            max_retries: self.max_retries,
            max_elapsed,
            jitter: 0.0,
        }
    }

    /// Build the runtime pipeline settings
    pub fn to_pipeline_config(&self, name: &str) -> Result<PipelineConfig> {
        let classifier = match &self.fatal_kinds {
            Some(kinds) => ErrorClassifier::new().with_fatal_kinds(kinds.iter().cloned()),
            None => ErrorClassifier::standard(),
        };
        let mut config = PipelineConfig::new(name, self.backoff())
            .with_classifier(classifier)
            .with_stack_trace(self.include_stack_trace)
            .with_terminal(match self.terminal_action {
                TerminalActionSetting::DeadLetter => TerminalAction::DeadLetter,
                TerminalActionSetting::Alert => TerminalAction::Alert,
            });
        if let Some(priority) = &self.priority {
            config = config.with_priority(priority.clone());
        }
        if let Some(suffix) = &self.redelivery_topic_suffix {
            config = config.with_redelivery_topic(suffix.clone());
        }
        config
            .validate()
            .map_err(|e| CourierError::Config(format!("pipeline '{}': {}", name, e)))?;
        Ok(config)
    }
}

/// One circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerSettings {
    /// Failure percentage that opens the circuit
    pub failure_rate_threshold: f64,
    /// Slow-call percentage that opens the circuit
    pub slow_call_rate_threshold: f64,
    /// Calls longer than this are slow
    pub slow_call_duration_threshold: u64,
    /// Time spent OPEN before trial calls
    pub wait_duration_in_open_state: u64,
    /// Outcomes needed before rates are evaluated
    pub minimum_number_of_calls: u32,
    /// Outcomes kept
    pub sliding_window_size: u32,
    /// Trial calls while HALF_OPEN
    pub permitted_number_of_calls_in_half_open_state: u32,
    /// Explicit per-call timeout
    pub call_timeout: Option<u64>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_rate_threshold: config.failure_rate_threshold,
            slow_call_rate_threshold: config.slow_call_rate_threshold,
            slow_call_duration_threshold: config.slow_call_duration_threshold.as_millis() as u64,
            wait_duration_in_open_state: config.wait_duration_in_open_state.as_millis() as u64,
            minimum_number_of_calls: config.minimum_number_of_calls,
            sliding_window_size: config.sliding_window_size,
            permitted_number_of_calls_in_half_open_state: config.permitted_calls_in_half_open,
            call_timeout: config.call_timeout.map(|t| t.as_millis() as u64),
        }
    }
}

impl BreakerSettings {
    /// Build the breaker configuration
    pub fn to_breaker_config(&self, name: &str) -> Result<CircuitBreakerConfig> {
        let mut config = CircuitBreakerConfig::new(name)
            .with_failure_rate_threshold(self.failure_rate_threshold)
            .with_slow_call_rate_threshold(self.slow_call_rate_threshold)
            .with_slow_call_duration_threshold(ms(self.slow_call_duration_threshold))
            .with_wait_duration_in_open_state(ms(self.wait_duration_in_open_state))
            .with_minimum_number_of_calls(self.minimum_number_of_calls)
            .with_sliding_window_size(self.sliding_window_size)
            .with_permitted_calls_in_half_open(self.permitted_number_of_calls_in_half_open_state);
        if let Some(timeout) = self.call_timeout {
            config = config.with_call_timeout(ms(timeout));
        }
        config.validate()?;
        Ok(config)
    }
}

/// One downstream operation's retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicySettings {
    /// Total calls, first included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_interval: u64,
    /// Delay cap
    pub max_interval: u64,
    /// Growth factor
    pub multiplier: f64,
    /// Ceiling on cumulative delay
    pub max_elapsed_time: Option<u64>,
    /// Safe to execute more than once
    pub idempotent: bool,
    /// Kinds never retried
    pub non_retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryPolicySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: 1000,
            max_interval: 10_000,
            multiplier: 2.0,
            max_elapsed_time: None,
            idempotent: true,
            non_retryable_kinds: Vec::new(),
        }
    }
}

impl RetryPolicySettings {
    fn write() -> Self {
        Self {
            max_attempts: 1,
            idempotent: false,
            ..Self::default()
        }
    }

    /// Build the policy
    pub fn to_policy(&self, name: &str) -> Result<RetryPolicy> {
        if !self.idempotent && self.max_attempts != 1 {
            return Err(CourierError::Config(format!(
                "retry policy '{}' is not idempotent and must use maxAttempts = 1, got {}",
                name, self.max_attempts
            )));
        }
        let mut policy = if self.idempotent {
            RetryPolicy::idempotent(
                name,
                self.max_attempts,
                ms(self.initial_interval),
                ms(self.max_interval),
                self.multiplier,
            )
        } else {
            RetryPolicy::non_idempotent(name)
        };
        if let Some(limit) = self.max_elapsed_time {
            policy = policy.with_max_elapsed(ms(limit));
        }
        for kind in &self.non_retryable_kinds {
            policy = policy.with_non_retryable(kind.clone());
        }
        policy.validate()?;
        Ok(policy)
    }
}

/// Dead-letter routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeadLetterSettings {
    /// `topic -> dead-letter topic` overrides
    pub topic_overrides: BTreeMap<String, String>,
    /// Fallback suffix
    pub suffix: String,
    /// Publish attempts before giving up
    pub publish_attempts: u32,
    /// Fixed delay between publish attempts
    pub publish_backoff: u64,
    /// JSON-lines file receiving unpublishable dead letters
    pub spill_path: Option<PathBuf>,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            topic_overrides: BTreeMap::from([(
                "smm.offer.assignment.events".to_string(),
                "smm.offer.assignments.dlq".to_string(),
            )]),
            suffix: ".dlq".to_string(),
            publish_attempts: 3,
            publish_backoff: 200,
            spill_path: None,
        }
    }
}

/// Consumer runtime and group settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerSettings {
    /// Consumer group
    pub group: String,
    /// Messages processed concurrently across partitions
    pub concurrency: usize,
    /// Records per poll
    pub max_poll_records: usize,
    /// Poll wait
    pub poll_timeout: u64,
    /// Buffered records per partition worker
    pub partition_buffer: usize,
    /// Bound on draining in-flight work at shutdown or revocation
    pub drain_timeout: u64,
    /// Rebalances tolerated within the alert window
    pub rebalance_alert_threshold: u32,
    /// Rebalance alert window
    pub rebalance_alert_window: u64,
    /// How long processed ids are remembered; 0 disables the idempotency store
    pub idempotency_ttl: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group: "courier".to_string(),
            concurrency: 3,
            max_poll_records: 100,
            poll_timeout: 1000,
            partition_buffer: 64,
            drain_timeout: 30_000,
            rebalance_alert_threshold: 5,
            rebalance_alert_window: 5 * 60 * 1000,
            idempotency_ttl: 24 * 60 * 60 * 1000,
        }
    }
}

impl ConsumerSettings {
    /// Runtime settings
    pub fn runtime(&self) -> RuntimeSettings {
        RuntimeSettings {
            concurrency: self.concurrency,
            max_poll_records: self.max_poll_records,
            poll_timeout: ms(self.poll_timeout),
            partition_buffer: self.partition_buffer,
            drain_timeout: ms(self.drain_timeout),
        }
    }

    /// Rebalance coordinator settings
    pub fn rebalance(&self) -> RebalanceSettings {
        RebalanceSettings::new(self.group.clone())
            .with_storm_alert(self.rebalance_alert_threshold, ms(self.rebalance_alert_window))
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        let order_fatal = ErrorClassifier::order_processing().fatal_kinds().cloned().collect::<Vec<_>>();
        let dead_letter_fatal = ErrorClassifier::dead_letter_processing()
            .fatal_kinds()
            .cloned()
            .collect::<Vec<_>>();

        let pipelines = BTreeMap::from([
            ("default".to_string(), PipelineSettings::default()),
            (
                "high-priority".to_string(),
                PipelineSettings {
                    max_retries: None,
                    initial_interval: 500,
                    max_interval: 10_000,
                    multiplier: 1.5,
                    max_elapsed_time: Some(60_000),
                    priority: Some("HIGH".to_string()),
                    ..PipelineSettings::default()
                },
            ),
            (
                "order-processing".to_string(),
                PipelineSettings {
                    fatal_kinds: Some(sorted(order_fatal)),
                    ..PipelineSettings::default()
                },
            ),
            (
                "dead-letter".to_string(),
                PipelineSettings {
                    max_retries: Some(2),
                    initial_interval: 5000,
                    max_interval: 5000,
                    multiplier: 1.0,
                    use_exponential_backoff: false,
                    fatal_kinds: Some(sorted(dead_letter_fatal)),
                    terminal_action: TerminalActionSetting::Alert,
                    ..PipelineSettings::default()
                },
            ),
        ]);

        let breakers = [
            CircuitBreakerConfig::payment_api(),
            CircuitBreakerConfig::campaign_api(),
            CircuitBreakerConfig::video_api(),
            CircuitBreakerConfig::database(),
        ]
        .iter()
        .map(|c| (c.name.clone(), BreakerSettings::from(c)))
        .collect();

        let retry_policies = BTreeMap::from([
            ("exchange-rate".to_string(), RetryPolicySettings::default()),
            ("campaign-read".to_string(), RetryPolicySettings::default()),
            ("payment-read".to_string(), RetryPolicySettings::default()),
            ("campaign-write".to_string(), RetryPolicySettings::write()),
            ("payment-write".to_string(), RetryPolicySettings::write()),
        ]);

        Self {
            pipelines,
            breakers,
            retry_policies,
            dead_letter: DeadLetterSettings::default(),
            consumer: ConsumerSettings::default(),
        }
    }
}

fn sorted(mut kinds: Vec<ErrorKind>) -> Vec<ErrorKind> {
    kinds.sort();
    kinds
}

impl ReliabilityConfig {
    /// Parse JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CourierError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| CourierError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), "Loaded reliability configuration");
        Ok(config)
    }

    /// Load `.env`, then the file named by `COURIER_CONFIG`, or defaults when unset
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(path),
            _ => {
                tracing::debug!("{} not set, using default reliability configuration", CONFIG_ENV);
                Ok(Self::default())
            }
        }
    }

    /// Write as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Check every invariant
    pub fn validate(&self) -> Result<()> {
        for (name, pipeline) in &self.pipelines {
            pipeline.to_pipeline_config(name)?;
        }
        for (name, breaker) in &self.breakers {
            breaker.to_breaker_config(name)?;
        }
        for (name, policy) in &self.retry_policies {
            policy.to_policy(name)?;
        }
        if self.dead_letter.publish_attempts == 0 {
            return Err(CourierError::Config("deadLetter.publishAttempts must be >= 1".to_string()));
        }
        if self.dead_letter.suffix.is_empty() {
            return Err(CourierError::Config("deadLetter.suffix must not be empty".to_string()));
        }
        if self.consumer.concurrency == 0 {
            return Err(CourierError::Config("consumer.concurrency must be >= 1".to_string()));
        }
        if self.consumer.max_poll_records == 0 || self.consumer.partition_buffer == 0 {
            return Err(CourierError::Config(
                "consumer.maxPollRecords and consumer.partitionBuffer must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Pipeline settings by name
    pub fn pipeline(&self, name: &str) -> Result<PipelineConfig> {
        self.pipelines
            .get(name)
            .ok_or_else(|| CourierError::Config(format!("unknown pipeline '{}'", name)))?
            .to_pipeline_config(name)
    }

    /// Every breaker configuration
    pub fn breaker_configs(&self) -> Result<Vec<CircuitBreakerConfig>> {
        self.breakers
            .iter()
            .map(|(name, settings)| settings.to_breaker_config(name))
            .collect()
    }

    /// Every retry policy
    pub fn retry_policies(&self) -> Result<Vec<RetryPolicy>> {
        self.retry_policies
            .iter()
            .map(|(name, settings)| settings.to_policy(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RetryMode;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReliabilityConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pipelines.len(), 4);
        assert_eq!(config.breakers.len(), 4);
        assert_eq!(config.retry_policies.len(), 5);
    }

    #[test]
    fn test_default_pipeline_matches_preset() {
        let config = ReliabilityConfig::default();
        let built = config.pipeline("default").unwrap();
        assert_eq!(built.backoff, PipelineConfig::default_pipeline().backoff);

        let high = config.pipeline("high-priority").unwrap();
        assert_eq!(high.backoff, BackoffPolicy::high_priority());
        assert_eq!(high.priority.as_deref(), Some("HIGH"));

        let dead = config.pipeline("dead-letter").unwrap();
        assert_eq!(dead.backoff, BackoffPolicy::dead_letter());
        assert_eq!(dead.terminal, TerminalAction::Alert);
        assert_eq!(dead.classifier, ErrorClassifier::dead_letter_processing());

        assert!(config.pipeline("missing").is_err());
    }

    #[test]
    fn test_default_breakers_match_presets() {
        let configs = ReliabilityConfig::default().breaker_configs().unwrap();
        let payment = configs.iter().find(|c| c.name == "payment-api").unwrap();
        assert_eq!(payment, &CircuitBreakerConfig::payment_api());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "pipelines": {
                "orders": {
                    "maxRetries": 3,
                    "initialInterval": 100,
                    "maxInterval": 1000,
                    "includeStackTrace": true,
                    "fatalKinds": ["IllegalArgumentException", "JsonParseException"],
                    "redeliveryTopicSuffix": ".retry"
                }
            },
            "deadLetter": { "spillPath": "/var/lib/courier/dead-letters.jsonl" }
        }"#;
        let config = ReliabilityConfig::from_json(json).unwrap();
        assert_eq!(config.pipelines.len(), 1);
        assert!(config.breakers.is_empty());
        assert_eq!(config.dead_letter.publish_attempts, 3);
        assert_eq!(config.consumer.drain_timeout, 30_000);

        let orders = config.pipeline("orders").unwrap();
        assert_eq!(orders.backoff.max_retries, Some(3));
        assert_eq!(orders.backoff.max_elapsed, Some(Duration::from_secs(3)));
        assert!(orders.include_stack_trace);
        assert!(orders.classifier.is_fatal(&ErrorKind::IllegalArgument));
        assert!(!orders.classifier.is_fatal(&ErrorKind::UserValidation));
        assert!(matches!(orders.retry_mode, RetryMode::RedeliveryTopic { .. }));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_interval = r#"{"pipelines": {"p": {"initialInterval": 5000, "maxInterval": 100}}}"#;
        assert!(matches!(
            ReliabilityConfig::from_json(bad_interval),
            Err(CourierError::Config(_))
        ));

        let bad_breaker = r#"{"breakers": {"b": {"failureRateThreshold": 0}}}"#;
        assert!(ReliabilityConfig::from_json(bad_breaker).is_err());

        let retried_write = r#"{"retryPolicies": {"payment-write": {"idempotent": false, "maxAttempts": 3}}}"#;
        assert!(ReliabilityConfig::from_json(retried_write).is_err());

        assert!(ReliabilityConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.json");
        let config = ReliabilityConfig::default();
        config.save(&path).unwrap();
        assert_eq!(ReliabilityConfig::load(&path).unwrap(), config);
        assert!(ReliabilityConfig::load(dir.path().join("missing.json")).is_err());
    }
}
