//! # Courier
//!
//! Reliability layer for partitioned, at-least-once message consumers.
//!
//! When a handler fails, the failure is classified as retryable or fatal.
//! Retryable failures are retried with bounded backoff. Fatal or exhausted
//! failures are dead-lettered with diagnostic headers, and the consumer commits
//! past the message. Downstream calls made by handlers go through named circuit
//! breakers and retry policies, and partition rebalances are coordinated so
//! processed offsets are never lost.
//!
//! ## Components
//!
//! - [`pipeline`]: per-message retry loop and terminal actions
//! - [`dead_letter`]: topic resolution, envelope headers, publish/spill/drop
//! - [`rebalance`]: partition ownership callbacks and offset tracking
//! - [`metrics`]: reliability counters and per-group rebalance stats
//! - [`runtime`]: one ordered worker per partition, bounded concurrency, draining
//! - [`idempotency`]: processed-message store for redeliveries
//! - [`config`]: JSON configuration with the stock pipelines, breakers and policies
//!
//! Classification, backoff, breakers and retry policies live in
//! [`courier_resilience`] and are re-exported here.
//!
//! ## Example
//!
//! ```rust,no_run
//! use courier::prelude::*;
//! use courier::{Collaborators, Reliability, ReliabilityConfig};
//! use std::sync::Arc;
//!
//! struct OrderHandler;
//!
//! #[async_trait]
//! impl MessageHandler for OrderHandler {
//!     async fn handle(&self, ctx: &ProcessingContext<'_>) -> Result<(), ProcessingError> {
//!         if ctx.message.payload.is_empty() {
//!             return Err(ProcessingError::new(ErrorKind::IllegalArgument, "empty order"));
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # async fn example(
//! #     publisher: Arc<dyn RecordPublisher>,
//! #     consumer: Arc<dyn ConsumerControl>,
//! #     source: Arc<dyn MessageSource>,
//! # ) -> courier_error::Result<()> {
//! let reliability = Reliability::from_config(
//!     ReliabilityConfig::from_env()?,
//!     Collaborators::new(publisher, consumer),
//! )?;
//! let pipeline = reliability.pipeline("order-processing", Arc::new(OrderHandler))?;
//! let runtime = reliability.runtime(source, Arc::new(pipeline));
//!
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! runtime.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alerts;
pub mod config;
pub mod dead_letter;
pub mod idempotency;
pub mod metrics;
pub mod pipeline;
pub mod rebalance;
pub mod runtime;

pub use alerts::TracingAlertSink;
pub use config::{
    BreakerSettings, ConsumerSettings, DeadLetterSettings, PipelineSettings, ReliabilityConfig,
    RetryPolicySettings, TerminalActionSetting,
};
pub use dead_letter::{DeadLetterEnvelope, DeadLetterOutcome, DeadLetterRouter, DeadLetterTopics, FileSpill};
pub use idempotency::IdempotencyStore;
pub use metrics::{GroupRebalanceStats, MetricsSnapshot, ReliabilityMetrics};
pub use pipeline::{Pipeline, PipelineConfig, ProcessOutcome, RetryMode, TerminalAction};
pub use rebalance::{OffsetTracker, PartitionAssignment, RebalanceCoordinator, RebalanceSettings};
pub use runtime::{ConsumerRuntime, RunSummary, RuntimeSettings};

pub use courier_resilience::{
    BackoffPolicy, CallGuard, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitMetrics, CircuitState, Classification, ErrorClassifier, GuardError, RetryClassifier,
    RetryPolicy, RetryRegistry,
};

use courier_error::Result;
use courier_traits::{
    AlertSink, ConsumerControl, DeadLetterSpill, MessageHandler, MessageSource, RecordPublisher,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Handler-facing re-exports
pub mod prelude {
    pub use courier_traits::prelude::*;
}

/// External clients the reliability layer is wired to
#[derive(Clone)]
pub struct Collaborators {
    /// Shared publish client, used for dead letters and redeliveries
    pub publisher: Arc<dyn RecordPublisher>,
    /// Offset commits and seeks
    pub consumer: Arc<dyn ConsumerControl>,
    /// Operator alert hook; alerts are logged when absent
    pub alerts: Option<Arc<dyn AlertSink>>,
    /// Dead-letter spill; overrides `deadLetter.spillPath`
    pub spill: Option<Arc<dyn DeadLetterSpill>>,
}

impl Collaborators {
    /// Publisher and consumer, no alert hook or spill
    pub fn new(publisher: Arc<dyn RecordPublisher>, consumer: Arc<dyn ConsumerControl>) -> Self {
        Self {
            publisher,
            consumer,
            alerts: None,
            spill: None,
        }
    }

    /// Set the alert hook
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Set the spill
    pub fn with_spill(mut self, spill: Arc<dyn DeadLetterSpill>) -> Self {
        self.spill = Some(spill);
        self
    }
}

/// Everything the reliability layer exposes for scraping
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilityReport {
    /// `totalErrors`, `retriedErrors`, `dlqSentCount`, `nonRetryableErrors`, `errorRate`
    pub errors: BTreeMap<&'static str, f64>,
    /// Every counter
    pub counters: MetricsSnapshot,
    /// Per-breaker state and rates
    pub breakers: Vec<CircuitMetrics>,
    /// Per-group rebalance counters
    pub rebalances: BTreeMap<String, GroupRebalanceStats>,
}

/// Composition root: builds every component from one configuration
pub struct Reliability {
    config: ReliabilityConfig,
    consumer: Arc<dyn ConsumerControl>,
    metrics: Arc<ReliabilityMetrics>,
    breakers: Arc<CircuitBreakerRegistry>,
    retries: RetryRegistry,
    router: Arc<DeadLetterRouter>,
    coordinator: Arc<RebalanceCoordinator>,
    idempotency: Option<Arc<IdempotencyStore>>,
}

impl std::fmt::Debug for Reliability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reliability")
            .field("pipelines", &self.config.pipelines.keys().collect::<Vec<_>>())
            .field("breakers", &self.breakers.names())
            .field("retries", &self.retries.names())
            .finish()
    }
}

impl Reliability {
    /// Validate `config` and wire every component
    pub fn from_config(config: ReliabilityConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(ReliabilityMetrics::new());
        let alerts = collaborators
            .alerts
            .unwrap_or_else(|| Arc::new(TracingAlertSink) as Arc<dyn AlertSink>);

        let breakers = Arc::new(CircuitBreakerRegistry::from_configs(config.breaker_configs()?));
        let retries = RetryRegistry::new(config.retry_policies()?)?;

        let dead_letter = &config.dead_letter;
        let topics = DeadLetterTopics::new(dead_letter.topic_overrides.clone())
            .with_suffix(dead_letter.suffix.clone());
        let mut router = DeadLetterRouter::new(
            topics,
            Arc::clone(&collaborators.publisher),
            Arc::clone(&alerts),
            Arc::clone(&metrics),
        )
        .with_publish_retries(
            dead_letter.publish_attempts,
            Duration::from_millis(dead_letter.publish_backoff),
        );
        let spill = collaborators.spill.or_else(|| {
            dead_letter
                .spill_path
                .as_ref()
                .map(|path| Arc::new(FileSpill::new(path.clone())) as Arc<dyn DeadLetterSpill>)
        });
        if let Some(spill) = spill {
            router = router.with_spill(spill);
        }

        let coordinator = Arc::new(RebalanceCoordinator::new(
            config.consumer.rebalance(),
            Arc::clone(&collaborators.consumer),
            Arc::new(OffsetTracker::new()),
            alerts,
            Arc::clone(&metrics),
        ));

        let idempotency = match config.consumer.idempotency_ttl {
            0 => None,
            ttl => Some(Arc::new(IdempotencyStore::new(Duration::from_millis(ttl)))),
        };

        tracing::info!(
            pipelines = config.pipelines.len(),
            breakers = breakers.len(),
            retry_policies = retries.len(),
            group = %config.consumer.group,
            "Reliability layer initialized"
        );

        Ok(Self {
            config,
            consumer: collaborators.consumer,
            metrics,
            breakers,
            retries,
            router: Arc::new(router),
            coordinator,
            idempotency,
        })
    }

    /// Pipeline `name` around `handler`
    pub fn pipeline(&self, name: &str, handler: Arc<dyn MessageHandler>) -> Result<Pipeline> {
        let pipeline = Pipeline::new(self.config.pipeline(name)?, handler, Arc::clone(&self.router));
        Ok(match &self.idempotency {
            Some(store) => pipeline.with_idempotency(Arc::clone(store)),
            None => pipeline,
        })
    }

    /// Breaker `breaker` paired with retry policy `operation`
    pub fn guard(&self, breaker: &str, operation: &str) -> Result<CallGuard> {
        CallGuard::from_registries(&self.breakers, breaker, &self.retries, operation)
    }

    /// Worker runtime feeding `pipeline` from `source`
    pub fn runtime(&self, source: Arc<dyn MessageSource>, pipeline: Arc<Pipeline>) -> ConsumerRuntime {
        ConsumerRuntime::new(
            self.config.consumer.runtime(),
            source,
            Arc::clone(&self.consumer),
            pipeline,
            Arc::clone(&self.coordinator),
        )
    }

    /// Configuration in effect
    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Counters
    pub fn metrics(&self) -> &Arc<ReliabilityMetrics> {
        &self.metrics
    }

    /// Breakers by downstream dependency
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Retry policies by operation
    pub fn retries(&self) -> &RetryRegistry {
        &self.retries
    }

    /// Dead-letter router
    pub fn router(&self) -> &Arc<DeadLetterRouter> {
        &self.router
    }

    /// Rebalance coordinator
    pub fn rebalance(&self) -> &Arc<RebalanceCoordinator> {
        &self.coordinator
    }

    /// Idempotency store, unless disabled
    pub fn idempotency(&self) -> Option<&Arc<IdempotencyStore>> {
        self.idempotency.as_ref()
    }

    /// Snapshot of every exposed metric
    pub async fn report(&self) -> ReliabilityReport {
        let counters = self.metrics.snapshot();
        ReliabilityReport {
            errors: counters.error_map(),
            counters,
            breakers: self.breakers.metrics().await,
            rebalances: self.metrics.groups(),
        }
    }
}
