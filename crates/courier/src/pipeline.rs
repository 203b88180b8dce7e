//! Consumer processing pipeline
//!
//! Runs the handler for one message, classifies each failure and either retries
//! under the pipeline's backoff or takes the terminal action. Retries block the
//! owning partition worker by default; a pipeline may instead re-publish the
//! record to a redelivery topic and move on.
//!
//! Every outcome returned by [`Pipeline::process`] is final for the source
//! offset: the caller commits past the message in all cases.

use crate::dead_letter::{DeadLetterEnvelope, DeadLetterOutcome, DeadLetterRouter};
use crate::idempotency::IdempotencyStore;
use chrono::Utc;
use courier_error::{ProcessingError, Result};
use courier_resilience::{BackoffPolicy, Classification, ErrorClassifier, RetryClassifier};
use courier_traits::{
    Alert, AlertKind, DelaySource, InboundMessage, MessageHandler, OutboundRecord,
    ProcessingContext, TokioDelay, DELIVERY_ATTEMPT_HEADER, NOT_BEFORE_HEADER, ORIGIN_OFFSET_HEADER,
    ORIGIN_PARTITION_HEADER, ORIGIN_TIMESTAMP_HEADER, ORIGIN_TOPIC_HEADER,
};
use std::sync::Arc;
use std::time::Duration;

/// What happens once retrying is over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalAction {
    /// Publish to the dead-letter topic
    DeadLetter,
    /// Raise a manual-intervention alert; used when consuming dead letters
    Alert,
}

/// How a retry waits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryMode {
    /// Sleep on the partition worker
    InProcess,
    /// Re-publish to `{topic}{suffix}` and commit the original offset
    RedeliveryTopic {
        /// Suffix of the redelivery topic, e.g. `.retry`
        suffix: String,
    },
}

/// Per-pipeline settings
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,
    /// Retry delays and ceilings
    pub backoff: BackoffPolicy,
    /// FATAL set
    pub classifier: ErrorClassifier,
    /// Copy the failure's stack trace into the envelope
    pub include_stack_trace: bool,
    /// `dlt-priority` value
    pub priority: Option<String>,
    /// Terminal action
    pub terminal: TerminalAction,
    /// Retry mode
    pub retry_mode: RetryMode,
}

impl PipelineConfig {
    /// Dead-lettering, in-process pipeline with the standard FATAL set
    pub fn new(name: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            name: name.into(),
            backoff,
            classifier: ErrorClassifier::standard(),
            include_stack_trace: false,
            priority: None,
            terminal: TerminalAction::DeadLetter,
            retry_mode: RetryMode::InProcess,
        }
    }

    /// Five retries, 1s doubling to 30s
    pub fn default_pipeline() -> Self {
        Self::new("default", BackoffPolicy::standard())
    }

    /// Short delays bounded by one minute, dead letters tagged `HIGH`
    pub fn high_priority() -> Self {
        Self::new("high-priority", BackoffPolicy::high_priority()).with_priority("HIGH")
    }

    /// Default backoff with business-rule violations treated as FATAL
    pub fn order_processing() -> Self {
        Self::new("order-processing", BackoffPolicy::standard())
            .with_classifier(ErrorClassifier::order_processing())
    }

    /// Consumes dead letters: two retries 5s apart, then alert
    pub fn dead_letter_processing() -> Self {
        Self::new("dead-letter", BackoffPolicy::dead_letter())
            .with_classifier(ErrorClassifier::dead_letter_processing())
            .with_terminal(TerminalAction::Alert)
    }

    /// Set the classifier
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Set the priority marker
    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    /// Include stack traces in envelopes
    pub fn with_stack_trace(mut self, include: bool) -> Self {
        self.include_stack_trace = include;
        self
    }

    /// Set the terminal action
    pub fn with_terminal(mut self, terminal: TerminalAction) -> Self {
        self.terminal = terminal;
        self
    }

    /// Retry through a redelivery topic instead of sleeping
    pub fn with_redelivery_topic(mut self, suffix: impl Into<String>) -> Self {
        self.retry_mode = RetryMode::RedeliveryTopic { suffix: suffix.into() };
        self
    }

    /// Check the backoff invariants
    pub fn validate(&self) -> Result<()> {
        self.backoff.validate()
    }
}

/// Final result of processing one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The handler succeeded
    Succeeded {
        /// Handler invocations
        attempts: u32,
    },
    /// Retries exhausted or FATAL, sent to the dead-letter router
    DeadLettered {
        /// Handler invocations
        attempts: u32,
        /// Classification of the last failure
        classification: Classification,
        /// Router outcome
        outcome: DeadLetterOutcome,
    },
    /// Handed to the redelivery topic for a later attempt
    Redelivered {
        /// Redelivery topic
        topic: String,
        /// Delivery attempt the republished record carries
        delivery_attempt: u32,
    },
    /// Terminal alert raised instead of dead-lettering
    Escalated {
        /// Handler invocations
        attempts: u32,
    },
    /// Already processed, skipped
    Duplicate,
}

/// Retry loop around one handler
pub struct Pipeline {
    config: PipelineConfig,
    handler: Arc<dyn MessageHandler>,
    router: Arc<DeadLetterRouter>,
    delay: Arc<dyn DelaySource>,
    idempotency: Option<Arc<IdempotencyStore>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("idempotency", &self.idempotency.is_some())
            .finish()
    }
}

impl Pipeline {
    /// Pipeline sleeping on tokio's clock
    pub fn new(config: PipelineConfig, handler: Arc<dyn MessageHandler>, router: Arc<DeadLetterRouter>) -> Self {
        Self {
            config,
            handler,
            router,
            delay: Arc::new(TokioDelay),
            idempotency: None,
        }
    }

    /// Replace the delay source
    pub fn with_delay_source(mut self, delay: Arc<dyn DelaySource>) -> Self {
        self.delay = delay;
        self
    }

    /// Skip messages the store has seen, and mark successes
    pub fn with_idempotency(mut self, store: Arc<IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    /// Settings
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Pipeline name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Process `message` to a final outcome
    pub async fn process(&self, message: &InboundMessage) -> ProcessOutcome {
        let metrics = self.router.metrics();

        if let Some(store) = &self.idempotency {
            if store.is_duplicate(&message.message_id()) {
                metrics.record_duplicate();
                tracing::debug!(
                    pipeline = %self.config.name,
                    message_id = %message.message_id(),
                    "Skipping already processed message"
                );
                return ProcessOutcome::Duplicate;
            }
        }

        self.wait_until_due(message).await;

        // Retries already spent on earlier deliveries through a redelivery topic
        let mut retries = message.delivery_attempt.saturating_sub(1);
        let mut delays = self.config.backoff.delays();
        for _ in 0..retries {
            if delays.next().is_none() {
                break;
            }
        }

        let mut ctx = ProcessingContext {
            attempt: message.delivery_attempt.max(1),
            ..ProcessingContext::first(message)
        };
        let mut invocations = 0u32;

        loop {
            invocations += 1;
            let error = match self.handler.handle(&ctx).await {
                Ok(()) => {
                    if let Some(store) = &self.idempotency {
                        store.mark_processed(message.message_id());
                    }
                    tracing::debug!(
                        pipeline = %self.config.name,
                        message_id = %message.message_id(),
                        attempt = ctx.attempt,
                        elapsed = ?ctx.elapsed(),
                        "Message processed"
                    );
                    return ProcessOutcome::Succeeded { attempts: invocations };
                }
                Err(error) => error,
            };

            metrics.record_error();
            let classification = self.config.classifier.classify(&error);
            if classification.is_fatal() {
                metrics.record_non_retryable();
                tracing::warn!(
                    pipeline = %self.config.name,
                    message_id = %message.message_id(),
                    error = %error,
                    "Non-retryable failure"
                );
                return self.terminal(message, &error, retries, invocations, classification).await;
            }

            let Some(delay) = delays.next() else {
                tracing::warn!(
                    pipeline = %self.config.name,
                    message_id = %message.message_id(),
                    retries,
                    error = %error,
                    "Retries exhausted"
                );
                return self.terminal(message, &error, retries, invocations, classification).await;
            };
            let delay = match self.config.classifier.suggested_delay(&error) {
                Some(hint) => delay.max(hint.min(self.config.backoff.max_interval)),
                None => delay,
            };
            metrics.record_retry();

            if let RetryMode::RedeliveryTopic { suffix } = &self.config.retry_mode {
                let next_attempt = ctx.attempt + 1;
                match self.redeliver(message, suffix, next_attempt, delay).await {
                    Ok(topic) => {
                        return ProcessOutcome::Redelivered {
                            topic,
                            delivery_attempt: next_attempt,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            pipeline = %self.config.name,
                            message_id = %message.message_id(),
                            error = %e,
                            "Redelivery publish failed, retrying in process"
                        );
                    }
                }
            }

            tracing::debug!(
                pipeline = %self.config.name,
                message_id = %message.message_id(),
                attempt = ctx.attempt,
                delay = ?delay,
                error = %error,
                "Retrying after transient failure"
            );
            self.delay.delay(delay).await;
            ctx = ctx.next_attempt();
            retries += 1;
        }
    }

    async fn wait_until_due(&self, message: &InboundMessage) {
        let Some(not_before) = message.header(NOT_BEFORE_HEADER).and_then(|v| v.parse::<i64>().ok()) else {
            return;
        };
        let Some(wait) = not_before_wait(not_before, Utc::now().timestamp_millis(), self.config.backoff.max_interval)
        else {
            return;
        };
        tracing::debug!(
            pipeline = %self.config.name,
            message_id = %message.message_id(),
            wait = ?wait,
            "Holding redelivered message until due"
        );
        self.delay.delay(wait).await;
    }

    async fn redeliver(
        &self,
        message: &InboundMessage,
        suffix: &str,
        delivery_attempt: u32,
        delay: Duration,
    ) -> Result<String> {
        let topic = if message.topic.ends_with(suffix) {
            message.topic.clone()
        } else {
            format!("{}{}", message.topic, suffix)
        };
        let not_before = Utc::now()
            .timestamp_millis()
            .saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
        let origin = message.origin();
        let record = OutboundRecord::forward(message, topic.clone())
            .with_header(DELIVERY_ATTEMPT_HEADER, delivery_attempt.to_string())
            .with_header(NOT_BEFORE_HEADER, not_before.to_string())
            .with_header(ORIGIN_TOPIC_HEADER, origin.topic)
            .with_header(ORIGIN_PARTITION_HEADER, origin.partition.to_string())
            .with_header(ORIGIN_OFFSET_HEADER, origin.offset.to_string())
            .with_header(ORIGIN_TIMESTAMP_HEADER, origin.timestamp.to_string());

        self.router.publisher().publish(record).await?;
        tracing::debug!(
            pipeline = %self.config.name,
            message_id = %message.message_id(),
            redelivery_topic = %topic,
            delivery_attempt,
            "Message handed to redelivery topic"
        );
        Ok(topic)
    }

    async fn terminal(
        &self,
        message: &InboundMessage,
        error: &ProcessingError,
        retries: u32,
        attempts: u32,
        classification: Classification,
    ) -> ProcessOutcome {
        match self.config.terminal {
            TerminalAction::DeadLetter => {
                let mut envelope = DeadLetterEnvelope::new(message, error, retries);
                if let Some(priority) = &self.config.priority {
                    envelope = envelope.with_priority(priority.clone());
                }
                if self.config.include_stack_trace {
                    if let Some(trace) = error.stack_trace() {
                        envelope = envelope.with_stack_trace(trace);
                    }
                }
                let outcome = self.router.route(message, &envelope).await;
                ProcessOutcome::DeadLettered {
                    attempts,
                    classification,
                    outcome,
                }
            }
            TerminalAction::Alert => {
                let origin = message
                    .header(crate::dead_letter::headers::ORIGINAL_TOPIC)
                    .unwrap_or(&message.topic)
                    .to_string();
                tracing::error!(
                    severity = "CRITICAL",
                    pipeline = %self.config.name,
                    message_id = %message.message_id(),
                    original_topic = %origin,
                    error = %error,
                    "Dead-letter processing failed, manual intervention required"
                );
                self.router
                    .alerts()
                    .raise(
                        Alert::critical(
                            AlertKind::DeadLetterProcessingFailed,
                            format!("dead letter {} failed again", message.message_id()),
                        )
                        .with_context("messageId", message.message_id())
                        .with_context("originalTopic", origin)
                        .with_context("exception", error.kind())
                        .with_context("error", error.message()),
                    )
                    .await;
                ProcessOutcome::Escalated { attempts }
            }
        }
    }
}

/// Remaining wait for a `courier-not-before` deadline, never longer than `ceiling`
fn not_before_wait(not_before: i64, now: i64, ceiling: Duration) -> Option<Duration> {
    let wait_ms = not_before.checked_sub(now)?;
    if wait_ms <= 0 {
        return None;
    }
    Some(Duration::from_millis(wait_ms as u64).min(ceiling))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_error::ErrorKind;

    #[test]
    fn test_presets() {
        let default = PipelineConfig::default_pipeline();
        assert_eq!(default.backoff.max_retries, Some(5));
        assert_eq!(default.terminal, TerminalAction::DeadLetter);
        assert_eq!(default.retry_mode, RetryMode::InProcess);
        assert!(default.priority.is_none());

        assert_eq!(PipelineConfig::high_priority().priority.as_deref(), Some("HIGH"));

        let orders = PipelineConfig::order_processing();
        assert!(orders.classifier.is_fatal(&ErrorKind::InsufficientBalance));
        assert!(!orders.classifier.is_fatal(&ErrorKind::Connect));

        let dlq = PipelineConfig::dead_letter_processing();
        assert_eq!(dlq.terminal, TerminalAction::Alert);
        assert_eq!(dlq.backoff.delays().count(), 2);
    }

    #[test]
    fn test_redelivery_mode_builder() {
        let config = PipelineConfig::default_pipeline().with_redelivery_topic(".retry");
        assert_eq!(
            config.retry_mode,
            RetryMode::RedeliveryTopic {
                suffix: ".retry".to_string()
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_not_before_wait_bounds() {
        let ceiling = Duration::from_secs(30);
        let now = 1_700_000_000_000;
        assert_eq!(not_before_wait(now + 1_500, now, ceiling), Some(Duration::from_millis(1_500)));
        assert_eq!(not_before_wait(now, now, ceiling), None);
        assert_eq!(not_before_wait(now - 10, now, ceiling), None);
        assert_eq!(not_before_wait(i64::MIN, now, ceiling), None);
        assert_eq!(not_before_wait(i64::MAX, -now, ceiling), None);
        assert_eq!(not_before_wait(9_000_000_000_000_000, now, ceiling), Some(ceiling));
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let config = PipelineConfig::new(
            "broken",
            BackoffPolicy::exponential(Duration::from_secs(10), Duration::from_secs(1), 2.0, 3),
        );
        assert!(config.validate().is_err());
    }
}
