//! Dead-letter routing
//!
//! Terminally failed messages are enriched with a [`DeadLetterEnvelope`] carried
//! as `dlt-*` headers and published to the dead-letter topic of their source.
//! Publishing is retried a small fixed number of times; when the dead-letter
//! broker stays unreachable the record is spilled to durable storage, or dropped
//! with an audit entry when no spill is available.

use crate::metrics::ReliabilityMetrics;
use chrono::{DateTime, SecondsFormat, Utc};
use courier_error::{CourierError, ErrorKind, ProcessingError, Result};
use courier_resilience::BackoffPolicy;
use courier_traits::{
    Alert, AlertKind, AlertSink, DeadLetterSpill, Headers, InboundMessage, OutboundRecord,
    RecordPublisher, REDELIVERY_HEADERS,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Dead-letter header names
pub mod headers {
    /// Source topic
    pub const ORIGINAL_TOPIC: &str = "dlt-original-topic";
    /// Source partition
    pub const ORIGINAL_PARTITION: &str = "dlt-original-partition";
    /// Source offset
    pub const ORIGINAL_OFFSET: &str = "dlt-original-offset";
    /// Source broker timestamp (epoch ms)
    pub const ORIGINAL_TIMESTAMP: &str = "dlt-original-timestamp";
    /// Wire name of the failure kind
    pub const EXCEPTION_CLASS: &str = "dlt-exception-class";
    /// Failure message
    pub const EXCEPTION_MESSAGE: &str = "dlt-exception-message";
    /// When the message was dead-lettered (RFC 3339)
    pub const FAILURE_TIMESTAMP: &str = "dlt-failure-timestamp";
    /// Retries performed before dead-lettering
    pub const RETRY_ATTEMPTS: &str = "dlt-retry-attempts";
    /// Optional stack trace
    pub const STACK_TRACE: &str = "dlt-stack-trace";
    /// Optional priority marker
    pub const PRIORITY: &str = "dlt-priority";
}

// ============ Envelope ============

/// Failure metadata attached to a dead letter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEnvelope {
    /// Source topic
    pub original_topic: String,
    /// Source partition
    pub original_partition: i32,
    /// Source offset
    pub original_offset: i64,
    /// Source broker timestamp (epoch ms)
    pub original_timestamp: i64,
    /// Failure kind
    pub exception_kind: ErrorKind,
    /// Failure message
    pub exception_message: String,
    /// When the message was dead-lettered
    pub failure_timestamp: DateTime<Utc>,
    /// Retries performed before dead-lettering (0 for FATAL)
    pub retry_attempts: u32,
    /// Priority marker
    pub priority: Option<String>,
    /// Stack trace, when the pipeline includes it
    pub stack_trace: Option<String>,
}

impl DeadLetterEnvelope {
    /// Envelope for `message`, failed with `error` after `retry_attempts` retries.
    ///
    /// The original coordinates are those of the source record, also when
    /// `message` arrived through a redelivery topic.
    pub fn new(message: &InboundMessage, error: &ProcessingError, retry_attempts: u32) -> Self {
        let origin = message.origin();
        Self {
            original_topic: origin.topic,
            original_partition: origin.partition,
            original_offset: origin.offset,
            original_timestamp: origin.timestamp,
            exception_kind: error.kind().clone(),
            exception_message: error.message().to_string(),
            failure_timestamp: Utc::now(),
            retry_attempts,
            priority: None,
            stack_trace: None,
        }
    }

    /// Set the priority marker
    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    /// Attach a stack trace
    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    /// Render as `dlt-*` headers
    pub fn to_headers(&self) -> Headers {
        let mut out = Headers::new();
        out.insert(headers::ORIGINAL_TOPIC.into(), self.original_topic.clone());
        out.insert(headers::ORIGINAL_PARTITION.into(), self.original_partition.to_string());
        out.insert(headers::ORIGINAL_OFFSET.into(), self.original_offset.to_string());
        out.insert(headers::ORIGINAL_TIMESTAMP.into(), self.original_timestamp.to_string());
        out.insert(headers::EXCEPTION_CLASS.into(), self.exception_kind.class_name().to_string());
        out.insert(headers::EXCEPTION_MESSAGE.into(), self.exception_message.clone());
        out.insert(
            headers::FAILURE_TIMESTAMP.into(),
            self.failure_timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        out.insert(headers::RETRY_ATTEMPTS.into(), self.retry_attempts.to_string());
        if let Some(priority) = &self.priority {
            out.insert(headers::PRIORITY.into(), priority.clone());
        }
        if let Some(trace) = &self.stack_trace {
            out.insert(headers::STACK_TRACE.into(), trace.clone());
        }
        out
    }

    /// Parse a `dlt-*` header set, e.g. when replaying a dead letter
    pub fn from_headers(map: &Headers) -> Result<Self> {
        fn required<'a>(map: &'a Headers, name: &str) -> Result<&'a str> {
            map
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| CourierError::Serialization(format!("missing header '{}'", name)))
        }

        fn number<T: std::str::FromStr>(map: &Headers, name: &str) -> Result<T> {
            let raw = required(map, name)?;
            raw.parse().map_err(|_| {
                CourierError::Serialization(format!("header '{}' is not a number: {:?}", name, raw))
            })
        }

        let failure_raw = required(map, headers::FAILURE_TIMESTAMP)?;
        let failure_timestamp = DateTime::parse_from_rfc3339(failure_raw)
            .map_err(|e| {
                CourierError::Serialization(format!(
                    "header '{}' is not RFC 3339: {}",
                    headers::FAILURE_TIMESTAMP,
                    e
                ))
            })?
            .with_timezone(&Utc);

        Ok(Self {
            original_topic: required(map, headers::ORIGINAL_TOPIC)?.to_string(),
            original_partition: number(map, headers::ORIGINAL_PARTITION)?,
            original_offset: number(map, headers::ORIGINAL_OFFSET)?,
            original_timestamp: number(map, headers::ORIGINAL_TIMESTAMP)?,
            exception_kind: ErrorKind::from_class_name(required(map, headers::EXCEPTION_CLASS)?),
            exception_message: required(map, headers::EXCEPTION_MESSAGE)?.to_string(),
            failure_timestamp,
            retry_attempts: number(map, headers::RETRY_ATTEMPTS)?,
            priority: map.get(headers::PRIORITY).cloned(),
            stack_trace: map.get(headers::STACK_TRACE).cloned(),
        })
    }
}

// ============ Topic Resolution ============

/// Static `topic -> dead-letter topic` table with a suffix fallback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTopics {
    overrides: BTreeMap<String, String>,
    suffix: String,
}

impl Default for DeadLetterTopics {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl DeadLetterTopics {
    /// Table with the `.dlq` suffix fallback
    pub fn new(overrides: BTreeMap<String, String>) -> Self {
        Self {
            overrides,
            suffix: ".dlq".to_string(),
        }
    }

    /// Change the fallback suffix
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Add one override
    pub fn with_override(mut self, topic: impl Into<String>, dlq: impl Into<String>) -> Self {
        self.overrides.insert(topic.into(), dlq.into());
        self
    }

    /// Dead-letter topic of `topic`
    pub fn resolve(&self, topic: &str) -> String {
        match self.overrides.get(topic) {
            Some(dlq) => dlq.clone(),
            None => format!("{}{}", topic, self.suffix),
        }
    }
}

// ============ Router ============

/// What happened to a dead letter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterOutcome {
    /// Published to the dead-letter topic
    Published {
        /// Dead-letter topic
        topic: String,
    },
    /// Publish exhausted, written to the spill
    Spilled {
        /// Dead-letter topic that was unreachable
        topic: String,
    },
    /// Publish exhausted and no spill succeeded
    Dropped {
        /// Dead-letter topic that was unreachable
        topic: String,
    },
}

impl DeadLetterOutcome {
    /// The resolved dead-letter topic
    pub fn topic(&self) -> &str {
        match self {
            DeadLetterOutcome::Published { topic }
            | DeadLetterOutcome::Spilled { topic }
            | DeadLetterOutcome::Dropped { topic } => topic,
        }
    }

    /// True if the record reached the dead-letter topic
    pub fn is_published(&self) -> bool {
        matches!(self, DeadLetterOutcome::Published { .. })
    }
}

/// Resolves, enriches and publishes dead letters
pub struct DeadLetterRouter {
    topics: DeadLetterTopics,
    publisher: Arc<dyn RecordPublisher>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<ReliabilityMetrics>,
    spill: Option<Arc<dyn DeadLetterSpill>>,
    publish_backoff: BackoffPolicy,
}

impl std::fmt::Debug for DeadLetterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterRouter")
            .field("topics", &self.topics)
            .field("publish_backoff", &self.publish_backoff)
            .field("spill", &self.spill.is_some())
            .finish()
    }
}

impl DeadLetterRouter {
    /// Router publishing through `publisher`, three attempts 200ms apart
    pub fn new(
        topics: DeadLetterTopics,
        publisher: Arc<dyn RecordPublisher>,
        alerts: Arc<dyn AlertSink>,
        metrics: Arc<ReliabilityMetrics>,
    ) -> Self {
        Self {
            topics,
            publisher,
            alerts,
            metrics,
            spill: None,
            publish_backoff: BackoffPolicy::fixed(Duration::from_millis(200), 2),
        }
    }

    /// Last-resort storage for records that could not be published
    pub fn with_spill(mut self, spill: Arc<dyn DeadLetterSpill>) -> Self {
        self.spill = Some(spill);
        self
    }

    /// Publish attempts (at least 1) and the fixed delay between them
    pub fn with_publish_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.publish_backoff = BackoffPolicy::fixed(delay, attempts.max(1) - 1);
        self
    }

    /// Topic table
    pub fn topics(&self) -> &DeadLetterTopics {
        &self.topics
    }

    pub(crate) fn publisher(&self) -> &Arc<dyn RecordPublisher> {
        &self.publisher
    }

    pub(crate) fn alerts(&self) -> &Arc<dyn AlertSink> {
        &self.alerts
    }

    pub(crate) fn metrics(&self) -> &Arc<ReliabilityMetrics> {
        &self.metrics
    }

    /// Dead-letter topic of `topic`
    pub fn resolve_topic(&self, topic: &str) -> String {
        self.topics.resolve(topic)
    }

    /// Publish `message` with `envelope` to the dead-letter topic of the
    /// envelope's original topic.
    ///
    /// Never fails: exhaustion is escalated, spilled or dropped, and reported in
    /// the returned outcome. The caller commits the source offset in every case.
    pub async fn route(&self, message: &InboundMessage, envelope: &DeadLetterEnvelope) -> DeadLetterOutcome {
        let topic = self.resolve_topic(&envelope.original_topic);
        let mut record = OutboundRecord::forward(message, topic.clone());
        for name in REDELIVERY_HEADERS {
            record.headers.remove(name);
        }
        record.headers.extend(envelope.to_headers());

        let mut delays = self.publish_backoff.delays();
        let mut attempt = 1u32;
        let last_error = loop {
            match self.publisher.publish(record.clone()).await {
                Ok(()) => {
                    self.metrics.record_dlq_sent();
                    tracing::warn!(
                        dlq_topic = %topic,
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        exception = %envelope.exception_kind,
                        retry_attempts = envelope.retry_attempts,
                        "Message dead-lettered"
                    );
                    return DeadLetterOutcome::Published { topic };
                }
                Err(e) => {
                    tracing::warn!(dlq_topic = %topic, attempt, error = %e, "Dead-letter publish failed");
                    match delays.next() {
                        Some(delay) => {
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => break e,
                    }
                }
            }
        };

        self.metrics.record_dlq_publish_failure();
        tracing::error!(
            severity = "CRITICAL",
            dlq_topic = %topic,
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            attempts = attempt,
            error = %last_error,
            "Dead-letter publish exhausted"
        );
        self.alerts
            .raise(
                Alert::critical(
                    AlertKind::DeadLetterPublishFailed,
                    format!("dead-letter topic {} unreachable", topic),
                )
                .with_context("dlqTopic", &topic)
                .with_context("messageId", message.message_id())
                .with_context("error", &last_error),
            )
            .await;

        if let Some(spill) = &self.spill {
            match spill.spill(&record).await {
                Ok(()) => {
                    self.metrics.record_spilled();
                    tracing::warn!(dlq_topic = %topic, message_id = %message.message_id(), "Dead letter spilled");
                    return DeadLetterOutcome::Spilled { topic };
                }
                Err(e) => {
                    tracing::error!(severity = "CRITICAL", dlq_topic = %topic, error = %e, "Dead-letter spill failed");
                }
            }
        }

        self.metrics.record_dropped();
        tracing::error!(
            severity = "CRITICAL",
            audit = true,
            dlq_topic = %topic,
            message_id = %message.message_id(),
            key = ?message.key,
            exception = %envelope.exception_kind,
            exception_message = %envelope.exception_message,
            "Dead letter dropped"
        );
        self.alerts
            .raise(
                Alert::critical(AlertKind::MessageDropped, format!("dead letter for {} dropped", topic))
                    .with_context("messageId", message.message_id()),
            )
            .await;
        DeadLetterOutcome::Dropped { topic }
    }
}

// ============ Spill ============

/// JSON-lines file spill, one record per line
#[derive(Debug)]
pub struct FileSpill {
    path: PathBuf,
    lock: Mutex<()>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpillLine {
    spilled_at: DateTime<Utc>,
    record: OutboundRecord,
}

impl FileSpill {
    /// Spill appending to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Spill file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every spilled record back
    pub async fn read_all(&self) -> Result<Vec<OutboundRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str::<SpillLine>(line)?.record))
            .collect()
    }
}

#[async_trait::async_trait]
impl DeadLetterSpill for FileSpill {
    async fn spill(&self, record: &OutboundRecord) -> Result<()> {
        let mut line = serde_json::to_string(&SpillLine {
            spilled_at: Utc::now(),
            record: record.clone(),
        })?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> InboundMessage {
        InboundMessage::new("smm.order.processing", 2, 77, b"{\"id\":1}".to_vec())
            .with_key("order-1")
            .with_timestamp(1_700_000_000_000)
    }

    #[test]
    fn test_resolve_topic() {
        let topics = DeadLetterTopics::default()
            .with_override("smm.offer.assignment.events", "smm.offer.assignments.dlq");
        assert_eq!(topics.resolve("smm.order.processing"), "smm.order.processing.dlq");
        assert_eq!(topics.resolve("smm.offer.assignment.events"), "smm.offer.assignments.dlq");
        assert_eq!(topics.clone().with_suffix(".DLT").resolve("a"), "a.DLT");
    }

    #[test]
    fn test_envelope_headers() {
        let error = ProcessingError::new(ErrorKind::IllegalArgument, "quantity must be positive");
        let envelope = DeadLetterEnvelope::new(&message(), &error, 0);
        let h = envelope.to_headers();

        assert_eq!(h[headers::ORIGINAL_TOPIC], "smm.order.processing");
        assert_eq!(h[headers::ORIGINAL_PARTITION], "2");
        assert_eq!(h[headers::ORIGINAL_OFFSET], "77");
        assert_eq!(h[headers::ORIGINAL_TIMESTAMP], "1700000000000");
        assert_eq!(h[headers::EXCEPTION_CLASS], "IllegalArgumentException");
        assert_eq!(h[headers::EXCEPTION_MESSAGE], "quantity must be positive");
        assert_eq!(h[headers::RETRY_ATTEMPTS], "0");
        assert!(!h.contains_key(headers::PRIORITY));
        assert!(!h.contains_key(headers::STACK_TRACE));
    }

    #[test]
    fn test_envelope_from_headers() {
        let error = ProcessingError::new(ErrorKind::Connect, "refused");
        let envelope = DeadLetterEnvelope::new(&message(), &error, 5)
            .with_priority("HIGH")
            .with_stack_trace("at connect()");

        let parsed = DeadLetterEnvelope::from_headers(&envelope.to_headers()).unwrap();
        assert_eq!(parsed.original_offset, 77);
        assert_eq!(parsed.exception_kind, ErrorKind::Connect);
        assert_eq!(parsed.retry_attempts, 5);
        assert_eq!(parsed.priority.as_deref(), Some("HIGH"));
        assert_eq!(parsed.stack_trace.as_deref(), Some("at connect()"));
        assert_eq!(
            parsed.failure_timestamp.timestamp_millis(),
            envelope.failure_timestamp.timestamp_millis()
        );
    }

    #[test]
    fn test_from_headers_rejects_incomplete() {
        let mut h = DeadLetterEnvelope::new(&message(), &ProcessingError::new(ErrorKind::Runtime, "x"), 1)
            .to_headers();
        h.insert(headers::ORIGINAL_OFFSET.into(), "seventy".into());
        assert!(matches!(
            DeadLetterEnvelope::from_headers(&h),
            Err(CourierError::Serialization(_))
        ));

        h.remove(headers::ORIGINAL_TOPIC);
        assert!(DeadLetterEnvelope::from_headers(&h).is_err());
    }

    #[tokio::test]
    async fn test_file_spill_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let spill = FileSpill::new(dir.path().join("dead-letters.jsonl"));
        assert!(spill.read_all().await.unwrap().is_empty());

        let first = OutboundRecord::new("a.dlq", b"one".to_vec()).with_header("k", "v");
        let second = OutboundRecord::new("b.dlq", b"two".to_vec());
        spill.spill(&first).await.unwrap();
        spill.spill(&second).await.unwrap();

        assert_eq!(spill.read_all().await.unwrap(), vec![first, second]);
    }
}
