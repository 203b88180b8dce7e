//! # Courier Traits
//!
//! Message model and collaborator traits for the Courier reliability layer.
//!
//! The broker is treated as an abstract ordered, partitioned, at-least-once log.
//! Everything that touches it (polling, committing, publishing) is expressed as a
//! trait here so the reliability layer can be wired to any client.
//!
//! ## Core Traits
//!
//! - [`MessageHandler`] - business logic invoked once per delivery attempt
//! - [`RecordPublisher`] - shared, thread-safe publish client
//! - [`ConsumerControl`] - synchronous offset commits and seeks
//! - [`MessageSource`] - polls batches from the assigned partitions
//! - [`AlertSink`] - operator alert hook
//! - [`DeadLetterSpill`] - last-resort durable storage for undeliverable dead letters
//! - [`DelaySource`] - how a retry waits (in-process sleep by default)
//!
//! ## Example
//!
//! ```ignore
//! use courier_traits::prelude::*;
//!
//! struct OrderHandler;
//!
//! #[async_trait]
//! impl MessageHandler for OrderHandler {
//!     async fn handle(&self, ctx: &ProcessingContext<'_>) -> Result<(), ProcessingError> {
//!         let order: Order = serde_json::from_slice(&ctx.message.payload)
//!             .map_err(|e| ProcessingError::new(ErrorKind::JsonParse, e.to_string()))?;
//!         create_order(order).await
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use courier_error::{ProcessingError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// String-keyed record headers.
pub type Headers = BTreeMap<String, String>;

/// Header carrying the delivery attempt of a record re-published to a redelivery topic.
pub const DELIVERY_ATTEMPT_HEADER: &str = "courier-delivery-attempt";

/// Header carrying the earliest processing time (epoch ms) of a redelivered record.
pub const NOT_BEFORE_HEADER: &str = "courier-not-before";

/// Header carrying the source topic of a redelivered record.
pub const ORIGIN_TOPIC_HEADER: &str = "courier-origin-topic";

/// Header carrying the source partition of a redelivered record.
pub const ORIGIN_PARTITION_HEADER: &str = "courier-origin-partition";

/// Header carrying the source offset of a redelivered record.
pub const ORIGIN_OFFSET_HEADER: &str = "courier-origin-offset";

/// Header carrying the source broker timestamp (epoch ms) of a redelivered record.
pub const ORIGIN_TIMESTAMP_HEADER: &str = "courier-origin-timestamp";

/// Every header the redelivery path stamps on a record.
pub const REDELIVERY_HEADERS: [&str; 6] = [
    DELIVERY_ATTEMPT_HEADER,
    NOT_BEFORE_HEADER,
    ORIGIN_TOPIC_HEADER,
    ORIGIN_PARTITION_HEADER,
    ORIGIN_OFFSET_HEADER,
    ORIGIN_TIMESTAMP_HEADER,
];

// ============ Data Model ============

/// A topic and partition pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

impl TopicPartition {
    /// Creates a new topic partition
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Coordinates of the record a message was first consumed as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOrigin {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Source offset
    pub offset: i64,
    /// Source broker timestamp, epoch milliseconds
    pub timestamp: i64,
}

/// A record delivered from the broker.
///
/// Immutable per delivery attempt. The local retry loop tracks attempts in
/// [`ProcessingContext`] rather than mutating the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Record key
    pub key: Option<String>,
    /// Raw payload
    pub payload: Vec<u8>,
    /// Record headers
    pub headers: Headers,
    /// Broker timestamp, epoch milliseconds
    pub timestamp: i64,
    /// Delivery attempt the record arrived with (1 for a first delivery)
    pub delivery_attempt: u32,
}

impl InboundMessage {
    /// Creates a first-delivery message
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: payload.into(),
            headers: Headers::new(),
            timestamp: 0,
            delivery_attempt: 1,
        }
    }

    /// Set the record key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header. The delivery-attempt header also updates `delivery_attempt`.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        if name == DELIVERY_ATTEMPT_HEADER {
            if let Ok(attempt) = value.parse::<u32>() {
                self.delivery_attempt = attempt.max(1);
            }
        }
        self.headers.insert(name, value);
        self
    }

    /// Set the broker timestamp (epoch milliseconds)
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The partition this record came from
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Stable identifier of this record: `{topic}-{partition}-{offset}`
    pub fn message_id(&self) -> String {
        format!("{}-{}-{}", self.topic, self.partition, self.offset)
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Where this record was first consumed.
    ///
    /// A redelivered record carries its source coordinates in the
    /// `courier-origin-*` headers; anything else is its own origin. The origin
    /// headers are only trusted as a complete, well-formed set.
    pub fn origin(&self) -> RecordOrigin {
        self.stamped_origin().unwrap_or_else(|| RecordOrigin {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            timestamp: self.timestamp,
        })
    }

    fn stamped_origin(&self) -> Option<RecordOrigin> {
        Some(RecordOrigin {
            topic: self.header(ORIGIN_TOPIC_HEADER)?.to_string(),
            partition: self.header(ORIGIN_PARTITION_HEADER)?.parse().ok()?,
            offset: self.header(ORIGIN_OFFSET_HEADER)?.parse().ok()?,
            timestamp: self.header(ORIGIN_TIMESTAMP_HEADER)?.parse().ok()?,
        })
    }
}

/// A record to be published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRecord {
    /// Destination topic
    pub topic: String,
    /// Record key
    pub key: Option<String>,
    /// Raw payload
    pub payload: Vec<u8>,
    /// Record headers
    pub headers: Headers,
}

impl OutboundRecord {
    /// Creates a record without key or headers
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    /// Copies key, payload and headers of an inbound message onto a new destination
    pub fn forward(message: &InboundMessage, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: message.key.clone(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Per-attempt processing context handed to a [`MessageHandler`].
///
/// Carries the processing-start instant explicitly through the call chain.
#[derive(Debug, Clone)]
pub struct ProcessingContext<'a> {
    /// The message being processed
    pub message: &'a InboundMessage,
    /// Attempt number within the local retry loop, starting at 1
    pub attempt: u32,
    /// When processing of this message started (first attempt)
    pub started_at: Instant,
}

impl<'a> ProcessingContext<'a> {
    /// Context for the first attempt, starting now
    pub fn first(message: &'a InboundMessage) -> Self {
        Self {
            message,
            attempt: 1,
            started_at: Instant::now(),
        }
    }

    /// Context for the next attempt of the same message
    pub fn next_attempt(&self) -> Self {
        Self {
            message: self.message,
            attempt: self.attempt + 1,
            started_at: self.started_at,
        }
    }

    /// Time since processing of this message started
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// True if this is a retry rather than the first attempt
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}

// ============ Alerts ============

/// Severity of an operator alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    /// Needs attention, processing continues
    Warning,
    /// Infrastructure-critical, manual intervention likely
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Warning => write!(f, "WARNING"),
            AlertSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Dead-letter publish failed after local retries
    DeadLetterPublishFailed,
    /// A message taken from a dead-letter topic failed again
    DeadLetterProcessingFailed,
    /// A dead letter could not be published nor spilled
    MessageDropped,
    /// Partitions were lost without a graceful revoke
    PartitionsLost,
    /// Rebalances exceeded the configured rate
    RebalanceStorm,
}

/// An operator alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Severity
    pub severity: AlertSeverity,
    /// Alert kind
    pub kind: AlertKind,
    /// Human-readable summary
    pub message: String,
    /// Structured context (topic, partition, offset, group...)
    pub context: BTreeMap<String, String>,
}

impl Alert {
    /// Creates a critical alert
    pub fn critical(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Critical,
            kind,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Creates a warning alert
    pub fn warning(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Warning,
            kind,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Add a context entry
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }
}

// ============ Collaborator Traits ============

/// Business logic invoked once per delivery attempt.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process the message. Errors are classified by the pipeline.
    async fn handle(&self, ctx: &ProcessingContext<'_>) -> std::result::Result<(), ProcessingError>;
}

/// Shared, thread-safe publish client.
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    /// Publish a record and wait for the broker acknowledgement
    async fn publish(&self, record: OutboundRecord) -> Result<()>;
}

/// Consumer-side offset control.
#[async_trait]
pub trait ConsumerControl: Send + Sync {
    /// Synchronously commit the given next-offsets
    async fn commit_sync(&self, offsets: &BTreeMap<TopicPartition, i64>) -> Result<()>;

    /// Move the fetch position of a partition
    async fn seek(&self, partition: &TopicPartition, offset: i64) -> Result<()>;
}

/// Polls records from the currently assigned partitions.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Poll up to `max_records`, waiting at most `timeout`. An empty batch is not an error.
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Vec<InboundMessage>>;
}

/// Operator alert hook.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Raise an alert. Must not fail the calling path.
    async fn raise(&self, alert: Alert);
}

/// Last-resort durable storage for dead letters that could not be published.
#[async_trait]
pub trait DeadLetterSpill: Send + Sync {
    /// Persist the fully-enriched dead-letter record
    async fn spill(&self, record: &OutboundRecord) -> Result<()>;
}

/// Source of retry delays.
///
/// In-process pipelines block the owning worker for the computed delay.
#[async_trait]
pub trait DelaySource: Send + Sync {
    /// Wait for `duration`
    async fn delay(&self, duration: Duration);
}

/// [`DelaySource`] backed by `tokio::time::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDelay;

#[async_trait]
impl DelaySource for TokioDelay {
    async fn delay(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Convenient re-exports for handler implementations.
pub mod prelude {
    pub use crate::{
        Alert, AlertKind, AlertSeverity, AlertSink, ConsumerControl, DeadLetterSpill, DelaySource, Headers,
        InboundMessage, MessageHandler, MessageSource, OutboundRecord, ProcessingContext,
        RecordOrigin, RecordPublisher, TopicPartition,
    };
    pub use async_trait::async_trait;
    pub use courier_error::{ErrorKind, ProcessingError};
}
