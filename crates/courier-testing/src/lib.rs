//! # Courier Testing Infrastructure
//!
//! In-memory fakes for every collaborator trait plus property-test strategies:
//!
//! - [`RecordingPublisher`] - captures published records, can fail on demand
//! - [`RecordingConsumer`] - captures commits and seeks
//! - [`RecordingAlerts`] - captures raised alerts
//! - [`MemorySpill`] - in-memory dead-letter spill
//! - [`ScriptedHandler`] - replays a queue of per-attempt outcomes
//! - [`VecSource`] - serves pre-built batches
//! - [`RecordingDelay`] - records every retry delay before sleeping it
//!
//! ## Usage
//!
//! ```rust,ignore
//! use courier_testing::*;
//!
//! let handler = ScriptedHandler::new([
//!     Err(ProcessingError::new(ErrorKind::Connect, "refused")),
//!     Ok(()),
//! ]);
//! let publisher = RecordingPublisher::failing_first(2);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use courier_error::{CourierError, ErrorKind, ProcessingError, Result};
use courier_traits::{
    Alert, AlertKind, AlertSink, ConsumerControl, DeadLetterSpill, DelaySource, Headers,
    InboundMessage, MessageHandler, MessageSource, OutboundRecord, ProcessingContext,
    RecordPublisher, TopicPartition,
};
use proptest::prelude::*;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Publisher
// ============================================================================

/// Publisher that records every successful publish
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    records: Mutex<Vec<OutboundRecord>>,
    attempts: AtomicU32,
    fail_first: AtomicU32,
    fail_all: AtomicBool,
}

impl RecordingPublisher {
    /// Always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the first `n` publishes, then succeeds
    pub fn failing_first(n: u32) -> Self {
        let publisher = Self::default();
        publisher.fail_first.store(n, Ordering::SeqCst);
        publisher
    }

    /// Fails every publish
    pub fn failing() -> Self {
        let publisher = Self::default();
        publisher.fail_all.store(true, Ordering::SeqCst);
        publisher
    }

    /// Toggle failing every publish
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Publish calls, failed ones included
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Records published so far
    pub fn records(&self) -> Vec<OutboundRecord> {
        lock(&self.records).clone()
    }

    /// Records published to `topic`
    pub fn records_for(&self, topic: &str) -> Vec<OutboundRecord> {
        lock(&self.records)
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RecordPublisher for RecordingPublisher {
    async fn publish(&self, record: OutboundRecord) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(CourierError::publish(&record.topic, "broker unreachable"));
        }
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(CourierError::publish(&record.topic, "broker unreachable"));
        }
        lock(&self.records).push(record);
        Ok(())
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Consumer control that records commits and seeks
#[derive(Debug, Default)]
pub struct RecordingConsumer {
    commits: Mutex<Vec<BTreeMap<TopicPartition, i64>>>,
    seeks: Mutex<Vec<(TopicPartition, i64)>>,
    fail_commits: AtomicBool,
}

impl RecordingConsumer {
    /// Commits always succeed
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle failing every commit
    pub fn set_failing_commits(&self, failing: bool) {
        self.fail_commits.store(failing, Ordering::SeqCst);
    }

    /// Every successful commit, in order
    pub fn commits(&self) -> Vec<BTreeMap<TopicPartition, i64>> {
        lock(&self.commits).clone()
    }

    /// Number of successful commits
    pub fn commit_count(&self) -> usize {
        lock(&self.commits).len()
    }

    /// Latest committed next-offset of `partition`
    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        lock(&self.commits)
            .iter()
            .rev()
            .find_map(|commit| commit.get(partition).copied())
    }

    /// Committed next-offsets of `partition`, in commit order
    pub fn committed_offsets(&self, partition: &TopicPartition) -> Vec<i64> {
        lock(&self.commits)
            .iter()
            .filter_map(|commit| commit.get(partition).copied())
            .collect()
    }

    /// Every seek, in order
    pub fn seeks(&self) -> Vec<(TopicPartition, i64)> {
        lock(&self.seeks).clone()
    }
}

#[async_trait]
impl ConsumerControl for RecordingConsumer {
    async fn commit_sync(&self, offsets: &BTreeMap<TopicPartition, i64>) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(CourierError::Commit("group coordinator unavailable".to_string()));
        }
        lock(&self.commits).push(offsets.clone());
        Ok(())
    }

    async fn seek(&self, partition: &TopicPartition, offset: i64) -> Result<()> {
        lock(&self.seeks).push((partition.clone(), offset));
        Ok(())
    }
}

// ============================================================================
// Alerts & Spill
// ============================================================================

/// Alert sink that records every alert
#[derive(Debug, Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts raised so far
    pub fn alerts(&self) -> Vec<Alert> {
        lock(&self.alerts).clone()
    }

    /// Alerts of one kind
    pub fn of_kind(&self, kind: AlertKind) -> Vec<Alert> {
        lock(&self.alerts)
            .iter()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn raise(&self, alert: Alert) {
        lock(&self.alerts).push(alert);
    }
}

/// In-memory spill
#[derive(Debug, Default)]
pub struct MemorySpill {
    records: Mutex<Vec<OutboundRecord>>,
    fail: AtomicBool,
}

impl MemorySpill {
    /// Spill that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Spill that rejects everything
    pub fn failing() -> Self {
        let spill = Self::default();
        spill.fail.store(true, Ordering::SeqCst);
        spill
    }

    /// Records spilled so far
    pub fn records(&self) -> Vec<OutboundRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl DeadLetterSpill for MemorySpill {
    async fn spill(&self, record: &OutboundRecord) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CourierError::Io("disk full".to_string()));
        }
        lock(&self.records).push(record.clone());
        Ok(())
    }
}

// ============================================================================
// Handler, Source & Delay
// ============================================================================

/// One recorded handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerCall {
    /// `{topic}-{partition}-{offset}`
    pub message_id: String,
    /// Attempt from the processing context
    pub attempt: u32,
    /// When the handler was entered
    pub at: Instant,
}

/// Handler replaying a queue of outcomes, one per invocation.
///
/// Once the queue is empty every call returns the fallback outcome.
#[derive(Debug)]
pub struct ScriptedHandler {
    script: Mutex<VecDeque<std::result::Result<(), ProcessingError>>>,
    fallback: std::result::Result<(), ProcessingError>,
    latency: Duration,
    calls: Mutex<Vec<HandlerCall>>,
}

impl ScriptedHandler {
    /// Replays `outcomes`, then succeeds
    pub fn new(outcomes: impl IntoIterator<Item = std::result::Result<(), ProcessingError>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            fallback: Ok(()),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always succeeds
    pub fn succeeding() -> Self {
        Self::new([])
    }

    /// Always fails with `kind`
    pub fn failing(kind: ErrorKind, message: &str) -> Self {
        Self::new([]).with_fallback(Err(ProcessingError::new(kind, message)))
    }

    /// Outcome once the script is exhausted
    pub fn with_fallback(mut self, fallback: std::result::Result<(), ProcessingError>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Time each invocation takes
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Invocations so far
    pub fn calls(&self) -> Vec<HandlerCall> {
        lock(&self.calls).clone()
    }

    /// Number of invocations
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, ctx: &ProcessingContext<'_>) -> std::result::Result<(), ProcessingError> {
        lock(&self.calls).push(HandlerCall {
            message_id: ctx.message.message_id(),
            attempt: ctx.attempt,
            at: Instant::now(),
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = lock(&self.script).pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Source serving queued batches; empty polls wait out the timeout
#[derive(Debug, Default)]
pub struct VecSource {
    batches: Mutex<VecDeque<Vec<InboundMessage>>>,
}

impl VecSource {
    /// Source serving `batches` in order
    pub fn new(batches: impl IntoIterator<Item = Vec<InboundMessage>>) -> Self {
        Self {
            batches: Mutex::new(batches.into_iter().collect()),
        }
    }

    /// Queue another batch
    pub fn push(&self, batch: Vec<InboundMessage>) {
        lock(&self.batches).push_back(batch);
    }

    /// Batches not yet served
    pub fn remaining(&self) -> usize {
        lock(&self.batches).len()
    }
}

#[async_trait]
impl MessageSource for VecSource {
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Vec<InboundMessage>> {
        let batch = {
            let mut batches = lock(&self.batches);
            let split = batches.front().is_some_and(|front| front.len() > max_records);
            if split {
                batches
                    .front_mut()
                    .map(|front| front.drain(..max_records).collect::<Vec<_>>())
            } else {
                batches.pop_front()
            }
        };
        match batch {
            Some(batch) => Ok(batch),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }
}

/// Delay source recording each delay before sleeping it on tokio's clock
#[derive(Debug, Default)]
pub struct RecordingDelay {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingDelay {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far
    pub fn delays(&self) -> Vec<Duration> {
        lock(&self.delays).clone()
    }
}

#[async_trait]
impl DelaySource for RecordingDelay {
    async fn delay(&self, duration: Duration) {
        lock(&self.delays).push(duration);
        tokio::time::sleep(duration).await;
    }
}

// ============================================================================
// Builders
// ============================================================================

/// `count` consecutive messages on one partition starting at `first_offset`
pub fn messages(topic: &str, partition: i32, first_offset: i64, count: usize) -> Vec<InboundMessage> {
    (0..count)
        .map(|i| {
            let offset = first_offset + i as i64;
            InboundMessage::new(topic, partition, offset, format!("{{\"seq\":{}}}", offset).into_bytes())
                .with_key(format!("key-{}", offset))
        })
        .collect()
}

// ============================================================================
// Property-Based Testing Strategies
// ============================================================================

/// Any error kind, custom names included
pub fn error_kind() -> impl Strategy<Value = ErrorKind> {
    prop_oneof![
        Just(ErrorKind::Connect),
        Just(ErrorKind::Timeout),
        Just(ErrorKind::ConnectionReset),
        Just(ErrorKind::ServiceUnavailable),
        Just(ErrorKind::RateLimited),
        Just(ErrorKind::TransientDataAccess),
        Just(ErrorKind::Deserialization),
        Just(ErrorKind::JsonParse),
        Just(ErrorKind::JsonMapping),
        Just(ErrorKind::NumberFormat),
        Just(ErrorKind::ClassCast),
        Just(ErrorKind::IllegalArgument),
        Just(ErrorKind::UserValidation),
        Just(ErrorKind::OrderValidation),
        Just(ErrorKind::ServiceNotFound),
        Just(ErrorKind::UserNotFound),
        Just(ErrorKind::InsufficientBalance),
        Just(ErrorKind::DataIntegrityViolation),
        Just(ErrorKind::ConstraintViolation),
        Just(ErrorKind::Runtime),
        "Custom[A-Z][a-z]{1,12}Exception".prop_map(ErrorKind::Custom),
    ]
}

/// Topic names following `{domain}.{entity}.{action}`
pub fn topic_name() -> impl Strategy<Value = String> {
    "[a-z]{2,8}\\.[a-z]{2,10}\\.[a-z]{2,10}"
}

/// Arbitrary string headers
pub fn headers() -> impl Strategy<Value = Headers> {
    prop::collection::btree_map("[a-z][a-z0-9-]{0,15}", "[ -~]{0,32}", 0..6)
}

/// Inbound messages with arbitrary coordinates, payload and headers
pub fn inbound_message() -> impl Strategy<Value = InboundMessage> {
    (
        topic_name(),
        0..64i32,
        0..i64::MAX / 2,
        prop::collection::vec(any::<u8>(), 0..256),
        headers(),
        any::<i64>(),
    )
        .prop_map(|(topic, partition, offset, payload, headers, timestamp)| {
            let mut message = InboundMessage::new(topic, partition, offset, payload).with_timestamp(timestamp);
            message.headers = headers;
            message
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publisher_fails_first_n() {
        let publisher = RecordingPublisher::failing_first(2);
        let record = OutboundRecord::new("a.dlq", b"x".to_vec());
        assert!(publisher.publish(record.clone()).await.is_err());
        assert!(publisher.publish(record.clone()).await.is_err());
        assert!(publisher.publish(record.clone()).await.is_ok());
        assert_eq!(publisher.attempts(), 3);
        assert_eq!(publisher.records_for("a.dlq").len(), 1);
    }

    #[tokio::test]
    async fn test_consumer_records_commits() {
        let consumer = RecordingConsumer::new();
        let tp = TopicPartition::new("orders", 0);
        consumer.commit_sync(&BTreeMap::from([(tp.clone(), 3)])).await.unwrap();
        consumer.commit_sync(&BTreeMap::from([(tp.clone(), 4)])).await.unwrap();
        assert_eq!(consumer.committed(&tp), Some(4));
        assert_eq!(consumer.committed_offsets(&tp), vec![3, 4]);

        consumer.set_failing_commits(true);
        assert!(consumer.commit_sync(&BTreeMap::from([(tp.clone(), 5)])).await.is_err());
        assert_eq!(consumer.commit_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_handler_replays_then_falls_back() {
        let handler = ScriptedHandler::new([Err(ProcessingError::new(ErrorKind::Connect, "refused"))]);
        let message = InboundMessage::new("orders", 0, 1, Vec::new());
        let ctx = ProcessingContext::first(&message);
        assert!(handler.handle(&ctx).await.is_err());
        assert!(handler.handle(&ctx.next_attempt()).await.is_ok());

        let calls = handler.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].attempt, 2);
        assert_eq!(calls[0].message_id, "orders-0-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_vec_source_splits_batches() {
        let source = VecSource::new([messages("orders", 0, 0, 5)]);
        assert_eq!(source.poll(3, Duration::from_millis(10)).await.unwrap().len(), 3);
        assert_eq!(source.poll(3, Duration::from_millis(10)).await.unwrap().len(), 2);
        assert!(source.poll(3, Duration::from_millis(10)).await.unwrap().is_empty());
        assert_eq!(source.remaining(), 0);
    }

    proptest! {
        #[test]
        fn prop_error_kind_class_name_roundtrip(kind in error_kind()) {
            prop_assert_eq!(ErrorKind::from_class_name(kind.class_name()), kind);
        }

        #[test]
        fn prop_message_id_is_stable(message in inbound_message()) {
            let id = message.message_id();
            let expected_suffix = format!("-{}-{}", message.partition, message.offset);
            prop_assert!(id.ends_with(&expected_suffix));
            prop_assert!(id.starts_with(&message.topic));
        }
    }
}
