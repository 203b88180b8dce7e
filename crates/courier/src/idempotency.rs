//! Processed-message store for at-least-once redelivery
//!
//! Records which message ids were fully processed so a redelivered record (after a
//! crash between processing and commit, or a rebalance) can be skipped.
//!
//! Expired ids are swept every [`DEFAULT_PURGE_EVERY`] marks, so memory stays
//! proportional to the ids marked within one TTL.

use courier_traits::InboundMessage;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Marks between two sweeps of expired ids
pub const DEFAULT_PURGE_EVERY: u64 = 1024;

/// In-memory TTL store of processed message ids
#[derive(Debug)]
pub struct IdempotencyStore {
    processed: DashMap<String, Instant>,
    ttl: Duration,
    purge_every: u64,
    marks: AtomicU64,
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

impl IdempotencyStore {
    /// Store forgetting ids after `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            processed: DashMap::new(),
            ttl,
            purge_every: DEFAULT_PURGE_EVERY,
            marks: AtomicU64::new(0),
        }
    }

    /// Sweep expired ids every `marks` marks (at least 1)
    pub fn with_purge_every(mut self, marks: u64) -> Self {
        self.purge_every = marks.max(1);
        self
    }

    /// `{topic}-{partition}-{offset}`
    pub fn message_id(topic: &str, partition: i32, offset: i64) -> String {
        format!("{}-{}-{}", topic, partition, offset)
    }

    /// Id of an inbound message
    pub fn id_of(message: &InboundMessage) -> String {
        message.message_id()
    }

    fn is_live(&self, processed_at: Instant) -> bool {
        processed_at.elapsed() < self.ttl
    }

    /// True if `id` was processed within the TTL
    pub fn is_duplicate(&self, id: &str) -> bool {
        self.processed
            .get(id)
            .map(|entry| self.is_live(*entry.value()))
            .unwrap_or(false)
    }

    /// Record `id` as processed now
    pub fn mark_processed(&self, id: impl Into<String>) {
        self.processed.insert(id.into(), Instant::now());
        self.after_mark();
    }

    /// Atomically test and mark. Returns true if `id` was already processed.
    pub fn check_and_mark(&self, id: impl Into<String>) -> bool {
        let seen = match self.processed.entry(id.into()) {
            Entry::Occupied(mut entry) => {
                if self.is_live(*entry.get()) {
                    true
                } else {
                    entry.insert(Instant::now());
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                false
            }
        };
        if !seen {
            self.after_mark();
        }
        seen
    }

    fn after_mark(&self) {
        let marks = self.marks.fetch_add(1, Ordering::Relaxed) + 1;
        if marks % self.purge_every == 0 {
            self.purge_expired();
        }
    }

    /// Forget `id`
    pub fn remove(&self, id: &str) -> bool {
        self.processed.remove(id).is_some()
    }

    /// Drop expired ids, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.processed.len();
        let ttl = self.ttl;
        self.processed.retain(|_, processed_at| processed_at.elapsed() < ttl);
        let purged = before.saturating_sub(self.processed.len());
        if purged > 0 {
            tracing::debug!(purged, "Purged expired idempotency entries");
        }
        purged
    }

    /// Ids currently held
    pub fn len(&self) -> usize {
        self.processed.len()
    }

    /// True if no ids are held
    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_format() {
        assert_eq!(IdempotencyStore::message_id("smm.order.processing", 1, 9), "smm.order.processing-1-9");
        let msg = InboundMessage::new("smm.order.processing", 1, 9, Vec::new());
        assert_eq!(IdempotencyStore::id_of(&msg), "smm.order.processing-1-9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_and_detect() {
        let store = IdempotencyStore::new(Duration::from_secs(60));
        assert!(!store.is_duplicate("a-0-1"));
        store.mark_processed("a-0-1");
        assert!(store.is_duplicate("a-0-1"));
        assert!(store.remove("a-0-1"));
        assert!(!store.is_duplicate("a-0-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_and_mark() {
        let store = IdempotencyStore::new(Duration::from_secs(60));
        assert!(!store.check_and_mark("a-0-1"));
        assert!(store.check_and_mark("a-0-1"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marking_sweeps_expired_ids() {
        let store = IdempotencyStore::new(Duration::from_secs(60)).with_purge_every(4);
        store.mark_processed("a-0-1");
        store.mark_processed("a-0-2");
        tokio::time::advance(Duration::from_secs(61)).await;

        store.mark_processed("a-0-3");
        assert_eq!(store.len(), 3);
        assert!(!store.check_and_mark("a-0-4"));
        assert_eq!(store.len(), 2);
        assert!(store.is_duplicate("a-0-3"));
        assert!(store.is_duplicate("a-0-4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = IdempotencyStore::new(Duration::from_secs(60));
        store.mark_processed("a-0-1");
        tokio::time::advance(Duration::from_secs(30)).await;
        store.mark_processed("a-0-2");
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(!store.is_duplicate("a-0-1"));
        assert!(store.is_duplicate("a-0-2"));
        assert!(!store.check_and_mark("a-0-1"));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(store.purge_expired(), 2);
        assert!(store.is_empty());
    }
}
