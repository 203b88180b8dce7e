//! Reliability metrics aggregator
//!
//! Passive counters owned by a single injectable [`ReliabilityMetrics`] instance.
//! The pipeline, dead-letter router and rebalance coordinator increment them;
//! everyone else reads snapshots.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime reliability counters
#[derive(Debug, Default)]
pub struct ReliabilityMetrics {
    total_errors: AtomicU64,
    retried_errors: AtomicU64,
    non_retryable_errors: AtomicU64,
    dlq_sent: AtomicU64,
    dlq_publish_failures: AtomicU64,
    dead_letters_spilled: AtomicU64,
    dead_letters_dropped: AtomicU64,
    duplicates_skipped: AtomicU64,
    rebalance_count: AtomicU64,
    lost_partitions: AtomicU64,
    groups: DashMap<String, GroupRebalanceStats>,
}

/// Rebalance counters of one consumer group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRebalanceStats {
    /// Graceful rebalances (revocations) seen
    pub rebalance_count: u64,
    /// Partitions currently owned
    pub assigned_partitions: u64,
    /// Partitions revoked gracefully, total
    pub revoked_partitions: u64,
    /// Partitions lost, total
    pub lost_partitions: u64,
    /// Time of the last membership change
    pub last_rebalance: Option<DateTime<Utc>>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Failed handler attempts
    pub total_errors: u64,
    /// Retries scheduled after a retryable failure
    pub retried_errors: u64,
    /// Messages classified FATAL
    pub non_retryable_errors: u64,
    /// Dead letters published
    pub dlq_sent_count: u64,
    /// Dead letters whose publish was exhausted
    pub dlq_publish_failures: u64,
    /// Dead letters written to the spill
    pub dead_letters_spilled: u64,
    /// Dead letters dropped with an audit entry
    pub dead_letters_dropped: u64,
    /// Redeliveries skipped by the idempotency store
    pub duplicates_skipped: u64,
    /// Rebalances across all groups
    pub rebalance_count: u64,
    /// Partitions lost across all groups
    pub lost_partitions: u64,
    /// Share of failures that were FATAL
    pub error_rate: f64,
}

impl MetricsSnapshot {
    /// The flat error map exposed for scraping
    pub fn error_map(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("totalErrors", self.total_errors as f64),
            ("retriedErrors", self.retried_errors as f64),
            ("dlqSentCount", self.dlq_sent_count as f64),
            ("nonRetryableErrors", self.non_retryable_errors as f64),
            ("errorRate", self.error_rate),
        ])
    }
}

impl ReliabilityMetrics {
    /// Fresh zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retried_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_non_retryable(&self) {
        self.non_retryable_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dlq_sent(&self) {
        self.dlq_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dlq_publish_failure(&self) {
        self.dlq_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_spilled(&self) {
        self.dead_letters_spilled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dead_letters_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_assigned(&self, group: &str, partitions: usize) {
        let mut stats = self.groups.entry(group.to_string()).or_default();
        stats.assigned_partitions += partitions as u64;
        stats.last_rebalance = Some(Utc::now());
    }

    pub(crate) fn record_revoked(&self, group: &str, partitions: usize) {
        self.rebalance_count.fetch_add(1, Ordering::Relaxed);
        let mut stats = self.groups.entry(group.to_string()).or_default();
        stats.rebalance_count += 1;
        stats.revoked_partitions += partitions as u64;
        stats.assigned_partitions = stats.assigned_partitions.saturating_sub(partitions as u64);
        stats.last_rebalance = Some(Utc::now());
    }

    pub(crate) fn record_lost(&self, group: &str, partitions: usize) {
        self.lost_partitions.fetch_add(partitions as u64, Ordering::Relaxed);
        let mut stats = self.groups.entry(group.to_string()).or_default();
        stats.lost_partitions += partitions as u64;
        stats.assigned_partitions = stats.assigned_partitions.saturating_sub(partitions as u64);
        stats.last_rebalance = Some(Utc::now());
    }

    /// Copy the counters.
    ///
    /// `error_rate` is `non_retryable / total`, 0 when nothing has failed yet.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_errors = self.total_errors.load(Ordering::Relaxed);
        let non_retryable_errors = self.non_retryable_errors.load(Ordering::Relaxed);
        let error_rate = if total_errors == 0 {
            0.0
        } else {
            non_retryable_errors as f64 / total_errors as f64
        };

        MetricsSnapshot {
            total_errors,
            retried_errors: self.retried_errors.load(Ordering::Relaxed),
            non_retryable_errors,
            dlq_sent_count: self.dlq_sent.load(Ordering::Relaxed),
            dlq_publish_failures: self.dlq_publish_failures.load(Ordering::Relaxed),
            dead_letters_spilled: self.dead_letters_spilled.load(Ordering::Relaxed),
            dead_letters_dropped: self.dead_letters_dropped.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            rebalance_count: self.rebalance_count.load(Ordering::Relaxed),
            lost_partitions: self.lost_partitions.load(Ordering::Relaxed),
            error_rate,
        }
    }

    /// Rebalance counters of one group
    pub fn group(&self, group: &str) -> Option<GroupRebalanceStats> {
        self.groups.get(group).map(|stats| stats.clone())
    }

    /// Rebalance counters of every group seen
    pub fn groups(&self) -> BTreeMap<String, GroupRebalanceStats> {
        self.groups
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Zero every counter. Administrative action only.
    pub fn reset(&self) {
        for counter in [
            &self.total_errors,
            &self.retried_errors,
            &self.non_retryable_errors,
            &self.dlq_sent,
            &self.dlq_publish_failures,
            &self.dead_letters_spilled,
            &self.dead_letters_dropped,
            &self.duplicates_skipped,
            &self.rebalance_count,
            &self.lost_partitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.groups.clear();
        tracing::info!("Reliability metrics reset");
    }
}
