//! Consumer-group rebalance coordination
//!
//! [`RebalanceCoordinator`] reacts to the four membership callbacks a consumer
//! group delivers. Processed offsets of revoked partitions are committed
//! synchronously before the revocation is acknowledged; lost partitions are never
//! committed, since another member already owns them.

use crate::metrics::ReliabilityMetrics;
use chrono::{DateTime, Utc};
use courier_error::Result;
use courier_traits::{Alert, AlertKind, AlertSink, ConsumerControl, TopicPartition};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const HISTORY_LIMIT: usize = 1024;

/// Next offsets to commit, per partition
#[derive(Debug, Default)]
pub struct OffsetTracker {
    next: DashMap<TopicPartition, i64>,
}

impl OffsetTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `offset` is done (processed or dead-lettered)
    pub fn mark_processed(&self, partition: &TopicPartition, offset: i64) {
        let next = offset + 1;
        self.next
            .entry(partition.clone())
            .and_modify(|current| *current = (*current).max(next))
            .or_insert(next);
    }

    /// Next offset to commit for `partition`
    pub fn next_offset(&self, partition: &TopicPartition) -> Option<i64> {
        self.next.get(partition).map(|next| *next)
    }

    /// Commit map for the given partitions, skipping ones with nothing processed
    pub fn pending(&self, partitions: &[TopicPartition]) -> BTreeMap<TopicPartition, i64> {
        partitions
            .iter()
            .filter_map(|tp| self.next_offset(tp).map(|next| (tp.clone(), next)))
            .collect()
    }

    /// Stop tracking the given partitions
    pub fn forget(&self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.next.remove(tp);
        }
    }
}

/// Ownership record of one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionAssignment {
    /// The partition
    pub topic_partition: TopicPartition,
    /// When it was assigned
    pub assigned_at: DateTime<Utc>,
    /// When it was revoked gracefully
    pub revoked_at: Option<DateTime<Utc>>,
    /// When it was lost
    pub lost_at: Option<DateTime<Utc>>,
}

impl PartitionAssignment {
    fn new(topic_partition: TopicPartition) -> Self {
        Self {
            topic_partition,
            assigned_at: Utc::now(),
            revoked_at: None,
            lost_at: None,
        }
    }

    /// Still owned
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none() && self.lost_at.is_none()
    }
}

/// Coordinator settings
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceSettings {
    /// Consumer group name
    pub group: String,
    /// Rebalances tolerated within `storm_window` before alerting
    pub storm_threshold: u32,
    /// Window for the storm check
    pub storm_window: Duration,
    /// Offsets to seek to on assignment (replay). Empty means no seeking.
    pub replay_offsets: BTreeMap<TopicPartition, i64>,
}

impl RebalanceSettings {
    /// Five rebalances per five minutes, no replay
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            storm_threshold: 5,
            storm_window: Duration::from_secs(5 * 60),
            replay_offsets: BTreeMap::new(),
        }
    }

    /// Set the storm alert threshold
    pub fn with_storm_alert(mut self, threshold: u32, window: Duration) -> Self {
        self.storm_threshold = threshold;
        self.storm_window = window;
        self
    }

    /// Seek `partition` to `offset` whenever it is assigned
    pub fn with_replay_offset(mut self, partition: TopicPartition, offset: i64) -> Self {
        self.replay_offsets.insert(partition, offset);
        self
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    active: BTreeMap<TopicPartition, PartitionAssignment>,
    history: VecDeque<PartitionAssignment>,
    recent_rebalances: VecDeque<Instant>,
}

impl CoordinatorState {
    fn close(&mut self, partition: &TopicPartition, mark: impl FnOnce(&mut PartitionAssignment)) {
        let mut assignment = self
            .active
            .remove(partition)
            .unwrap_or_else(|| PartitionAssignment::new(partition.clone()));
        mark(&mut assignment);
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(assignment);
    }
}

/// Reacts to consumer-group membership changes
pub struct RebalanceCoordinator {
    settings: RebalanceSettings,
    consumer: Arc<dyn ConsumerControl>,
    tracker: Arc<OffsetTracker>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<ReliabilityMetrics>,
    state: Mutex<CoordinatorState>,
}

impl std::fmt::Debug for RebalanceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceCoordinator")
            .field("settings", &self.settings)
            .finish()
    }
}

impl RebalanceCoordinator {
    /// Create a coordinator committing through `consumer`
    pub fn new(
        settings: RebalanceSettings,
        consumer: Arc<dyn ConsumerControl>,
        tracker: Arc<OffsetTracker>,
        alerts: Arc<dyn AlertSink>,
        metrics: Arc<ReliabilityMetrics>,
    ) -> Self {
        Self {
            settings,
            consumer,
            tracker,
            alerts,
            metrics,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Consumer group name
    pub fn group(&self) -> &str {
        &self.settings.group
    }

    /// Offset tracker shared with the partition workers
    pub fn tracker(&self) -> &Arc<OffsetTracker> {
        &self.tracker
    }

    /// Synchronously commit every processed offset of `partitions`.
    ///
    /// Must complete before the revocation is acknowledged. A commit failure is
    /// logged and returned.
    pub async fn on_partitions_revoked_before_commit(&self, partitions: &[TopicPartition]) -> Result<()> {
        let offsets = self.tracker.pending(partitions);
        if offsets.is_empty() {
            tracing::debug!(group = %self.settings.group, "Nothing to commit before revocation");
            return Ok(());
        }

        match self.consumer.commit_sync(&offsets).await {
            Ok(()) => {
                tracing::info!(
                    group = %self.settings.group,
                    partitions = offsets.len(),
                    offsets = ?offsets,
                    "Committed offsets before revocation"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    group = %self.settings.group,
                    offsets = ?offsets,
                    error = %e,
                    "Commit before revocation failed"
                );
                Err(e)
            }
        }
    }

    /// Graceful revocation bookkeeping
    pub async fn on_partitions_revoked(&self, partitions: &[TopicPartition]) {
        self.metrics.record_revoked(&self.settings.group, partitions.len());
        self.tracker.forget(partitions);

        let storm = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            for tp in partitions {
                state.close(tp, |a| a.revoked_at = Some(now));
            }

            let at = Instant::now();
            state.recent_rebalances.push_back(at);
            while let Some(oldest) = state.recent_rebalances.front() {
                if at.duration_since(*oldest) > self.settings.storm_window {
                    state.recent_rebalances.pop_front();
                } else {
                    break;
                }
            }
            state.recent_rebalances.len()
        };

        tracing::warn!(group = %self.settings.group, partitions = ?partitions, "Partitions revoked");

        if storm as u64 > u64::from(self.settings.storm_threshold) {
            tracing::warn!(
                group = %self.settings.group,
                rebalances = storm,
                window = ?self.settings.storm_window,
                "Rebalance storm"
            );
            self.alerts
                .raise(
                    Alert::warning(
                        AlertKind::RebalanceStorm,
                        format!("group {} rebalanced {} times", self.settings.group, storm),
                    )
                    .with_context("group", &self.settings.group)
                    .with_context("windowSecs", self.settings.storm_window.as_secs()),
                )
                .await;
        }
    }

    /// Record new ownership and seek configured replay offsets
    pub async fn on_partitions_assigned(&self, partitions: &[TopicPartition]) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            for tp in partitions {
                state.active.insert(tp.clone(), PartitionAssignment::new(tp.clone()));
            }
        }
        self.metrics.record_assigned(&self.settings.group, partitions.len());
        tracing::info!(group = %self.settings.group, partitions = ?partitions, "Partitions assigned");

        for tp in partitions {
            if let Some(&offset) = self.settings.replay_offsets.get(tp) {
                self.consumer.seek(tp, offset).await?;
                tracing::info!(group = %self.settings.group, partition = %tp, offset, "Seeked for replay");
            }
        }
        Ok(())
    }

    /// Abnormal loss of ownership. Never commits.
    pub async fn on_partitions_lost(&self, partitions: &[TopicPartition]) {
        self.metrics.record_lost(&self.settings.group, partitions.len());
        self.tracker.forget(partitions);
        {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            for tp in partitions {
                state.close(tp, |a| a.lost_at = Some(now));
            }
        }

        tracing::error!(
            severity = "CRITICAL",
            group = %self.settings.group,
            partitions = ?partitions,
            "Partitions lost"
        );
        let names = partitions.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
        self.alerts
            .raise(
                Alert::critical(
                    AlertKind::PartitionsLost,
                    format!("group {} lost {} partitions", self.settings.group, partitions.len()),
                )
                .with_context("group", &self.settings.group)
                .with_context("partitions", names),
            )
            .await;
    }

    /// Partitions currently owned
    pub async fn assignments(&self) -> Vec<PartitionAssignment> {
        self.state.lock().await.active.values().cloned().collect()
    }

    /// Closed assignments, oldest first
    pub async fn history(&self) -> Vec<PartitionAssignment> {
        self.state.lock().await.history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_keeps_highest_offset() {
        let tracker = OffsetTracker::new();
        let tp = TopicPartition::new("orders", 0);
        tracker.mark_processed(&tp, 4);
        tracker.mark_processed(&tp, 2);
        assert_eq!(tracker.next_offset(&tp), Some(5));

        let other = TopicPartition::new("orders", 1);
        let pending = tracker.pending(&[tp.clone(), other.clone()]);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[&tp], 5);

        tracker.forget(&[tp.clone()]);
        assert_eq!(tracker.next_offset(&tp), None);
    }

    #[test]
    fn test_assignment_active() {
        let mut a = PartitionAssignment::new(TopicPartition::new("orders", 0));
        assert!(a.is_active());
        a.lost_at = Some(Utc::now());
        assert!(!a.is_active());
    }
}
