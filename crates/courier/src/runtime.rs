//! Partition worker runtime
//!
//! Polls a [`MessageSource`] and hands each record to the worker task owning its
//! partition. A worker processes its partition strictly in order and commits each
//! offset synchronously once the pipeline reaches a final outcome. A semaphore
//! bounds how many messages are processed at once across all partitions.
//!
//! Revocation and shutdown drain in-flight work for at most `drain_timeout`
//! before ownership is released. Once a partition is revoked or lost its worker
//! stops committing, and records for it still in a polled batch are dropped
//! until the partition is assigned again.

use crate::pipeline::{Pipeline, ProcessOutcome};
use crate::rebalance::RebalanceCoordinator;
use courier_error::{CourierError, Result};
use courier_resilience::Deadline;
use courier_traits::{ConsumerControl, InboundMessage, MessageSource, TopicPartition};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Messages processed concurrently across partitions
    pub concurrency: usize,
    /// Records per poll
    pub max_poll_records: usize,
    /// Poll wait
    pub poll_timeout: Duration,
    /// Buffered records per partition worker
    pub partition_buffer: usize,
    /// Bound on draining in-flight work
    pub drain_timeout: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_poll_records: 100,
            poll_timeout: Duration::from_secs(1),
            partition_buffer: 64,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters of a runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Records polled
    pub polled: u64,
    /// Records that reached a final outcome
    pub processed: u64,
    /// Of those, dead-lettered or escalated
    pub terminal: u64,
    /// Successful per-record commits
    pub committed: u64,
    /// Failed per-record commits
    pub commit_failures: u64,
    /// Records dropped because their partition was revoked or lost
    pub released_drops: u64,
}

#[derive(Debug, Default)]
struct Counters {
    polled: AtomicU64,
    processed: AtomicU64,
    terminal: AtomicU64,
    committed: AtomicU64,
    commit_failures: AtomicU64,
    released_drops: AtomicU64,
}

impl Counters {
    fn summary(&self) -> RunSummary {
        RunSummary {
            polled: self.polled.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            terminal: self.terminal.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            released_drops: self.released_drops.load(Ordering::Relaxed),
        }
    }
}

struct Worker {
    tx: mpsc::Sender<InboundMessage>,
    handle: JoinHandle<()>,
    /// Cleared when the partition is given up; the worker checks it before each commit
    owned: Arc<AtomicBool>,
}

impl Worker {
    /// Give up the partition and wait for the task to be gone
    async fn abandon(self, partition: &TopicPartition) {
        self.owned.store(false, Ordering::SeqCst);
        self.handle.abort();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                tracing::error!(partition = %partition, error = %e, "Partition worker failed");
            }
        }
    }
}

#[derive(Default)]
struct Workers {
    live: HashMap<TopicPartition, Worker>,
    /// Revoked or lost, not assigned again since
    released: HashSet<TopicPartition>,
}

/// Consumer loop with one worker task per partition
pub struct ConsumerRuntime {
    settings: RuntimeSettings,
    source: Arc<dyn MessageSource>,
    consumer: Arc<dyn ConsumerControl>,
    pipeline: Arc<Pipeline>,
    coordinator: Arc<RebalanceCoordinator>,
    permits: Arc<Semaphore>,
    workers: Mutex<Workers>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for ConsumerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRuntime")
            .field("settings", &self.settings)
            .field("pipeline", &self.pipeline.name())
            .finish()
    }
}

impl ConsumerRuntime {
    /// Create a runtime
    pub fn new(
        settings: RuntimeSettings,
        source: Arc<dyn MessageSource>,
        consumer: Arc<dyn ConsumerControl>,
        pipeline: Arc<Pipeline>,
        coordinator: Arc<RebalanceCoordinator>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            settings,
            source,
            consumer,
            pipeline,
            coordinator,
            permits,
            workers: Mutex::new(Workers::default()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Counters so far
    pub fn summary(&self) -> RunSummary {
        self.counters.summary()
    }

    /// Partitions with a live worker
    pub async fn active_partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<_> = self.workers.lock().await.live.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Poll and dispatch until `shutdown` flips to true (or its sender is dropped),
    /// then drain.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<RunSummary> {
        tracing::info!(
            pipeline = %self.pipeline.name(),
            concurrency = self.settings.concurrency,
            "Consumer runtime started"
        );

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let polled = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                polled = self.source.poll(self.settings.max_poll_records, self.settings.poll_timeout) => polled,
            };

            match polled {
                Ok(batch) => {
                    self.counters.polled.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    if let Err(e) = self.dispatch_all(batch).await {
                        tracing::error!(error = %e, "Dispatch failed, stopping");
                        break Err(e);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Poll failed");
                    tokio::time::sleep(self.settings.poll_timeout).await;
                }
            }
        };

        self.shutdown().await;
        result.map(|()| self.summary())
    }

    async fn dispatch_all(&self, batch: Vec<InboundMessage>) -> Result<()> {
        for message in batch {
            self.dispatch(message).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, message: InboundMessage) -> Result<()> {
        let partition = message.topic_partition();
        let tx = {
            let mut workers = self.workers.lock().await;
            if workers.released.contains(&partition) {
                drop(workers);
                self.drop_released(&message);
                return Ok(());
            }
            workers
                .live
                .entry(partition.clone())
                .or_insert_with(|| self.spawn_worker(partition.clone()))
                .tx
                .clone()
        };
        let Err(mpsc::error::SendError(message)) = tx.send(message).await else {
            return Ok(());
        };
        // The worker may have been taken away while the send was waiting for room
        if self.workers.lock().await.released.contains(&partition) {
            self.drop_released(&message);
            return Ok(());
        }
        Err(CourierError::Other(format!("worker for {} stopped", partition)))
    }

    fn drop_released(&self, message: &InboundMessage) {
        self.counters.released_drops.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            partition = %message.topic_partition(),
            offset = message.offset,
            "Dropping record of a released partition"
        );
    }

    fn spawn_worker(&self, partition: TopicPartition) -> Worker {
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(self.settings.partition_buffer.max(1));
        let pipeline = Arc::clone(&self.pipeline);
        let consumer = Arc::clone(&self.consumer);
        let tracker = Arc::clone(self.coordinator.tracker());
        let permits = Arc::clone(&self.permits);
        let counters = Arc::clone(&self.counters);
        let owned = Arc::new(AtomicBool::new(true));
        let still_owned = Arc::clone(&owned);

        tracing::debug!(partition = %partition, "Starting partition worker");
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Ok(_permit) = permits.acquire().await else {
                    break;
                };

                let outcome = pipeline.process(&message).await;
                counters.processed.fetch_add(1, Ordering::Relaxed);
                if matches!(
                    outcome,
                    ProcessOutcome::DeadLettered { .. } | ProcessOutcome::Escalated { .. }
                ) {
                    counters.terminal.fetch_add(1, Ordering::Relaxed);
                }

                if !still_owned.load(Ordering::SeqCst) {
                    tracing::warn!(
                        partition = %partition,
                        offset = message.offset,
                        "Partition released mid-flight, skipping commit"
                    );
                    break;
                }
                tracker.mark_processed(&partition, message.offset);
                let offsets = BTreeMap::from([(partition.clone(), message.offset + 1)]);
                match consumer.commit_sync(&offsets).await {
                    Ok(()) => {
                        counters.committed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.commit_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            partition = %partition,
                            offset = message.offset,
                            error = %e,
                            "Offset commit failed"
                        );
                    }
                }
            }
            tracing::debug!(partition = %partition, "Partition worker stopped");
        });

        Worker { tx, handle, owned }
    }

    async fn take_workers(&self, partitions: &[TopicPartition]) -> Vec<(TopicPartition, Worker)> {
        let mut workers = self.workers.lock().await;
        partitions
            .iter()
            .filter_map(|tp| workers.live.remove_entry(tp))
            .collect()
    }

    /// Take the workers of partitions this member no longer owns
    async fn release_workers(&self, partitions: &[TopicPartition]) -> Vec<(TopicPartition, Worker)> {
        let mut workers = self.workers.lock().await;
        workers.released.extend(partitions.iter().cloned());
        partitions
            .iter()
            .filter_map(|tp| workers.live.remove_entry(tp))
            .collect()
    }

    async fn drain(&self, workers: Vec<(TopicPartition, Worker)>) {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|(tp, Worker { tx, handle, owned })| {
                drop(tx);
                (tp, handle, owned)
            })
            .collect();

        let deadline = Deadline::new(self.settings.drain_timeout);
        for (tp, handle, owned) in handles {
            let abort = handle.abort_handle();
            match deadline.execute("drain partition worker", handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(partition = %tp, error = %e, "Partition worker failed"),
                Err(_) => {
                    tracing::warn!(
                        partition = %tp,
                        timeout = ?self.settings.drain_timeout,
                        "Drain timed out, abandoning in-flight work"
                    );
                    owned.store(false, Ordering::SeqCst);
                    abort.abort();
                }
            }
        }
    }

    /// Drain the revoked partitions, commit their processed offsets, then record the
    /// revocation. Returns the commit error, if any.
    pub async fn on_partitions_revoked(&self, partitions: &[TopicPartition]) -> Result<()> {
        let workers = self.release_workers(partitions).await;
        self.drain(workers).await;
        let committed = self.coordinator.on_partitions_revoked_before_commit(partitions).await;
        self.coordinator.on_partitions_revoked(partitions).await;
        committed
    }

    /// Record new ownership
    pub async fn on_partitions_assigned(&self, partitions: &[TopicPartition]) -> Result<()> {
        {
            let mut workers = self.workers.lock().await;
            for tp in partitions {
                workers.released.remove(tp);
            }
        }
        self.coordinator.on_partitions_assigned(partitions).await
    }

    /// Stop the lost partitions' workers without committing anything.
    ///
    /// Returns once the workers are gone, so no commit for these partitions can
    /// follow.
    pub async fn on_partitions_lost(&self, partitions: &[TopicPartition]) {
        for (tp, worker) in self.release_workers(partitions).await {
            worker.abandon(&tp).await;
        }
        self.coordinator.on_partitions_lost(partitions).await;
    }

    async fn shutdown(&self) {
        let partitions = self.active_partitions().await;
        let workers = self.take_workers(&partitions).await;
        tracing::info!(partitions = workers.len(), "Draining partition workers");
        self.drain(workers).await;

        if let Err(e) = self.coordinator.on_partitions_revoked_before_commit(&partitions).await {
            tracing::warn!(error = %e, "Final commit failed");
        }
        let summary = self.summary();
        tracing::info!(
            processed = summary.processed,
            committed = summary.committed,
            "Consumer runtime stopped"
        );
    }
}
