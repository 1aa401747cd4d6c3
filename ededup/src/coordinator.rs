//! Runs a deduplication pass over a whole corpus.
//!
//! The coordinator starts every shard registry before any worker, feeds
//! partition ids to a fixed pool of workers through a shared queue, and
//! folds each finished partition into the run summary as soon as it is
//! reported. Failed attempts go back on the queue while attempts remain;
//! losing a shard aborts the run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::DedupConfig;
use crate::error::{ConfigError, CoordinatorError, WorkerError};
use crate::fingerprint::Fingerprinter;
use crate::io::{PartitionSink, PartitionSource};
use crate::metrics_consts::{PARTITIONS_REMAINING_GAUGE, PARTITION_RETRIES_COUNTER};
use crate::shard::RunningRegistry;
use crate::stats::RunSummary;
use crate::worker::{DedupWorker, PartitionSummary};

/// A partition waiting to be processed.
#[derive(Debug, Clone)]
struct WorkItem {
    partition: Arc<str>,
    attempt: u32,
}

/// What a pool task sends back after one attempt at a partition.
struct WorkReport {
    item: WorkItem,
    result: Result<PartitionSummary, WorkerError>,
}

type WorkQueue = Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>;

pub struct Coordinator {
    config: DedupConfig,
}

impl Coordinator {
    /// Fails fast on an invalid configuration, before anything is started.
    pub fn new(config: DedupConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Deduplicate every partition of `source` into `sink`.
    ///
    /// Shard registries live exactly as long as this call. The returned
    /// summary is the merge of every partition's statistics.
    pub async fn run(
        &self,
        source: Arc<dyn PartitionSource>,
        sink: Arc<dyn PartitionSink>,
    ) -> Result<RunSummary, CoordinatorError> {
        let partitions = source.partitions().await.map_err(CoordinatorError::Listing)?;
        let partitions = unique_partitions(partitions);
        info!(
            partitions = partitions.len(),
            workers = self.config.num_workers,
            shards = self.config.num_shards,
            "starting deduplication run"
        );

        let registries = RunningRegistry::start(
            self.config.registry_mode,
            self.config.shard_count()?,
            self.config.shard_queue_capacity,
            self.config.shard_resource_hint,
        );
        self.run_with(registries, partitions, source, sink).await
    }

    /// Drive `partitions` through the worker pool against already started
    /// registries, which are shut down (or aborted on failure) before returning.
    async fn run_with(
        &self,
        registries: RunningRegistry,
        partitions: Vec<String>,
        source: Arc<dyn PartitionSource>,
        sink: Arc<dyn PartitionSink>,
    ) -> Result<RunSummary, CoordinatorError> {
        let total = partitions.len();
        let worker = Arc::new(DedupWorker::new(
            registries.registry(),
            &self.config.content_column,
            Fingerprinter::new(self.config.normalization),
            self.config.audit_duplicates,
        ));

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let queue: WorkQueue = Arc::new(Mutex::new(work_rx));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.num_workers {
            workers.spawn(worker_loop(
                worker_id,
                queue.clone(),
                report_tx.clone(),
                worker.clone(),
                source.clone(),
                sink.clone(),
                self.config.partition_timeout,
            ));
        }
        // Only the pool holds the worker and the report sender from here on.
        drop(worker);
        drop(report_tx);

        for partition in partitions {
            // The receiver lives in `queue`, which we hold.
            if work_tx
                .send(WorkItem {
                    partition: Arc::from(partition),
                    attempt: 1,
                })
                .is_err()
            {
                break;
            }
        }

        let outcome = self
            .collect(total, &work_tx, &mut report_rx, &mut workers)
            .await;

        // Closing the queue lets idle workers exit.
        drop(work_tx);

        let summary = match outcome {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = ?e, "deduplication run failed");
                workers.abort_all();
                registries.abort();
                return Err(e);
            }
        };

        while let Some(joined) = workers.join_next().await {
            joined.map_err(CoordinatorError::WorkerPanicked)?;
        }

        let reports = registries.shutdown().await?;
        for report in &reports {
            debug!(
                shard = %report.shard,
                admitted = report.admitted,
                duplicates = report.duplicates,
                "shard report"
            );
        }

        info!(
            partitions_deduplicated = summary.partitions_deduplicated,
            partitions_skipped = summary.partitions_skipped,
            partition_retries = summary.partition_retries,
            docs_processed = summary.stats.docs_processed,
            docs_removed = summary.stats.docs_removed,
            bytes_removed = summary.stats.bytes_removed,
            "deduplication run complete"
        );
        Ok(summary)
    }

    /// Fold reports into the summary until every partition has completed,
    /// re-queueing retryable failures.
    async fn collect(
        &self,
        total: usize,
        work_tx: &mpsc::UnboundedSender<WorkItem>,
        report_rx: &mut mpsc::UnboundedReceiver<WorkReport>,
        workers: &mut JoinSet<()>,
    ) -> Result<RunSummary, CoordinatorError> {
        let mut summary = RunSummary::default();
        let mut remaining = total;
        metrics::gauge!(PARTITIONS_REMAINING_GAUGE).set(remaining as f64);

        while remaining > 0 {
            tokio::select! {
                report = report_rx.recv() => {
                    let Some(WorkReport { item, result }) = report else {
                        return Err(CoordinatorError::WorkersExited { remaining });
                    };

                    match result {
                        Ok(partition) => {
                            summary.record(&partition);
                            remaining -= 1;
                            metrics::gauge!(PARTITIONS_REMAINING_GAUGE).set(remaining as f64);
                            info!(
                                partition = %partition.partition,
                                completed = total - remaining,
                                total,
                                "partition complete"
                            );
                        }
                        Err(e) if e.is_retryable() && item.attempt < self.config.max_partition_attempts => {
                            warn!(
                                partition = %item.partition,
                                attempt = item.attempt,
                                error = ?e,
                                "partition attempt failed, retrying"
                            );
                            metrics::counter!(PARTITION_RETRIES_COUNTER).increment(1);
                            summary.partition_retries += 1;

                            let retry = WorkItem {
                                partition: item.partition,
                                attempt: item.attempt + 1,
                            };
                            if work_tx.send(retry).is_err() {
                                return Err(CoordinatorError::WorkersExited { remaining });
                            }
                        }
                        Err(WorkerError::Shard(e)) => return Err(CoordinatorError::Shard(e)),
                        Err(e) => {
                            return Err(CoordinatorError::PartitionFailed {
                                partition: item.partition.to_string(),
                                attempts: item.attempt,
                                source: e,
                            });
                        }
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    // Workers only stop on their own when reports can't be delivered.
                    joined.map_err(CoordinatorError::WorkerPanicked)?;
                }
            }
        }

        Ok(summary)
    }
}

/// Drop repeated partition ids, keeping the first listing order. Rows are
/// identified by partition id, so a partition listed twice would have its
/// second copy credited as the first one's rows.
fn unique_partitions(partitions: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(partitions.len());
    partitions
        .into_iter()
        .filter(|partition| {
            let first = seen.insert(partition.clone());
            if !first {
                warn!(partition = %partition, "partition listed more than once, processing it once");
            }
            first
        })
        .collect()
}

/// One member of the worker pool: pull a partition, deduplicate it, write it
/// out, report, repeat until the queue closes.
async fn worker_loop(
    worker_id: usize,
    queue: WorkQueue,
    reports: mpsc::UnboundedSender<WorkReport>,
    worker: Arc<DedupWorker>,
    source: Arc<dyn PartitionSource>,
    sink: Arc<dyn PartitionSink>,
    timeout: Duration,
) {
    debug!(worker_id, "worker started");

    loop {
        let next = queue.lock().await.recv().await;
        let Some(item) = next else {
            break;
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(
            timeout,
            process_partition(&item, &worker, source.as_ref(), sink.as_ref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout {
                partition: item.partition.to_string(),
                timeout,
            }),
        };
        debug!(
            worker_id,
            partition = %item.partition,
            attempt = item.attempt,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "partition attempt finished"
        );

        if reports.send(WorkReport { item, result }).is_err() {
            break;
        }
    }

    debug!(worker_id, "worker stopped");
}

async fn process_partition(
    item: &WorkItem,
    worker: &DedupWorker,
    source: &dyn PartitionSource,
    sink: &dyn PartitionSink,
) -> Result<PartitionSummary, WorkerError> {
    let table = source
        .load(&item.partition)
        .await
        .map_err(|e| WorkerError::Source {
            partition: item.partition.to_string(),
            source: e,
        })?;

    let outcome = worker.process(item.partition.clone(), table).await?;

    sink.write(&outcome).await.map_err(|e| WorkerError::Sink {
        partition: item.partition.to_string(),
        source: e,
    })?;

    Ok(outcome.summary())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::error::ShardError;
    use crate::io::{MemorySink, MemorySource};
    use crate::shard::RegistryMode;
    use crate::table::Table;
    use crate::worker::PartitionOutcome;

    fn documents(contents: &[&str]) -> Table {
        Table::from_rows(
            contents
                .iter()
                .map(|c| json!({"contents": c}).as_object().cloned().unwrap())
                .collect(),
        )
    }

    /// Fails the first `failures` loads, then delegates.
    struct FlakySource {
        inner: MemorySource,
        failures: usize,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl PartitionSource for FlakySource {
        async fn partitions(&self) -> anyhow::Result<Vec<String>> {
            self.inner.partitions().await
        }

        async fn load(&self, partition: &str) -> anyhow::Result<Table> {
            if self.loads.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(anyhow!("simulated storage outage"));
            }
            self.inner.load(partition).await
        }
    }

    struct UnlistableSource;

    #[async_trait]
    impl PartitionSource for UnlistableSource {
        async fn partitions(&self) -> anyhow::Result<Vec<String>> {
            Err(anyhow!("bucket not found"))
        }

        async fn load(&self, _partition: &str) -> anyhow::Result<Table> {
            unreachable!("nothing was listed")
        }
    }

    #[test]
    fn test_invalid_config_fails_before_start() {
        let result = Coordinator::new(DedupConfig::default().with_num_shards(0));
        assert!(matches!(result, Err(ConfigError::InvalidShardCount)));
    }

    #[tokio::test]
    async fn test_single_partition_scenario() {
        let coordinator = Coordinator::new(DedupConfig::default().with_num_shards(2)).unwrap();
        let source = MemorySource::new(vec![(
            "p0".to_owned(),
            documents(&["A", "B", "A", "C", "B"]),
        )]);
        let sink = Arc::new(MemorySink::new());

        let summary = coordinator
            .run(Arc::new(source), sink.clone())
            .await
            .unwrap();

        assert_eq!(summary.stats.docs_processed, 5);
        assert_eq!(summary.stats.docs_removed, 2);
        assert_eq!(summary.partitions_deduplicated, 1);

        let output = sink.outcome("p0").unwrap();
        let contents: Vec<&str> = output
            .table
            .rows
            .iter()
            .map(|r| r["contents"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_empty_corpus() {
        let coordinator = Coordinator::new(DedupConfig::default()).unwrap();

        let summary = coordinator
            .run(Arc::new(MemorySource::default()), Arc::new(MemorySink::new()))
            .await
            .unwrap();

        assert_eq!(summary, RunSummary::default());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let coordinator =
            Coordinator::new(DedupConfig::default().with_max_partition_attempts(3)).unwrap();
        let source = FlakySource {
            inner: MemorySource::new(vec![("p0".to_owned(), documents(&["A", "A"]))]),
            failures: 2,
            loads: AtomicUsize::new(0),
        };
        let sink = Arc::new(MemorySink::new());

        let summary = coordinator
            .run(Arc::new(source), sink.clone())
            .await
            .unwrap();

        assert_eq!(summary.partition_retries, 2);
        assert_eq!(summary.stats.docs_removed, 1);
        assert_eq!(sink.outcome("p0").unwrap().table.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_run() {
        let coordinator =
            Coordinator::new(DedupConfig::default().with_max_partition_attempts(2)).unwrap();
        let source = FlakySource {
            inner: MemorySource::new(vec![("p0".to_owned(), documents(&["A"]))]),
            failures: usize::MAX,
            loads: AtomicUsize::new(0),
        };

        let result = coordinator
            .run(Arc::new(source), Arc::new(MemorySink::new()))
            .await;

        match result {
            Err(CoordinatorError::PartitionFailed {
                partition,
                attempts,
                source: WorkerError::Source { .. },
            }) => {
                assert_eq!(partition, "p0");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_listing_failure_fails_the_run() {
        let coordinator = Coordinator::new(DedupConfig::default()).unwrap();

        let result = coordinator
            .run(Arc::new(UnlistableSource), Arc::new(MemorySink::new()))
            .await;

        assert!(matches!(result, Err(CoordinatorError::Listing(_))));
    }

    /// Fails the first `failures` writes, after the worker already admitted
    /// the partition's rows, then delegates.
    struct FlakySink {
        inner: MemorySink,
        failures: usize,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl PartitionSink for FlakySink {
        async fn write(&self, outcome: &PartitionOutcome) -> anyhow::Result<()> {
            if self.writes.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(anyhow!("simulated write failure"));
            }
            self.inner.write(outcome).await
        }
    }

    /// Hangs on the first `stalls` loads, then delegates.
    struct StallingSource {
        inner: MemorySource,
        stalls: usize,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl PartitionSource for StallingSource {
        async fn partitions(&self) -> anyhow::Result<Vec<String>> {
            self.inner.partitions().await
        }

        async fn load(&self, partition: &str) -> anyhow::Result<Table> {
            if self.loads.fetch_add(1, Ordering::SeqCst) < self.stalls {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.inner.load(partition).await
        }
    }

    #[tokio::test]
    async fn test_retry_after_admission_keeps_rows_once() {
        for mode in [RegistryMode::Actor, RegistryMode::Mutex] {
            let coordinator =
                Coordinator::new(DedupConfig::default().with_registry_mode(mode)).unwrap();
            let sink = Arc::new(FlakySink {
                inner: MemorySink::new(),
                failures: 1,
                writes: AtomicUsize::new(0),
            });
            let source = MemorySource::new(vec![(
                "p0".to_owned(),
                documents(&["A", "B", "A"]),
            )]);

            let summary = coordinator
                .run(Arc::new(source), sink.clone())
                .await
                .unwrap();

            assert_eq!(summary.partition_retries, 1);
            assert_eq!(summary.stats.docs_processed, 3);
            assert_eq!(summary.stats.docs_retained, 2);
            assert_eq!(summary.stats.docs_removed, 1);
            assert_eq!(summary.stats.docs_reclaimed, 2);

            let output = sink.inner.outcome("p0").unwrap();
            let contents: Vec<&str> = output
                .table
                .rows
                .iter()
                .map(|r| r["contents"].as_str().unwrap())
                .collect();
            assert_eq!(contents, vec!["A", "B"]);
        }
    }

    #[tokio::test]
    async fn test_timed_out_partition_is_retried() {
        let coordinator = Coordinator::new(
            DedupConfig::default().with_partition_timeout(Duration::from_millis(50)),
        )
        .unwrap();
        let source = StallingSource {
            inner: MemorySource::new(vec![("p0".to_owned(), documents(&["A", "A"]))]),
            stalls: 1,
            loads: AtomicUsize::new(0),
        };
        let sink = Arc::new(MemorySink::new());

        let summary = coordinator
            .run(Arc::new(source), sink.clone())
            .await
            .unwrap();

        assert_eq!(summary.partition_retries, 1);
        assert_eq!(summary.stats.docs_removed, 1);
        assert_eq!(sink.outcome("p0").unwrap().table.len(), 1);
    }

    #[tokio::test]
    async fn test_partition_that_always_times_out_fails_the_run() {
        let coordinator = Coordinator::new(
            DedupConfig::default()
                .with_partition_timeout(Duration::from_millis(20))
                .with_max_partition_attempts(2),
        )
        .unwrap();
        let source = StallingSource {
            inner: MemorySource::new(vec![("p0".to_owned(), documents(&["A"]))]),
            stalls: usize::MAX,
            loads: AtomicUsize::new(0),
        };

        let result = coordinator
            .run(Arc::new(source), Arc::new(MemorySink::new()))
            .await;

        assert!(matches!(
            result,
            Err(CoordinatorError::PartitionFailed {
                attempts: 2,
                source: WorkerError::Timeout { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_lost_shard_aborts_the_run() {
        let coordinator = Coordinator::new(DedupConfig::default().with_num_shards(1)).unwrap();
        let registries = RunningRegistry::start(
            RegistryMode::Actor,
            coordinator.config().shard_count().unwrap(),
            4,
            0.5,
        );
        registries.abort();
        let source = MemorySource::new(vec![("p0".to_owned(), documents(&["A"]))]);

        let result = coordinator
            .run_with(
                registries,
                vec!["p0".to_owned()],
                Arc::new(source),
                Arc::new(MemorySink::new()),
            )
            .await;

        assert!(matches!(
            result,
            Err(CoordinatorError::Shard(ShardError::Unavailable { .. }))
        ));
    }

    #[tokio::test]
    async fn test_partition_listed_twice_is_processed_once() {
        let coordinator = Coordinator::new(DedupConfig::default().with_num_workers(1)).unwrap();
        let source = MemorySource::new(vec![
            ("p".to_owned(), documents(&["A"])),
            ("p".to_owned(), documents(&["A"])),
        ]);

        let summary = coordinator
            .run(Arc::new(source), Arc::new(MemorySink::new()))
            .await
            .unwrap();

        assert_eq!(summary.partitions_deduplicated, 1);
        assert_eq!(summary.stats.docs_processed, 1);
        assert_eq!(summary.stats.docs_retained, 1);
        assert_eq!(summary.stats.docs_reclaimed, 0);
    }

    #[test]
    fn test_unique_partitions_keeps_first_listing_order() {
        let listed = ["b", "a", "b", "c", "a"].map(str::to_owned).to_vec();

        assert_eq!(unique_partitions(listed), vec!["b", "a", "c"]);
    }
}
