use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ShardError;
use crate::fingerprint::Fingerprinter;
use crate::metrics_consts::{
    BYTES_REMOVED_COUNTER, DOCUMENTS_MALFORMED_COUNTER, DOCUMENTS_REMOVED_COUNTER,
    DOCUMENTS_TOTAL_COUNTER, DOCUMENTS_UNFINGERPRINTABLE_COUNTER, PARTITIONS_SKIPPED_COUNTER,
    PARTITION_DURATION_HISTOGRAM,
};
use crate::shard::{AdmissionDecision, AdmissionRegistry};
use crate::stats::{DedupStats, DuplicateRecord};
use crate::table::{content, RowRef, Table};

/// How a partition was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    Deduplicated,
    /// The partition has no content column: no output rows, zeroed statistics.
    MissingContentColumn,
}

/// The filtered table of a partition along with its statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionOutcome {
    pub partition: Arc<str>,
    pub status: PartitionStatus,
    pub table: Table,
    pub stats: DedupStats,
}

impl PartitionOutcome {
    pub fn summary(&self) -> PartitionSummary {
        PartitionSummary {
            partition: self.partition.clone(),
            status: self.status,
            stats: self.stats.clone(),
        }
    }
}

/// A partition's metadata record, without its rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSummary {
    pub partition: Arc<str>,
    pub status: PartitionStatus,
    #[serde(flatten)]
    pub stats: DedupStats,
}

/// Deduplicates partitions against a shared registry.
///
/// Holds no per-partition state, so one worker can be shared by every task
/// of the pool and any number of partitions may be processed concurrently.
pub struct DedupWorker {
    registry: Arc<dyn AdmissionRegistry>,
    content_column: String,
    fingerprinter: Fingerprinter,
    audit: bool,
}

impl DedupWorker {
    pub fn new(
        registry: Arc<dyn AdmissionRegistry>,
        content_column: &str,
        fingerprinter: Fingerprinter,
        audit: bool,
    ) -> Self {
        Self {
            registry,
            content_column: content_column.to_owned(),
            fingerprinter,
            audit,
        }
    }

    /// Filter duplicate rows out of `table`, keeping the order of retained rows.
    ///
    /// Rows whose content is not text are passed through and counted. A row
    /// the registry already credits to itself (a partition being retried) is
    /// kept. Only shard failures are errors; they leave the registry
    /// consistent, so the partition can be processed again from scratch.
    pub async fn process(
        &self,
        partition: Arc<str>,
        table: Table,
    ) -> Result<PartitionOutcome, ShardError> {
        if !table.has_column(&self.content_column) {
            warn!(
                partition = %partition,
                column = %self.content_column,
                "content column missing, skipping partition"
            );
            metrics::counter!(PARTITIONS_SKIPPED_COUNTER).increment(1);

            return Ok(PartitionOutcome {
                partition,
                status: PartitionStatus::MissingContentColumn,
                table: table.empty_like(),
                stats: DedupStats::default(),
            });
        }

        let started = Instant::now();
        let Table {
            columns,
            rows,
            malformed_rows,
        } = table;
        let mut retained = Vec::with_capacity(rows.len());
        let mut stats = DedupStats {
            docs_malformed: malformed_rows,
            ..Default::default()
        };

        for (row_id, row) in rows.into_iter().enumerate() {
            stats.docs_processed += 1;

            let fingerprinted = content(&row, &self.content_column).map(|text| {
                let size = text.len() as u64;
                (self.fingerprinter.fingerprint(text.as_bytes()), size)
            });
            let Some((fingerprint, size)) = fingerprinted else {
                debug!(partition = %partition, row_id, "content is not text, passing row through");
                stats.docs_unfingerprintable += 1;
                stats.docs_retained += 1;
                retained.push(row);
                continue;
            };

            let origin = RowRef::new(partition.clone(), row_id as u64);
            match self
                .registry
                .check_and_insert(fingerprint, origin.clone())
                .await?
            {
                AdmissionDecision::Admitted => {
                    stats.docs_retained += 1;
                    retained.push(row);
                }
                AdmissionDecision::Duplicate { original } if original == origin => {
                    debug!(partition = %partition, row_id, "reclaimed row admitted by an earlier attempt");
                    stats.docs_reclaimed += 1;
                    stats.docs_retained += 1;
                    retained.push(row);
                }
                AdmissionDecision::Duplicate { original } => {
                    stats.docs_removed += 1;
                    stats.bytes_removed += size;
                    if self.audit {
                        stats.duplicates.insert(DuplicateRecord {
                            removed: origin,
                            survivor: original,
                        });
                    }
                }
            }
        }

        metrics::counter!(DOCUMENTS_TOTAL_COUNTER).increment(stats.docs_processed);
        metrics::counter!(DOCUMENTS_REMOVED_COUNTER).increment(stats.docs_removed);
        metrics::counter!(BYTES_REMOVED_COUNTER).increment(stats.bytes_removed);
        metrics::counter!(DOCUMENTS_UNFINGERPRINTABLE_COUNTER)
            .increment(stats.docs_unfingerprintable);
        metrics::counter!(DOCUMENTS_MALFORMED_COUNTER).increment(stats.docs_malformed);
        metrics::histogram!(PARTITION_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());

        info!(
            partition = %partition,
            processed = stats.docs_processed,
            removed = stats.docs_removed,
            bytes_removed = stats.bytes_removed,
            "deduplicated partition"
        );

        Ok(PartitionOutcome {
            partition,
            status: PartitionStatus::Deduplicated,
            table: Table::new(columns, retained),
            stats,
        })
    }
}
