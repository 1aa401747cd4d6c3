use std::collections::BTreeSet;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::table::RowRef;
use crate::worker::{PartitionStatus, PartitionSummary};

/// A removed row and the row whose copy was kept in its place.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DuplicateRecord {
    pub removed: RowRef,
    pub survivor: RowRef,
}

/// Deduplication counters for one partition or any number of them.
///
/// Combining is field-wise addition plus set union, so statistics can be
/// merged in any order and any grouping with the same result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub docs_processed: u64,
    pub docs_retained: u64,
    pub docs_removed: u64,
    pub bytes_removed: u64,
    /// Rows kept as-is because their content is not text. Included in `docs_retained`.
    pub docs_unfingerprintable: u64,
    /// Rows kept on a retry because the registry already credits them to
    /// this very row. Included in `docs_retained`.
    pub docs_reclaimed: u64,
    /// Records dropped by the source because they could not be parsed. They
    /// never became documents, so they are not part of `docs_processed`.
    #[serde(default)]
    pub docs_malformed: u64,
    /// Filled only when the run audits duplicates.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub duplicates: BTreeSet<DuplicateRecord>,
}

impl DedupStats {
    pub fn merge(&mut self, other: DedupStats) {
        self.docs_processed += other.docs_processed;
        self.docs_retained += other.docs_retained;
        self.docs_removed += other.docs_removed;
        self.bytes_removed += other.bytes_removed;
        self.docs_unfingerprintable += other.docs_unfingerprintable;
        self.docs_reclaimed += other.docs_reclaimed;
        self.docs_malformed += other.docs_malformed;
        self.duplicates.extend(other.duplicates);
    }

    /// Every processed document was either retained or removed.
    pub fn is_conserved(&self) -> bool {
        self.docs_processed == self.docs_retained + self.docs_removed
    }

    pub fn is_zero(&self) -> bool {
        *self == DedupStats::default()
    }
}

impl AddAssign for DedupStats {
    fn add_assign(&mut self, other: DedupStats) {
        self.merge(other);
    }
}

impl Add for DedupStats {
    type Output = DedupStats;

    fn add(mut self, other: DedupStats) -> DedupStats {
        self.merge(other);
        self
    }
}

impl Sum for DedupStats {
    fn sum<I: Iterator<Item = DedupStats>>(iter: I) -> Self {
        iter.fold(DedupStats::default(), Add::add)
    }
}

/// Run-level result: the combined statistics of every completed partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub stats: DedupStats,
    pub partitions_deduplicated: u64,
    pub partitions_skipped: u64,
    pub partition_retries: u64,
}

impl RunSummary {
    pub fn record(&mut self, partition: &PartitionSummary) {
        match partition.status {
            PartitionStatus::Deduplicated => self.partitions_deduplicated += 1,
            PartitionStatus::MissingContentColumn => self.partitions_skipped += 1,
        }
        self.stats.merge(partition.stats.clone());
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.stats.merge(other.stats);
        self.partitions_deduplicated += other.partitions_deduplicated;
        self.partitions_skipped += other.partitions_skipped;
        self.partition_retries += other.partition_retries;
    }

    pub fn partitions_completed(&self) -> u64 {
        self.partitions_deduplicated + self.partitions_skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn stats(processed: u64, removed: u64, bytes: u64) -> DedupStats {
        DedupStats {
            docs_processed: processed,
            docs_retained: processed - removed,
            docs_removed: removed,
            bytes_removed: bytes,
            ..Default::default()
        }
    }

    fn record(partition: &str, removed: u64, survivor: u64) -> DuplicateRecord {
        DuplicateRecord {
            removed: RowRef::new(Arc::from(partition), removed),
            survivor: RowRef::new(Arc::from("p0"), survivor),
        }
    }

    #[test]
    fn test_merge_is_commutative() {
        let mut a = stats(5, 2, 10);
        a.duplicates.insert(record("p1", 3, 0));
        let mut b = stats(7, 1, 4);
        b.duplicates.insert(record("p2", 0, 1));

        assert_eq!(a.clone() + b.clone(), b + a);
    }

    #[test]
    fn test_merge_is_associative() {
        let a = stats(5, 2, 10);
        let b = stats(7, 1, 4);
        let c = stats(1, 0, 0);

        assert_eq!(
            (a.clone() + b.clone()) + c.clone(),
            a + (b + c)
        );
    }

    #[test]
    fn test_sum_preserves_conservation() {
        let total: DedupStats = vec![stats(5, 2, 10), stats(7, 1, 4), DedupStats::default()]
            .into_iter()
            .sum();

        assert_eq!(total.docs_processed, 12);
        assert_eq!(total.docs_removed, 3);
        assert_eq!(total.bytes_removed, 14);
        assert!(total.is_conserved());
    }

    #[test]
    fn test_duplicates_are_unioned() {
        let mut a = DedupStats::default();
        a.duplicates.insert(record("p1", 3, 0));
        let mut b = DedupStats::default();
        b.duplicates.insert(record("p1", 3, 0));
        b.duplicates.insert(record("p1", 4, 0));

        assert_eq!((a + b).duplicates.len(), 2);
    }

    #[test]
    fn test_empty_duplicates_are_not_serialized() {
        let json = serde_json::to_value(stats(2, 1, 3)).unwrap();

        assert!(json.get("duplicates").is_none());
        assert_eq!(json["docs_processed"], 2);
        assert_eq!(json["docs_removed"], 1);
        assert_eq!(json["bytes_removed"], 3);
    }

    #[test]
    fn test_run_summary_records_partitions() {
        let mut summary = RunSummary::default();
        summary.record(&PartitionSummary {
            partition: Arc::from("p0"),
            status: PartitionStatus::Deduplicated,
            stats: stats(5, 2, 2),
        });
        summary.record(&PartitionSummary {
            partition: Arc::from("p1"),
            status: PartitionStatus::MissingContentColumn,
            stats: DedupStats::default(),
        });

        assert_eq!(summary.partitions_deduplicated, 1);
        assert_eq!(summary.partitions_skipped, 1);
        assert_eq!(summary.partitions_completed(), 2);
        assert_eq!(summary.stats, stats(5, 2, 2));
    }

    #[test]
    fn test_run_summary_flattens_stats() {
        let summary = RunSummary {
            stats: stats(3, 1, 1),
            partitions_deduplicated: 1,
            ..Default::default()
        };
        let json = serde_json::to_value(&summary).unwrap();

        assert_eq!(json["docs_processed"], 3);
        assert_eq!(json["partitions_deduplicated"], 1);
        assert_eq!(
            serde_json::from_value::<RunSummary>(json).unwrap(),
            summary
        );
    }
}
