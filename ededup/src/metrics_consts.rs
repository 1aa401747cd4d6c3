// ==== Document metrics ====
/// Counter for documents read from partitions
pub const DOCUMENTS_TOTAL_COUNTER: &str = "ededup_documents_total";

/// Counter for documents dropped as duplicates
pub const DOCUMENTS_REMOVED_COUNTER: &str = "ededup_documents_removed_total";

/// Counter for content bytes dropped with duplicate documents
pub const BYTES_REMOVED_COUNTER: &str = "ededup_bytes_removed_total";

/// Counter for documents passed through because their content is not text
pub const DOCUMENTS_UNFINGERPRINTABLE_COUNTER: &str = "ededup_documents_unfingerprintable_total";

/// Counter for source records dropped because they could not be parsed
pub const DOCUMENTS_MALFORMED_COUNTER: &str = "ededup_documents_malformed_total";

// ==== Partition metrics ====
/// Counter for partitions skipped because the content column is missing
pub const PARTITIONS_SKIPPED_COUNTER: &str = "ededup_partitions_skipped_total";

/// Counter for partition attempts that failed and were queued again
pub const PARTITION_RETRIES_COUNTER: &str = "ededup_partition_retries_total";

/// Histogram for the time taken to deduplicate one partition
pub const PARTITION_DURATION_HISTOGRAM: &str = "ededup_partition_duration_seconds";

/// Gauge for partitions not yet completed in the current run
pub const PARTITIONS_REMAINING_GAUGE: &str = "ededup_partitions_remaining";

// ==== Shard metrics ====
/// Counter for check-and-insert calls, labelled by decision (admitted/duplicate)
pub const SHARD_ADMISSIONS_TOTAL: &str = "ededup_shard_admissions_total";
