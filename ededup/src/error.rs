use std::time::Duration;

use thiserror::Error;

use crate::router::ShardIndex;

/// Enumeration of errors raised while validating a deduplication run configuration.
/// Any of these stops the run before a single shard is started.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("the number of shards must be at least 1")]
    InvalidShardCount,
    #[error("the number of workers must be at least 1")]
    InvalidWorkerCount,
    #[error("the content column name must not be empty")]
    EmptyContentColumn,
    #[error("the shard resource hint must be a positive number, got {0}")]
    InvalidResourceHint(f64),
    #[error("the maximum number of partition attempts must be at least 1")]
    InvalidMaxAttempts,
    #[error("the shard queue capacity must be at least 1")]
    InvalidQueueCapacity,
    #[error("{0} is not a valid registry mode, expected `actor` or `mutex`")]
    UnknownRegistryMode(String),
    #[error("{0} is not a valid normalization, expected `exact` or `canonical`")]
    UnknownNormalization(String),
    #[error("input and output directory are both {0}")]
    SameInputOutputDir(String),
}

/// Enumeration of errors related to reaching a shard registry.
/// A shard that cannot answer means duplicates in its slice of the
/// fingerprint space can no longer be detected, so these are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    #[error("shard {shard} is unavailable")]
    Unavailable { shard: ShardIndex },
    #[error("shard {shard} lock was poisoned by a panicking caller")]
    Poisoned { shard: ShardIndex },
    #[error("shard {shard} task stopped unexpectedly")]
    Crashed { shard: ShardIndex },
}

/// Enumeration of errors related to processing a single partition.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a shard registry could not be reached")]
    Shard(#[from] ShardError),
    #[error("failed to load partition {partition}")]
    Source {
        partition: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to write partition {partition}")]
    Sink {
        partition: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("partition {partition} did not complete within {timeout:?}")]
    Timeout {
        partition: String,
        timeout: Duration,
    },
}

impl WorkerError {
    /// Whether processing the partition again from scratch could succeed.
    /// Shard failures are excluded as they invalidate the whole run.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, WorkerError::Shard(_))
    }
}

/// Enumeration of errors that fail a whole deduplication run.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("failed to list corpus partitions")]
    Listing(#[source] anyhow::Error),
    #[error("a shard registry was lost, duplicates can no longer be detected")]
    Shard(#[from] ShardError),
    #[error("partition {partition} failed after {attempts} attempt(s)")]
    PartitionFailed {
        partition: String,
        attempts: u32,
        #[source]
        source: WorkerError,
    },
    #[error("a worker task panicked")]
    WorkerPanicked(#[source] tokio::task::JoinError),
    #[error("all workers exited with {remaining} partition(s) outstanding")]
    WorkersExited { remaining: usize },
}
