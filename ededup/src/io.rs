//! Where partitions come from and where filtered partitions go.
//!
//! The engine only needs rows and a place to put the survivors; the
//! [`PartitionSource`] and [`PartitionSink`] traits are that seam. Failures
//! behind them are treated as transient and the partition is retried.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tracing::warn;

use crate::stats::RunSummary;
use crate::table::{Row, Table};
use crate::worker::PartitionOutcome;

const PARTITION_EXTENSION: &str = "jsonl";
const RUN_METADATA_FILE: &str = "metadata.json";

#[async_trait]
pub trait PartitionSource: Send + Sync {
    /// Identifiers of every partition of the corpus.
    async fn partitions(&self) -> Result<Vec<String>>;

    async fn load(&self, partition: &str) -> Result<Table>;
}

#[async_trait]
pub trait PartitionSink: Send + Sync {
    /// Persist a filtered partition and its metadata record. Writing the same
    /// partition again replaces the earlier output.
    async fn write(&self, outcome: &PartitionOutcome) -> Result<()>;
}

/// Partitions held in memory, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    partitions: Vec<(String, Table)>,
}

impl MemorySource {
    pub fn new(partitions: impl IntoIterator<Item = (String, Table)>) -> Self {
        Self {
            partitions: partitions.into_iter().collect(),
        }
    }
}

#[async_trait]
impl PartitionSource for MemorySource {
    async fn partitions(&self) -> Result<Vec<String>> {
        Ok(self.partitions.iter().map(|(id, _)| id.clone()).collect())
    }

    async fn load(&self, partition: &str) -> Result<Table> {
        self.partitions
            .iter()
            .find(|(id, _)| id == partition)
            .map(|(_, table)| table.clone())
            .ok_or_else(|| anyhow!("unknown partition {partition}"))
    }
}

/// Collects outcomes in memory, keyed by partition.
#[derive(Debug, Default)]
pub struct MemorySink {
    outcomes: Mutex<BTreeMap<String, PartitionOutcome>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcome(&self, partition: &str) -> Option<PartitionOutcome> {
        self.outcomes
            .lock()
            .ok()
            .and_then(|outcomes| outcomes.get(partition).cloned())
    }

    /// Every written outcome, ordered by partition.
    pub fn outcomes(&self) -> Vec<PartitionOutcome> {
        self.outcomes
            .lock()
            .map(|outcomes| outcomes.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PartitionSink for MemorySink {
    async fn write(&self, outcome: &PartitionOutcome) -> Result<()> {
        let mut outcomes = self
            .outcomes
            .lock()
            .map_err(|_| anyhow!("memory sink lock poisoned"))?;
        outcomes.insert(outcome.partition.to_string(), outcome.clone());
        Ok(())
    }
}

/// A directory of `<partition>.jsonl` files, one JSON object per line.
///
/// JSON lines carry no schema, so a partition's columns are the keys found
/// in its rows. An empty file therefore lacks the content column. Lines that
/// are not JSON objects are skipped and counted on the table.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    dir: PathBuf,
}

impl JsonLinesSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, partition: &str) -> PathBuf {
        partition_path(&self.dir, partition)
    }
}

fn partition_path(dir: &Path, partition: &str) -> PathBuf {
    dir.join(format!("{partition}.{PARTITION_EXTENSION}"))
}

#[async_trait]
impl PartitionSource for JsonLinesSource {
    async fn partitions(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to read input directory {}", self.dir.display()))?;

        let mut partitions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PARTITION_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                partitions.push(stem.to_owned());
            }
        }
        partitions.sort();
        Ok(partitions)
    }

    async fn load(&self, partition: &str) -> Result<Table> {
        let path = self.path(partition);
        let data = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;

        let mut rows = Vec::new();
        let mut malformed = 0;
        for (n, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Row>(line) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!(
                        partition,
                        line = n + 1,
                        error = %e,
                        "skipping record that is not a JSON object"
                    );
                    malformed += 1;
                }
            }
        }

        Ok(Table::from_rows(rows).with_malformed_rows(malformed))
    }
}

/// Writes `<partition>.jsonl` with the retained rows and
/// `<partition>.metadata.json` with the partition's statistics.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    dir: PathBuf,
}

impl JsonLinesSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write the run-level summary to `metadata.json`.
    pub async fn write_run_summary(&self, summary: &RunSummary) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let path = self.dir.join(RUN_METADATA_FILE);
        let json = serde_json::to_vec_pretty(summary)?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

#[async_trait]
impl PartitionSink for JsonLinesSink {
    async fn write(&self, outcome: &PartitionOutcome) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let mut rows = Vec::new();
        for row in &outcome.table.rows {
            serde_json::to_writer(&mut rows, row)?;
            rows.push(b'\n');
        }
        let path = partition_path(&self.dir, &outcome.partition);
        fs::write(&path, rows)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        let path = self
            .dir
            .join(format!("{}.metadata.json", outcome.partition));
        let metadata = serde_json::to_vec_pretty(&outcome.summary())?;
        fs::write(&path, metadata)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }
}
