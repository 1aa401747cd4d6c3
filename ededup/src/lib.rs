//! Exact deduplication of a partitioned document corpus.
//!
//! Every document's content is fingerprinted and offered to the shard
//! registry owning that fingerprint; only the first offer in a run is
//! admitted, every later one is a duplicate and its row is dropped. Many
//! workers process disjoint partitions concurrently against the same
//! registries, and a [`coordinator::Coordinator`] aggregates their statistics.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use
//! formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}`, the full chain on one line.
//! - **Structured field:** `error = ?e`, the full chain with `Caused by:` sections (Debug).
//!
//! When constructing errors, use `.context()` / `.with_context()` so the
//! original error remains the source.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod io;
pub mod metrics_consts;
pub mod router;
pub mod shard;
pub mod stats;
pub mod table;
pub mod worker;

// Re-export commonly used types for convenience
pub use config::{Config, DedupConfig};
pub use coordinator::Coordinator;
pub use error::{ConfigError, CoordinatorError, ShardError, WorkerError};
pub use fingerprint::{Fingerprint, Fingerprinter, Normalization};
pub use shard::{AdmissionDecision, AdmissionRegistry, RegistryMode};
pub use stats::{DedupStats, RunSummary};
pub use table::{RowRef, Table};
