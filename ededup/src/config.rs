use std::num::NonZeroUsize;
use std::path::{Component, Path};
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::error::ConfigError;
use crate::fingerprint::Normalization;
use crate::shard::RegistryMode;

pub const DEFAULT_CONTENT_COLUMN: &str = "contents";

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "contents")]
    pub content_column_name: String,

    #[envconfig(default = "2")]
    pub num_shards: usize,

    // CPU reservation per shard, only a scheduling hint for the deployment
    #[envconfig(default = "0.5")]
    pub shard_resource_hint: f64,

    #[envconfig(default = "4")]
    pub num_workers: usize,

    #[envconfig(default = "actor")]
    pub registry_mode: RegistryMode,

    #[envconfig(default = "1024")]
    pub shard_queue_capacity: usize,

    #[envconfig(default = "exact")]
    pub normalization: Normalization,

    #[envconfig(default = "false")]
    pub audit_duplicates: bool,

    #[envconfig(default = "3")]
    pub max_partition_attempts: u32,

    #[envconfig(default = "300000")] // 5 minutes
    pub partition_timeout_ms: EnvMsDuration,

    #[envconfig(default = "./input")]
    pub input_dir: String,

    #[envconfig(default = "./output")]
    pub output_dir: String,

    #[envconfig(default = "text")]
    pub log_format: String,

    // Legacy job option names. When set they take precedence over
    // CONTENT_COLUMN_NAME, NUM_SHARDS and SHARD_RESOURCE_HINT.
    pub doc_column: Option<String>,
    pub num_hashes: Option<usize>,
    pub hash_cpu: Option<f64>,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    /// Refuse to write into the directory partitions are read from: output
    /// files would replace input files that are still to be loaded or retried.
    pub fn check_directories(&self) -> Result<(), ConfigError> {
        if same_directory(Path::new(&self.input_dir), Path::new(&self.output_dir)) {
            return Err(ConfigError::SameInputOutputDir(self.input_dir.clone()));
        }
        Ok(())
    }

    /// The engine settings held in this configuration, validated.
    pub fn to_dedup_config(&self) -> Result<DedupConfig, ConfigError> {
        let config = DedupConfig {
            content_column: self
                .doc_column
                .clone()
                .unwrap_or_else(|| self.content_column_name.clone()),
            num_shards: self.num_hashes.unwrap_or(self.num_shards),
            shard_resource_hint: self.hash_cpu.unwrap_or(self.shard_resource_hint),
            num_workers: self.num_workers,
            registry_mode: self.registry_mode,
            shard_queue_capacity: self.shard_queue_capacity,
            normalization: self.normalization,
            audit_duplicates: self.audit_duplicates,
            max_partition_attempts: self.max_partition_attempts,
            partition_timeout: self.partition_timeout_ms.0,
        };
        config.validate()?;
        Ok(config)
    }
}

fn same_directory(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        // The output directory may not exist yet.
        _ => lexical_components(a) == lexical_components(b),
    }
}

fn lexical_components(path: &Path) -> Vec<Component<'_>> {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

/// Settings of one deduplication run.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupConfig {
    /// Column whose text is fingerprinted.
    pub content_column: String,
    /// Number of shard registries. Fixed for the whole run.
    pub num_shards: usize,
    /// Resource reservation per shard, consumed by the deployment layer.
    pub shard_resource_hint: f64,
    /// Size of the worker pool, independent of `num_shards`.
    pub num_workers: usize,
    pub registry_mode: RegistryMode,
    /// Bound of each actor shard's request queue.
    pub shard_queue_capacity: usize,
    pub normalization: Normalization,
    /// Record which row survived for every removed row.
    pub audit_duplicates: bool,
    /// Attempts per partition before a retryable failure fails the run.
    pub max_partition_attempts: u32,
    pub partition_timeout: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            content_column: DEFAULT_CONTENT_COLUMN.to_owned(),
            num_shards: 2,
            shard_resource_hint: 0.5,
            num_workers: 4,
            registry_mode: RegistryMode::Actor,
            shard_queue_capacity: 1024,
            normalization: Normalization::Exact,
            audit_duplicates: false,
            max_partition_attempts: 3,
            partition_timeout: Duration::from_secs(300),
        }
    }
}

impl DedupConfig {
    pub fn with_content_column(mut self, column: impl Into<String>) -> Self {
        self.content_column = column.into();
        self
    }

    pub fn with_num_shards(mut self, num_shards: usize) -> Self {
        self.num_shards = num_shards;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_registry_mode(mut self, mode: RegistryMode) -> Self {
        self.registry_mode = mode;
        self
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_audit(mut self, audit: bool) -> Self {
        self.audit_duplicates = audit;
        self
    }

    pub fn with_max_partition_attempts(mut self, attempts: u32) -> Self {
        self.max_partition_attempts = attempts;
        self
    }

    pub fn with_partition_timeout(mut self, timeout: Duration) -> Self {
        self.partition_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.content_column.trim().is_empty() {
            return Err(ConfigError::EmptyContentColumn);
        }
        if self.num_shards == 0 {
            return Err(ConfigError::InvalidShardCount);
        }
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidWorkerCount);
        }
        if !self.shard_resource_hint.is_finite() || self.shard_resource_hint <= 0.0 {
            return Err(ConfigError::InvalidResourceHint(self.shard_resource_hint));
        }
        if self.shard_queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }
        if self.max_partition_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts);
        }
        Ok(())
    }

    pub fn shard_count(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.num_shards).ok_or(ConfigError::InvalidShardCount)
    }
}
