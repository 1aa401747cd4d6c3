//! Deduplicate a directory of JSON-lines partitions into an output directory.
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ededup::config::Config;
use ededup::coordinator::Coordinator;
use ededup::io::{JsonLinesSink, JsonLinesSource};

fn setup_tracing(json: bool) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_filter(filter())
            .boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    setup_tracing(config.json_logs());
    info!("Configuration loaded: {:?}", config);

    config
        .check_directories()
        .context("Invalid input/output directories")?;

    let dedup_config = config
        .to_dedup_config()
        .context("Invalid deduplication configuration")?;
    let coordinator = Coordinator::new(dedup_config)?;

    let source = Arc::new(JsonLinesSource::new(&config.input_dir));
    let sink = Arc::new(JsonLinesSink::new(&config.output_dir));

    let summary = coordinator
        .run(source, sink.clone())
        .await
        .context("Deduplication run failed")?;

    sink.write_run_summary(&summary)
        .await
        .context("Failed to write run metadata")?;

    info!(
        output_dir = %config.output_dir,
        docs_processed = summary.stats.docs_processed,
        docs_removed = summary.stats.docs_removed,
        "Wrote deduplicated corpus"
    );

    Ok(())
}
