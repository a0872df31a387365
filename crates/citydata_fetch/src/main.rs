mod config;
mod districts;
mod extract;
mod fetch;

use crate::config::Config;
use crate::fetch::{fetch_all, FetchOptions};
use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = Config::parse();
    tracing::info!(config = ?config, "Loaded configuration");

    let districts = districts::resolve(
        config.base_url.as_deref(),
        config.manifest.as_deref(),
        &config.only,
    )?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let opts = FetchOptions {
        output_dir: config.output_dir.clone(),
        retries: config.retries,
        backoff: Duration::from_millis(config.backoff_ms),
        overwrite: config.overwrite,
        keep_archives: config.keep_archives,
    };

    let total = districts.len();
    let report = fetch_all(client, districts, opts, config.concurrency).await?;

    tracing::info!(
        total,
        fetched = report.fetched.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        output_dir = %config.output_dir.display(),
        "Fetch finished"
    );

    if !report.is_success() {
        let names: Vec<&str> = report.failed.iter().map(|(n, _)| n.as_str()).collect();
        anyhow::bail!("{} district(s) failed: {}", names.len(), names.join(", "));
    }
    Ok(())
}
