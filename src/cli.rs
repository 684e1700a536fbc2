use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::{Credentials, FetchSettings, DEFAULT_BASE_URL, DEFAULT_PIPELINES, ORG_ENV, TOKEN_ENV};
use crate::insights::BuildMetrics;
use crate::providers::buildkite::BuildkiteProvider;

#[derive(Parser)]
#[command(name = "buildkpi")]
#[command(author, version, about = "Deployment KPI Tool", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output file path (defaults to stdout)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Pretty print JSON output
    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Weekly and daily deployment duration and failure rate from Buildkite
    Buildkite {
        /// Buildkite API access token
        #[arg(short, long, env = TOKEN_ENV, hide_env_values = true)]
        token: Option<String>,

        /// Buildkite organization slug
        #[arg(long, env = ORG_ENV)]
        org: Option<String>,

        /// Buildkite REST API URL
        #[arg(short, long, default_value = DEFAULT_BASE_URL)]
        url: String,

        /// Pipeline slug to include (repeatable)
        #[arg(short = 'P', long = "pipeline", value_name = "SLUG", default_values = DEFAULT_PIPELINES)]
        pipelines: Vec<String>,

        /// Fetch builds created in the last N months
        #[arg(long, default_value_t = 3)]
        months: u32,

        /// Days covered by the daily series
        #[arg(long, default_value_t = 30)]
        daily_days: u32,

        /// Builds requested per page
        #[arg(long, default_value_t = 100)]
        per_page: u32,

        /// Maximum pages fetched per pipeline
        #[arg(long, default_value_t = 10)]
        max_pages: u32,

        /// Advertised API quota; requests are paced at 85% of it
        #[arg(long, default_value_t = 200)]
        requests_per_minute: u32,

        /// Seconds fetched builds are reused before refetching
        #[arg(long, default_value_t = 300)]
        cache_ttl_secs: u64,

        /// Serve the last fetched builds when a refresh fails
        #[arg(long, default_value_t = false)]
        serve_stale: bool,

        /// Recompute every N seconds until interrupted
        #[arg(short, long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
        watch: Option<u64>,
    },
}

impl Cli {
    pub async fn execute(&self) -> Result<()> {
        match &self.command {
            Commands::Buildkite {
                token,
                org,
                url,
                pipelines,
                months,
                daily_days,
                per_page,
                max_pages,
                requests_per_minute,
                cache_ttl_secs,
                serve_stale,
                watch,
            } => {
                let credentials = Credentials::resolve(token.as_deref(), org.as_deref())
                    .context("Service unavailable")?;

                let settings = FetchSettings {
                    pipelines: pipelines.clone(),
                    per_page: *per_page,
                    max_pages: *max_pages,
                    requests_per_minute: *requests_per_minute,
                    window_months: *months,
                    daily_days: *daily_days,
                    cache_ttl: Duration::from_secs(*cache_ttl_secs),
                    serve_stale: *serve_stale,
                };

                info!(
                    "Collecting Buildkite metrics for {} ({})",
                    credentials.org,
                    settings.pipelines.join(", ")
                );
                let provider = BuildkiteProvider::new(url, credentials, settings)?;

                let cancel = CancellationToken::new();
                tokio::spawn({
                    let cancel = cancel.clone();
                    async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            warn!("Interrupted, cancelling in-flight requests");
                            cancel.cancel();
                        }
                    }
                });

                loop {
                    let metrics = match provider.collect_metrics(&cancel).await {
                        Ok(metrics) => metrics,
                        Err(e) if e.is_cancelled() => {
                            info!("Stopped before metrics were collected");
                            return Ok(());
                        }
                        Err(e) => return Err(e).context("Bad gateway"),
                    };
                    self.write_output(&metrics)?;

                    let Some(interval) = watch else {
                        break;
                    };
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(*interval)) => {}
                    }
                }

                Ok(())
            }
        }
    }

    fn write_output(&self, metrics: &BuildMetrics) -> Result<()> {
        let json_output = if self.pretty {
            serde_json::to_string_pretty(metrics)?
        } else {
            serde_json::to_string(metrics)?
        };

        if let Some(output_path) = &self.output {
            std::fs::write(output_path, json_output)?;
            info!("Metrics written to: {}", output_path.display());
        } else {
            println!("{json_output}");
        }

        Ok(())
    }
}
