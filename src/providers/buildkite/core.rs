use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Months, Utc};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use super::cache::{Cached, ResultCache};
use super::client::BuildkiteClient;
use super::metrics::{counted_builds, daily_series, weekly_series};
use super::pipelines::{fetch_pipelines, FetchStatus, PartialResult};
use super::rate_limiter::RateLimiter;
use super::types::BuildRecord;
use crate::config::{Credentials, FetchSettings};
use crate::error::{KpiError, Result};
use crate::insights::{BuildMetrics, MetricsMeta};
use crate::providers::PageSource;

/// The merged build history of every tracked pipeline, as last fetched.
#[derive(Debug)]
pub struct BuildSnapshot {
    pub records: Vec<BuildRecord>,
    pub status: FetchStatus,
    pub failed_pages: usize,
    pub failed_pipelines: Vec<String>,
}

impl TryFrom<PartialResult> for BuildSnapshot {
    type Error = KpiError;

    /// Anything short of every request failing is still a usable snapshot.
    fn try_from(outcome: PartialResult) -> Result<Self> {
        let status = outcome.status();
        let failed_pages = outcome.failures.len();

        if status == FetchStatus::Failed {
            let cause = match outcome.failures.into_iter().next() {
                Some(failure) => {
                    warn!(
                        "[Buildkite] Every request failed, first at page {} of {}",
                        failure.page, failure.pipeline
                    );
                    failure.error
                }
                None => KpiError::Cancelled,
            };
            return Err(KpiError::Fetch {
                failures: failed_pages,
                source: Box::new(cause),
            });
        }

        Ok(Self {
            records: outcome.records,
            status,
            failed_pages,
            failed_pipelines: outcome.failed_pipelines,
        })
    }
}

pub struct BuildkiteProvider<S = BuildkiteClient> {
    source: S,
    org: String,
    settings: FetchSettings,
    cache: ResultCache<BuildSnapshot>,
}

impl BuildkiteProvider<BuildkiteClient> {
    pub fn new(base_url: &str, credentials: Credentials, settings: FetchSettings) -> Result<Self> {
        settings.validate()?;

        let limiter = Arc::new(RateLimiter::per_minute(settings.requests_per_minute));
        info!(
            "Pacing Buildkite requests at one every {:?}",
            limiter.period()
        );

        let org = credentials.org.clone();
        let client = BuildkiteClient::new(base_url, credentials, limiter)?;

        Ok(Self::with_source(client, org, settings))
    }
}

impl<S: PageSource> BuildkiteProvider<S> {
    pub fn with_source(source: S, org: String, settings: FetchSettings) -> Self {
        let cache = ResultCache::new(settings.cache_ttl).with_stale_on_error(settings.serve_stale);

        Self {
            source,
            org,
            settings,
            cache,
        }
    }

    fn created_from(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        now.checked_sub_months(Months::new(self.settings.window_months))
            .ok_or_else(|| {
                KpiError::InvalidConfig(format!(
                    "fetch window of {} months is out of range",
                    self.settings.window_months
                ))
            })
    }

    /// Merged builds of every tracked pipeline, from the cache while it is fresh.
    ///
    /// The cache is shared by every caller regardless of `created_from`.
    pub async fn builds(
        &self,
        created_from: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Cached<BuildSnapshot>> {
        let cached = self
            .cache
            .get_or_refresh(cancel, move || async move {
                let outcome =
                    fetch_pipelines(&self.source, &self.settings, created_from, cancel).await?;
                BuildSnapshot::try_from(outcome)
            })
            .await?;

        if cached.from_cache {
            info!(
                "[Buildkite] Using cached data ({} builds, age: {:?})",
                cached.value.records.len(),
                cached.age
            );
        } else {
            info!(
                "[Buildkite] Updated cache with {} builds",
                cached.value.records.len()
            );
        }

        Ok(cached)
    }

    pub async fn collect_metrics(&self, cancel: &CancellationToken) -> Result<BuildMetrics> {
        self.collect_metrics_at(Utc::now(), cancel).await
    }

    /// Fetches once and reduces the same records into the weekly series (whole
    /// window) and the daily series (trailing `daily_days` before `now`).
    pub async fn collect_metrics_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<BuildMetrics> {
        let created_from = self.created_from(now)?;
        let started = Instant::now();

        let cached = self.builds(created_from, cancel).await?;
        let fetch_duration = started.elapsed();
        let snapshot = &cached.value;

        if cached.stale {
            warn!("[Buildkite] Serving stale builds fetched at {}", cached.fetched_at);
        }

        let weekly = weekly_series(&snapshot.records);
        let daily = daily_series(&snapshot.records, now, self.settings.daily_days);
        let weekly_builds = counted_builds(&weekly.values);
        let daily_builds = counted_builds(&daily.values);

        info!(
            "[Buildkite] Processed in {:?} total (weekly: {weekly_builds} builds, daily: {daily_builds} builds)",
            started.elapsed()
        );

        Ok(BuildMetrics {
            provider: "Buildkite".to_string(),
            collected_at: now,
            weekly,
            daily,
            meta: MetricsMeta {
                org: self.org.clone(),
                total_builds: snapshot.records.len(),
                weekly_builds,
                daily_builds,
                date_range: format!(
                    "last {} months (from {})",
                    self.settings.window_months,
                    created_from.format("%Y-%m-%d")
                ),
                fetch_duration_secs: fetch_duration.as_secs_f64(),
                cached: cached.from_cache,
                stale: cached.stale,
                fetched_at: cached.fetched_at,
                status: snapshot.status,
                failed_pages: snapshot.failed_pages,
                failed_pipelines: snapshot.failed_pipelines.clone(),
            },
        })
    }
}
