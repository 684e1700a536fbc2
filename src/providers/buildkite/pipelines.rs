use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::types::BuildRecord;
use crate::config::FetchSettings;
use crate::error::{KpiError, Result};
use crate::providers::{PageRequest, PageSource};

/// Pages of one pipeline requested at the same time. The rate limiter still
/// decides when each request actually goes out.
const PAGE_CONCURRENCY: usize = 5;

#[derive(Debug)]
pub struct PageFailure {
    pub pipeline: String,
    pub page: u32,
    pub error: KpiError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Complete,
    Partial,
    Failed,
}

/// Records gathered so far plus every page that could not be fetched.
#[derive(Debug, Default)]
pub struct PartialResult {
    pub records: Vec<BuildRecord>,
    pub failures: Vec<PageFailure>,
    /// Pipelines that contributed nothing because every attempted page failed.
    pub failed_pipelines: Vec<String>,
    pub(crate) pages_fetched: usize,
}

impl PartialResult {
    fn failed(pipeline: &str, page: u32, error: KpiError) -> Self {
        Self {
            failures: vec![PageFailure {
                pipeline: pipeline.to_string(),
                page,
                error,
            }],
            ..Self::default()
        }
    }

    pub fn status(&self) -> FetchStatus {
        if self.failures.is_empty() {
            FetchStatus::Complete
        } else if self.pages_fetched == 0 {
            FetchStatus::Failed
        } else {
            FetchStatus::Partial
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    fn absorb(&mut self, pipeline: &str, other: Self) {
        if other.status() == FetchStatus::Failed {
            self.failed_pipelines.push(pipeline.to_string());
        }
        self.records.extend(other.records);
        self.failures.extend(other.failures);
        self.failed_pipelines.extend(other.failed_pipelines);
        self.pages_fetched += other.pages_fetched;
    }
}

/// Fetches every page of one pipeline's builds created since `created_from`.
///
/// Page 1 decides whether more pages exist. The rest (up to `max_pages`) are
/// fetched concurrently and reassembled in page order. A failed page is logged
/// and left out; only cancellation aborts the whole fetch.
pub async fn fetch_pipeline<S: PageSource + ?Sized>(
    source: &S,
    pipeline: &str,
    created_from: DateTime<Utc>,
    settings: &FetchSettings,
    cancel: &CancellationToken,
) -> Result<PartialResult> {
    let per_page = settings.per_page;
    let max_pages = settings.max_pages;

    let first = PageRequest {
        pipeline,
        page: 1,
        per_page,
        created_from,
    };
    let first_page = match source.fetch_page(&first, cancel).await {
        Ok(builds) => builds,
        Err(KpiError::Cancelled) => return Err(KpiError::Cancelled),
        Err(error) => {
            warn!("Error fetching page 1 of {pipeline}: {error}");
            return Ok(PartialResult::failed(pipeline, 1, error));
        }
    };

    if first_page.len() < per_page as usize || max_pages == 1 {
        info!(
            "Total builds fetched from {pipeline}: {} (1 page)",
            first_page.len()
        );
        return Ok(PartialResult {
            records: first_page,
            pages_fetched: 1,
            ..PartialResult::default()
        });
    }

    // Highest page that may still hold builds. Lowered when a page comes back
    // short so pages beyond it are never requested.
    let last_page = AtomicU32::new(max_pages);

    let responses: Vec<(u32, Option<Result<Vec<BuildRecord>>>)> = stream::iter(2..=max_pages)
        .map(|page| {
            let last_page = &last_page;
            async move {
                if page > last_page.load(Ordering::Acquire) {
                    return (page, None);
                }

                let request = PageRequest {
                    pipeline,
                    page,
                    per_page,
                    created_from,
                };
                let result = source.fetch_page(&request, cancel).await;

                if let Ok(builds) = &result {
                    if builds.is_empty() {
                        last_page.fetch_min(page - 1, Ordering::AcqRel);
                    } else if builds.len() < per_page as usize {
                        last_page.fetch_min(page, Ordering::AcqRel);
                    }
                }
                (page, Some(result))
            }
        })
        .buffer_unordered(PAGE_CONCURRENCY)
        .collect()
        .await;

    if cancel.is_cancelled() {
        return Err(KpiError::Cancelled);
    }

    let mut slots: Vec<Option<Vec<BuildRecord>>> = (0..max_pages).map(|_| None).collect();
    slots[0] = Some(first_page);

    let mut outcome = PartialResult {
        pages_fetched: 1,
        ..PartialResult::default()
    };

    for (page, response) in responses {
        match response {
            None => debug!("Skipped page {page} of {pipeline}: past the last page"),
            Some(Ok(builds)) => {
                outcome.pages_fetched += 1;
                if !builds.is_empty() {
                    slots[(page - 1) as usize] = Some(builds);
                }
            }
            Some(Err(error)) => {
                warn!("Error fetching page {page} of {pipeline}: {error}");
                outcome.failures.push(PageFailure {
                    pipeline: pipeline.to_string(),
                    page,
                    error,
                });
            }
        }
    }

    let filled = slots.iter().filter(|s| s.is_some()).count();
    outcome.records = slots.into_iter().flatten().flatten().collect();

    info!(
        "Total builds fetched from {pipeline}: {} ({filled} pages in parallel, {} failed)",
        outcome.records.len(),
        outcome.failures.len()
    );
    Ok(outcome)
}

/// Fetches every configured pipeline in turn and concatenates the records.
///
/// A pipeline that fails entirely is logged and skipped so the others still
/// count. Records are grouped by pipeline, in page order within each.
pub async fn fetch_pipelines<S: PageSource + ?Sized>(
    source: &S,
    settings: &FetchSettings,
    created_from: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<PartialResult> {
    let mut merged = PartialResult::default();

    for pipeline in settings.pipelines.iter().filter(|p| !p.trim().is_empty()) {
        if cancel.is_cancelled() {
            return Err(KpiError::Cancelled);
        }

        let outcome = fetch_pipeline(source, pipeline, created_from, settings, cancel).await?;
        match outcome.status() {
            FetchStatus::Complete => {}
            FetchStatus::Partial => warn!(
                "Partial data from {pipeline}: {} pages failed",
                outcome.failures.len()
            ),
            FetchStatus::Failed => {
                warn!("Failed to fetch from {pipeline}, continuing with remaining pipelines");
            }
        }
        merged.absorb(pipeline, outcome);
    }

    info!(
        "Total builds fetched from all pipelines: {} ({} pages)",
        merged.records.len(),
        merged.pages_fetched()
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::buildkite::testing::{build, passed_builds, MockPage, MockSource};
    use crate::providers::buildkite::types::BuildState;
    use chrono::TimeZone;
    use std::time::Duration;

    fn settings(pipelines: &[&str], per_page: u32, max_pages: u32) -> FetchSettings {
        FetchSettings {
            pipelines: pipelines.iter().map(ToString::to_string).collect(),
            per_page,
            max_pages,
            ..FetchSettings::default()
        }
    }

    fn created_from() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn numbers(records: &[BuildRecord]) -> Vec<u64> {
        records.iter().map(|r| r.number).collect()
    }

    #[tokio::test]
    async fn test_short_first_page_is_the_only_page() {
        let source = MockSource::new().page("deploy", 1, passed_builds("deploy", 1, 3));

        let outcome = fetch_pipeline(
            &source,
            "deploy",
            created_from(),
            &settings(&["deploy"], 5, 10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(numbers(&outcome.records), vec![1, 2, 3]);
        assert_eq!(outcome.status(), FetchStatus::Complete);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_single_page_ceiling_skips_fan_out() {
        let source = MockSource::new().page("deploy", 1, passed_builds("deploy", 1, 2));

        let outcome = fetch_pipeline(
            &source,
            "deploy",
            created_from(),
            &settings(&["deploy"], 2, 1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pages_reassembled_in_page_order_regardless_of_arrival() {
        // Later pages answer first.
        let source = MockSource::new()
            .page("deploy", 1, passed_builds("deploy", 1, 2))
            .delayed_page("deploy", 2, passed_builds("deploy", 3, 2), Duration::from_millis(300))
            .delayed_page("deploy", 3, passed_builds("deploy", 5, 2), Duration::from_millis(200))
            .delayed_page("deploy", 4, passed_builds("deploy", 7, 1), Duration::from_millis(100));

        let parallel = fetch_pipeline(
            &source,
            "deploy",
            created_from(),
            &settings(&["deploy"], 2, 4),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut sequential = Vec::new();
        for page in 1..=4 {
            let request = PageRequest {
                pipeline: "deploy",
                page,
                per_page: 2,
                created_from: created_from(),
            };
            sequential.extend(
                source
                    .fetch_page(&request, &CancellationToken::new())
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(parallel.records, sequential);
        assert_eq!(numbers(&parallel.records), vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_failed_page_is_dropped_and_reported() {
        let source = MockSource::new()
            .page("deploy", 1, passed_builds("deploy", 1, 2))
            .failing_page("deploy", 2, MockPage::Status(502))
            .page("deploy", 3, passed_builds("deploy", 5, 1));

        let outcome = fetch_pipeline(
            &source,
            "deploy",
            created_from(),
            &settings(&["deploy"], 2, 3),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(numbers(&outcome.records), vec![1, 2, 5]);
        assert_eq!(outcome.status(), FetchStatus::Partial);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].page, 2);
        assert!(matches!(
            outcome.failures[0].error,
            KpiError::Upstream { status: 502, .. }
        ));
    }

    #[tokio::test]
    async fn test_first_page_failure_fails_pipeline_without_error() {
        let source = MockSource::new().failing_page("deploy", 1, MockPage::Status(500));

        let outcome = fetch_pipeline(
            &source,
            "deploy",
            created_from(),
            &settings(&["deploy"], 2, 5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.records.is_empty());
        assert_eq!(outcome.status(), FetchStatus::Failed);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_page_stops_later_pages() {
        // Page 2 comes back empty while pages 3-6 are still in flight, so
        // pages beyond the worker pool are never requested.
        let source = MockSource::new()
            .page("deploy", 1, passed_builds("deploy", 1, 2))
            .delayed_page("deploy", 2, Vec::new(), Duration::from_millis(10))
            .delayed_page("deploy", 3, passed_builds("deploy", 5, 2), Duration::from_millis(50))
            .delayed_page("deploy", 4, passed_builds("deploy", 7, 2), Duration::from_millis(50))
            .delayed_page("deploy", 5, passed_builds("deploy", 9, 2), Duration::from_millis(50))
            .delayed_page("deploy", 6, passed_builds("deploy", 11, 2), Duration::from_millis(50));

        let outcome = fetch_pipeline(
            &source,
            "deploy",
            created_from(),
            &settings(&["deploy"], 2, 10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let requested = source.requested_pages("deploy");
        assert!(!requested.contains(&7));
        assert!(!requested.contains(&10));
        // In-flight pages that still returned builds are kept.
        assert_eq!(
            numbers(&outcome.records),
            vec![1, 2, 5, 6, 7, 8, 9, 10, 11, 12]
        );
        assert_eq!(outcome.status(), FetchStatus::Complete);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_returns_error() {
        let source = MockSource::new().page("deploy", 1, passed_builds("deploy", 1, 2));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = fetch_pipeline(
            &source,
            "deploy",
            created_from(),
            &settings(&["deploy"], 2, 5),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(KpiError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_pages_in_flight_aborts_promptly() {
        let slow = Duration::from_secs(30);
        let source = MockSource::new()
            .page("deploy", 1, passed_builds("deploy", 1, 2))
            .delayed_page("deploy", 2, passed_builds("deploy", 3, 2), slow)
            .delayed_page("deploy", 3, passed_builds("deploy", 5, 2), slow)
            .delayed_page("deploy", 4, passed_builds("deploy", 7, 2), slow)
            .delayed_page("deploy", 5, passed_builds("deploy", 9, 2), slow);
        let settings = settings(&["deploy"], 2, 5);
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let (result, ()) = tokio::join!(
            fetch_pipeline(&source, "deploy", created_from(), &settings, &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        );

        assert!(matches!(result, Err(KpiError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(source.requested_pages("deploy"), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_broken_pipeline_does_not_blank_out_others() {
        let source = MockSource::new()
            .page("core", 1, passed_builds("core", 1, 2))
            .page("core", 2, vec![build(
                3,
                "core",
                BuildState::Failed,
                None,
                Some("2024-06-04T10:00:00Z"),
            )])
            .failing_page("legacy", 1, MockPage::ConnectionRefused)
            .failing_page("legacy", 2, MockPage::ConnectionRefused);

        let merged = fetch_pipelines(
            &source,
            &settings(&["core", "legacy"], 2, 3),
            created_from(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(numbers(&merged.records), vec![1, 2, 3]);
        assert!(merged.records.iter().all(|r| r.pipeline.slug == "core"));
        assert_eq!(merged.failed_pipelines, vec!["legacy".to_string()]);
        assert_eq!(merged.status(), FetchStatus::Partial);
        assert!(matches!(merged.failures[0].error, KpiError::Transport(_)));
    }

    #[tokio::test]
    async fn test_every_pipeline_failing_is_total_failure() {
        let source = MockSource::new()
            .failing_page("core", 1, MockPage::Status(503))
            .failing_page("legacy", 1, MockPage::Status(503));

        let merged = fetch_pipelines(
            &source,
            &settings(&["core", "legacy"], 2, 3),
            created_from(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(merged.records.is_empty());
        assert_eq!(merged.status(), FetchStatus::Failed);
        assert_eq!(merged.failures.len(), 2);
        assert_eq!(merged.failed_pipelines.len(), 2);
    }

    #[tokio::test]
    async fn test_no_builds_at_all_is_complete() {
        let source = MockSource::new();

        let merged = fetch_pipelines(
            &source,
            &settings(&["core", "legacy"], 2, 3),
            created_from(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(merged.records.is_empty());
        assert_eq!(merged.status(), FetchStatus::Complete);
        assert_eq!(merged.pages_fetched(), 2);
    }
}
