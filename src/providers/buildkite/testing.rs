//! In-process `PageSource` used by the fetch, cache and provider tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::types::{BuildRecord, BuildState, PipelineRef};
use crate::error::{KpiError, Result};
use crate::providers::{PageRequest, PageSource};

#[derive(Debug, Clone)]
pub enum MockPage {
    Builds { builds: Vec<BuildRecord>, delay: Duration },
    Status(u16),
    ConnectionRefused,
}

/// Pages not registered come back empty.
#[derive(Debug, Default)]
pub struct MockSource {
    pages: HashMap<(String, u32), MockPage>,
    calls: AtomicUsize,
    requested: Mutex<Vec<(String, u32)>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, pipeline: &str, page: u32, builds: Vec<BuildRecord>) -> Self {
        self.pages.insert(
            (pipeline.to_string(), page),
            MockPage::Builds {
                builds,
                delay: Duration::ZERO,
            },
        );
        self
    }

    pub fn delayed_page(
        mut self,
        pipeline: &str,
        page: u32,
        builds: Vec<BuildRecord>,
        delay: Duration,
    ) -> Self {
        self.pages.insert(
            (pipeline.to_string(), page),
            MockPage::Builds { builds, delay },
        );
        self
    }

    pub fn failing_page(mut self, pipeline: &str, page: u32, failure: MockPage) -> Self {
        self.pages.insert((pipeline.to_string(), page), failure);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested_pages(&self, pipeline: &str) -> Vec<u32> {
        let mut pages: Vec<u32> = self
            .requested
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == pipeline)
            .map(|(_, page)| *page)
            .collect();
        pages.sort_unstable();
        pages
    }
}

#[async_trait]
impl PageSource for MockSource {
    async fn fetch_page(
        &self,
        request: &PageRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<BuildRecord>> {
        if cancel.is_cancelled() {
            return Err(KpiError::Cancelled);
        }

        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested
            .lock()
            .unwrap()
            .push((request.pipeline.to_string(), request.page));

        match self.pages.get(&(request.pipeline.to_string(), request.page)) {
            None => Ok(Vec::new()),
            Some(MockPage::Builds { builds, delay }) => {
                if !delay.is_zero() {
                    tokio::select! {
                        () = cancel.cancelled() => return Err(KpiError::Cancelled),
                        () = tokio::time::sleep(*delay) => {}
                    }
                }
                Ok(builds.clone())
            }
            Some(MockPage::Status(status)) => Err(KpiError::Upstream {
                status: *status,
                body: "upstream unavailable".to_string(),
            }),
            Some(MockPage::ConnectionRefused) => {
                let err = reqwest::get("http://127.0.0.1:1/").await.unwrap_err();
                Err(KpiError::Transport(err))
            }
        }
    }
}

pub fn build(
    number: u64,
    pipeline: &str,
    state: BuildState,
    started_at: Option<&str>,
    finished_at: Option<&str>,
) -> BuildRecord {
    BuildRecord {
        id: format!("{pipeline}-{number}"),
        number,
        state,
        created_at: started_at.map(ToString::to_string),
        scheduled_at: None,
        started_at: started_at.map(ToString::to_string),
        finished_at: finished_at.map(ToString::to_string),
        pipeline: PipelineRef {
            slug: pipeline.to_string(),
            name: pipeline.to_string(),
        },
        branch: Some("main".to_string()),
        commit: None,
        message: None,
    }
}

/// `count` passed builds numbered from `first`, all finishing on the same day.
pub fn passed_builds(pipeline: &str, first: u64, count: u64) -> Vec<BuildRecord> {
    (first..first + count)
        .map(|n| {
            build(
                n,
                pipeline,
                BuildState::Passed,
                Some("2024-06-03T10:00:00Z"),
                Some("2024-06-03T10:10:00Z"),
            )
        })
        .collect()
}
