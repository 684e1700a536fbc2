pub mod buildkite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use buildkite::types::BuildRecord;

/// Coordinates of one page of builds for one pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub pipeline: &'a str,
    /// 1-based.
    pub page: u32,
    pub per_page: u32,
    pub created_from: DateTime<Utc>,
}

/// Anything that can hand back a single page of build records.
///
/// Implementations do not retry; the caller decides what a failed page means.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        request: &PageRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<BuildRecord>>;
}
