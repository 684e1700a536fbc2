use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::buildkite::pipelines::FetchStatus;

/// Columns shared by the weekly and daily series. Index `i` of every column
/// refers to the same bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesValues {
    pub avg_duration_mins: Vec<f64>,
    /// Percentage, 0-100.
    pub failure_rate: Vec<f64>,
    pub passed: Vec<usize>,
    pub failed: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeeklySeries {
    /// ISO-8601 week labels, `YYYY-Www`.
    pub weeks: Vec<String>,
    #[serde(flatten)]
    pub values: SeriesValues,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailySeries {
    /// Calendar days, `YYYY-MM-DD`.
    pub days: Vec<String>,
    #[serde(flatten)]
    pub values: SeriesValues,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsMeta {
    pub org: String,
    pub total_builds: usize,
    pub weekly_builds: usize,
    pub daily_builds: usize,
    pub date_range: String,
    pub fetch_duration_secs: f64,
    pub cached: bool,
    pub stale: bool,
    pub fetched_at: DateTime<Utc>,
    pub status: FetchStatus,
    pub failed_pages: usize,
    pub failed_pipelines: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BuildMetrics {
    pub provider: String,
    pub collected_at: DateTime<Utc>,
    pub weekly: WeeklySeries,
    pub daily: DailySeries,
    pub meta: MetricsMeta,
}
