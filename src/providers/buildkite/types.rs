use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Offset without a colon, as some Buildkite endpoints emit it.
const FALLBACK_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Scheduled,
    Running,
    Passed,
    Failed,
    Canceled,
    /// Any state Buildkite adds beyond the ones above (`blocked`, `skipped`, ...).
    #[serde(other)]
    Other,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRef {
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

/// One build as returned by `GET /organizations/{org}/pipelines/{pipeline}/builds`.
///
/// Timestamps stay as the raw strings Buildkite sent; they are parsed lazily so a
/// malformed value only excludes this record from aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: String,
    pub number: u64,
    pub state: BuildState,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub pipeline: PipelineRef,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl BuildRecord {
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at.as_deref().and_then(parse_timestamp)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at.as_deref().and_then(parse_timestamp)
    }

    /// Wall time from start to finish in minutes. `None` unless both ends parse
    /// and the build finished strictly after it started.
    pub fn duration_minutes(&self) -> Option<f64> {
        let started = self.started_at()?;
        let finished = self.finished_at()?;
        if finished <= started {
            return None;
        }

        #[allow(clippy::cast_precision_loss)]
        let minutes = (finished - started).num_microseconds()? as f64 / 60_000_000.0;
        Some(minutes)
    }
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if value.is_empty() {
        return None;
    }

    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, FALLBACK_TIMESTAMP_FORMAT))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
