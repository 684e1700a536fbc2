use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, Utc};
use log::debug;

use super::types::{BuildRecord, BuildState};
use crate::insights::{DailySeries, SeriesValues, WeeklySeries};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketStats {
    /// Minutes, one entry per passed build with a valid start and finish.
    pub durations: Vec<f64>,
    pub passed: usize,
    pub failed: usize,
}

impl BucketStats {
    pub fn avg_duration(&self) -> f64 {
        if self.durations.is_empty() {
            return 0.0;
        }

        #[allow(clippy::cast_precision_loss)]
        let avg = self.durations.iter().sum::<f64>() / self.durations.len() as f64;
        avg
    }

    pub fn failure_rate(&self) -> f64 {
        let total = self.passed + self.failed;
        if total == 0 {
            return 0.0;
        }

        #[allow(clippy::cast_precision_loss)]
        let rate = (self.failed as f64 / total as f64) * 100.0;
        rate
    }
}

/// Buckets keyed by label; `BTreeMap` order is chronological for both label formats.
pub type Buckets = BTreeMap<String, BucketStats>;

pub fn week_key(t: DateTime<Utc>) -> String {
    let week = t.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

pub fn day_key(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d").to_string()
}

/// Groups passed and failed builds by the bucket their `finished_at` falls in.
///
/// Builds in any other state, or without a parseable `finished_at`, are skipped.
/// Only passed builds with a valid duration contribute to `durations`.
pub fn bucket_builds<'a, I, K, F>(builds: I, key: K, keep: F) -> Buckets
where
    I: IntoIterator<Item = &'a BuildRecord>,
    K: Fn(DateTime<Utc>) -> String,
    F: Fn(DateTime<Utc>) -> bool,
{
    let mut buckets = Buckets::new();
    let mut unparseable = 0usize;
    let mut in_progress = 0usize;

    for build in builds {
        if !build.state.is_terminal() {
            in_progress += 1;
            continue;
        }
        if build.state == BuildState::Canceled {
            continue;
        }

        let Some(finished_at) = build.finished_at() else {
            unparseable += 1;
            continue;
        };
        if !keep(finished_at) {
            continue;
        }

        let bucket = buckets.entry(key(finished_at)).or_default();
        if build.state == BuildState::Passed {
            if let Some(minutes) = build.duration_minutes() {
                bucket.durations.push(minutes);
            }
            bucket.passed += 1;
        } else {
            bucket.failed += 1;
        }
    }

    if unparseable > 0 {
        debug!("Skipped {unparseable} finished builds without a parseable finished_at");
    }
    if in_progress > 0 {
        debug!("Skipped {in_progress} builds still running or in an unrecognized state");
    }

    buckets
}

fn series_values(buckets: &Buckets) -> (Vec<String>, SeriesValues) {
    let labels = buckets.keys().cloned().collect();
    let values = SeriesValues {
        avg_duration_mins: buckets.values().map(BucketStats::avg_duration).collect(),
        failure_rate: buckets.values().map(BucketStats::failure_rate).collect(),
        passed: buckets.values().map(|b| b.passed).collect(),
        failed: buckets.values().map(|b| b.failed).collect(),
    };
    (labels, values)
}

/// Average duration and failure rate per ISO week over every build given.
pub fn weekly_series(builds: &[BuildRecord]) -> WeeklySeries {
    let buckets = bucket_builds(builds, week_key, |_| true);
    let (weeks, values) = series_values(&buckets);
    WeeklySeries { weeks, values }
}

/// Same as [`weekly_series`] per calendar day, limited to builds that finished
/// within the `days` before `now`.
pub fn daily_series(builds: &[BuildRecord], now: DateTime<Utc>, days: u32) -> DailySeries {
    let cutoff = now - Duration::days(i64::from(days));
    let buckets = bucket_builds(builds, day_key, |finished_at| finished_at > cutoff);
    let (days, values) = series_values(&buckets);
    DailySeries { days, values }
}

/// Builds a series accounted for (passed plus failed).
pub fn counted_builds(values: &SeriesValues) -> usize {
    values.passed.iter().sum::<usize>() + values.failed.iter().sum::<usize>()
}
