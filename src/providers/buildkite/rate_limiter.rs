use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Fraction of the advertised quota actually used.
const SAFETY_MARGIN: f64 = 0.85;

/// Process-wide pacing for every request sent to Buildkite.
///
/// Callers are released one at a time, at most once per `period`, in the order
/// they started waiting. There is no per-pipeline fairness.
#[derive(Debug)]
pub struct RateLimiter {
    ticks: Mutex<Interval>,
    period: Duration,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let mut ticks = interval(period);
        // After an idle stretch release one caller right away, then resume pacing.
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            ticks: Mutex::new(ticks),
            period,
        }
    }

    /// Paces at 85% of `requests_per_minute` (200 rpm becomes one call every ~353ms).
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let allowed = (f64::from(requests_per_minute.max(1)) * SAFETY_MARGIN).max(1.0);
        Self::new(Duration::from_secs_f64(60.0 / allowed))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Waits for the next release slot.
    ///
    /// Cancel-safe: dropping the future gives up the place in line without
    /// consuming a tick.
    pub async fn acquire(&self) {
        let mut ticks = self.ticks.lock().await;
        ticks.tick().await;
    }
}
