use std::time::Duration;

use crate::auth::Token;
use crate::error::{KpiError, Result};

pub const TOKEN_ENV: &str = "BUILDKITE_TOKEN";
pub const ORG_ENV: &str = "BUILDKITE_ORG";

pub const DEFAULT_BASE_URL: &str = "https://api.buildkite.com/v2";

/// Deployment pipelines tracked by the KPI when none are given explicitly.
pub const DEFAULT_PIPELINES: [&str; 2] = [
    "core-stack-deployment-pipeline",
    "core-stack-deployment-pipeline-legacy",
];

/// Buildkite refuses `per_page` above this.
const MAX_PER_PAGE: u32 = 100;

/// Credentials needed before any request is attempted.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: Token,
    pub org: String,
}

impl Credentials {
    /// Collects every missing value instead of stopping at the first, so the
    /// caller can report them all at once.
    pub fn resolve(token: Option<&str>, org: Option<&str>) -> Result<Self> {
        let token = token.and_then(Token::parse);
        let org = org.map(str::trim).filter(|o| !o.is_empty());

        match (token, org) {
            (Some(token), Some(org)) => Ok(Self {
                token,
                org: org.to_string(),
            }),
            (token, org) => {
                let mut missing = Vec::new();
                if token.is_none() {
                    missing.push(TOKEN_ENV.to_string());
                }
                if org.is_none() {
                    missing.push(ORG_ENV.to_string());
                }
                Err(KpiError::Config { missing })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub pipelines: Vec<String>,
    pub per_page: u32,
    /// Ceiling on pages fetched per pipeline.
    pub max_pages: u32,
    /// Advertised upstream quota; the limiter paces below it.
    pub requests_per_minute: u32,
    pub window_months: u32,
    pub daily_days: u32,
    pub cache_ttl: Duration,
    pub serve_stale: bool,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            pipelines: DEFAULT_PIPELINES.iter().map(ToString::to_string).collect(),
            per_page: 100,
            max_pages: 10,
            requests_per_minute: 200,
            window_months: 3,
            daily_days: 30,
            cache_ttl: Duration::from_secs(5 * 60),
            serve_stale: false,
        }
    }
}

impl FetchSettings {
    pub fn validate(&self) -> Result<()> {
        if self.pipelines.iter().all(|p| p.trim().is_empty()) {
            return Err(KpiError::InvalidConfig(
                "at least one pipeline is required".to_string(),
            ));
        }
        if self.per_page == 0 || self.per_page > MAX_PER_PAGE {
            return Err(KpiError::InvalidConfig(format!(
                "per_page must be between 1 and {MAX_PER_PAGE}, got {}",
                self.per_page
            )));
        }
        if self.max_pages == 0 {
            return Err(KpiError::InvalidConfig(
                "max_pages must be at least 1".to_string(),
            ));
        }
        if self.requests_per_minute == 0 {
            return Err(KpiError::InvalidConfig(
                "requests_per_minute must be at least 1".to_string(),
            ));
        }
        if self.window_months == 0 || self.daily_days == 0 {
            return Err(KpiError::InvalidConfig(
                "fetch windows must be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}
