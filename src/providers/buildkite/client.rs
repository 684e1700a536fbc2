use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use log::debug;
use reqwest::header::ACCEPT;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::rate_limiter::RateLimiter;
use super::types::BuildRecord;
use crate::auth::Token;
use crate::config::Credentials;
use crate::error::{KpiError, Result};
use crate::providers::{PageRequest, PageSource};

pub struct BuildkiteClient {
    client: Client,
    api_url: Url,
    org: String,
    token: Token,
    limiter: Arc<RateLimiter>,
}

impl BuildkiteClient {
    pub fn new(base_url: &str, credentials: Credentials, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("buildkpi/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KpiError::InvalidConfig(format!("Failed to create HTTP client: {e}")))?;

        let api_url = Url::parse(base_url)
            .map_err(|e| KpiError::InvalidConfig(format!("Invalid base URL: {e}")))?;
        if api_url.cannot_be_a_base() {
            return Err(KpiError::InvalidConfig(format!(
                "Invalid base URL: {base_url}"
            )));
        }

        Ok(Self {
            client,
            api_url,
            org: credentials.org,
            token: credentials.token,
            limiter,
        })
    }

    /// `{base}/organizations/{org}/pipelines/{pipeline}/builds`, with each
    /// segment percent-encoded.
    fn builds_url(&self, pipeline: &str) -> Result<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| KpiError::InvalidConfig(format!("Invalid base URL: {}", self.api_url)))?
            .pop_if_empty()
            .extend(["organizations", self.org.as_str(), "pipelines", pipeline, "builds"]);
        Ok(url)
    }

    async fn send_page(&self, request: &PageRequest<'_>) -> Result<Vec<BuildRecord>> {
        let url = self.builds_url(request.pipeline)?;
        let created_from = request
            .created_from
            .to_rfc3339_opts(SecondsFormat::Secs, true);

        let response = self
            .client
            .get(url)
            .query(&[("created_from", created_from.as_str())])
            .query(&[("per_page", request.per_page), ("page", request.page)])
            .bearer_auth(self.token.as_str())
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(KpiError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let builds: Vec<BuildRecord> = serde_json::from_str(&body).map_err(KpiError::Decode)?;
        debug!(
            "Fetched page {} of {} ({} builds)",
            request.page,
            request.pipeline,
            builds.len()
        );
        Ok(builds)
    }
}

#[async_trait]
impl PageSource for BuildkiteClient {
    async fn fetch_page(
        &self,
        request: &PageRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<BuildRecord>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(KpiError::Cancelled),
            result = async {
                self.limiter.acquire().await;
                self.send_page(request).await
            } => result,
        }
    }
}
