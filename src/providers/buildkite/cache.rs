use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{KpiError, Result};

struct CacheEntry<T> {
    value: Arc<T>,
    fetched_at: Instant,
    fetched_at_utc: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    fn served(&self, from_cache: bool, stale: bool) -> Cached<T> {
        Cached {
            value: Arc::clone(&self.value),
            from_cache,
            stale,
            fetched_at: self.fetched_at_utc,
            age: self.fetched_at.elapsed(),
        }
    }
}

/// A value handed out by [`ResultCache`].
#[derive(Debug)]
pub struct Cached<T> {
    pub value: Arc<T>,
    pub from_cache: bool,
    /// Served past its TTL because the refresh failed.
    pub stale: bool,
    pub fetched_at: DateTime<Utc>,
    pub age: Duration,
}

/// Holds the last successfully fetched value for `ttl`.
///
/// Readers share the current entry through an `Arc`; a refresh replaces the
/// entry wholesale. Concurrent misses are collapsed into a single refresh.
pub struct ResultCache<T> {
    entry: RwLock<Option<CacheEntry<T>>>,
    refresh: Mutex<()>,
    ttl: Duration,
    serve_stale: bool,
}

impl<T> ResultCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entry: RwLock::new(None),
            refresh: Mutex::new(()),
            ttl,
            serve_stale: false,
        }
    }

    /// Return the expired entry instead of the error when a refresh fails.
    pub fn with_stale_on_error(mut self, serve_stale: bool) -> Self {
        self.serve_stale = serve_stale;
        self
    }

    async fn fresh(&self) -> Option<Cached<T>> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|e| e.fetched_at.elapsed() < self.ttl)
            .map(|e| e.served(true, false))
    }

    /// Returns the cached value while it is younger than the TTL, otherwise
    /// runs `refresh` and stores its result.
    ///
    /// A failed refresh leaves the existing entry untouched. A caller queued
    /// behind another refresh gives up as soon as `cancel` fires.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        cancel: &CancellationToken,
        refresh: F,
    ) -> Result<Cached<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.fresh().await {
            info!("[Cache] Using cached data (age: {:?})", hit.age);
            return Ok(hit);
        }

        let _refreshing = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(KpiError::Cancelled),
            guard = self.refresh.lock() => guard,
        };

        // Whoever held the refresh lock before us may have just filled it.
        if let Some(hit) = self.fresh().await {
            info!("[Cache] Using data refreshed by a concurrent request");
            return Ok(hit);
        }

        match refresh().await {
            Ok(value) => {
                let entry = CacheEntry {
                    value: Arc::new(value),
                    fetched_at: Instant::now(),
                    fetched_at_utc: Utc::now(),
                };
                let served = entry.served(false, false);
                *self.entry.write().await = Some(entry);
                info!("[Cache] Updated cache");
                Ok(served)
            }
            Err(error) => {
                if self.serve_stale {
                    if let Some(entry) = self.entry.read().await.as_ref() {
                        warn!("[Cache] Refresh failed, serving stale data: {error}");
                        return Ok(entry.served(true, true));
                    }
                }
                Err(error)
            }
        }
    }
}
