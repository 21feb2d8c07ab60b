//! Time-bounded cache of signing certificates keyed by their URL.
//!
//! Entries are reused while younger than the TTL and refetched afterwards.
//! Nothing is evicted eagerly; a stale entry is simply overwritten by the
//! next successful fetch. Concurrent misses on the same URL may each fetch,
//! which is harmless since the content is identical.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codelexa_common::Clock;
use reqwest::Client;
use tracing::{debug, info};

/// Where certificate PEM text comes from on a cache miss.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Plain HTTPS GET of the certificate chain.
pub struct HttpCertificateSource {
    client: Client,
}

impl HttpCertificateSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CertificateSource for HttpCertificateSource {
    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("GET {url} returned {status}"));
        }

        response
            .text()
            .await
            .with_context(|| format!("reading certificate body from {url}"))
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    pem: Arc<str>,
    fetched_at: DateTime<Utc>,
}

pub struct CertificateCache {
    source: Arc<dyn CertificateSource>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CertificateCache {
    pub fn new(source: Arc<dyn CertificateSource>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            source,
            clock,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the PEM for `url`, fetching it when absent or expired.
    pub async fn get_or_fetch(&self, url: &str) -> Result<Arc<str>> {
        let now = self.clock.now();
        if let Some(pem) = self.fresh_entry(url, now) {
            debug!(cert_url = url, "certificate cache hit");
            return Ok(pem);
        }

        let pem: Arc<str> = Arc::from(self.source.fetch(url).await?);
        info!(cert_url = url, "fetched signing certificate");

        let entry = CacheEntry {
            pem: Arc::clone(&pem),
            fetched_at: self.clock.now(),
        };
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(url.to_string(), entry);

        Ok(pem)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fresh_entry(&self, url: &str, now: DateTime<Utc>) -> Option<Arc<str>> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = entries.get(url)?;
        (now - entry.fetched_at < self.ttl).then(|| Arc::clone(&entry.pem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelexa_common::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const URL: &str = "https://s3.amazonaws.com/echo.api/echo-api-cert.pem";

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CertificateSource for CountingSource {
        async fn fetch(&self, url: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("pem #{n} for {url}"))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl CertificateSource for FailingSource {
        async fn fetch(&self, _url: &str) -> Result<String> {
            Err(anyhow!("connection refused"))
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn reuses_entry_within_ttl() {
        let source = Arc::new(CountingSource::default());
        let clock = clock();
        let cache = CertificateCache::new(source.clone(), clock.clone(), Duration::from_secs(6 * 3600));

        let first = cache.get_or_fetch(URL).await.unwrap();
        clock.advance(chrono::Duration::hours(5) + chrono::Duration::minutes(59));
        let second = cache.get_or_fetch(URL).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refetches_once_ttl_elapsed() {
        let source = Arc::new(CountingSource::default());
        let clock = clock();
        let cache = CertificateCache::new(source.clone(), clock.clone(), Duration::from_secs(6 * 3600));

        cache.get_or_fetch(URL).await.unwrap();
        clock.advance(chrono::Duration::hours(6));
        let refreshed = cache.get_or_fetch(URL).await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(refreshed.starts_with("pem #2"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn separate_urls_are_cached_separately() {
        let source = Arc::new(CountingSource::default());
        let cache = CertificateCache::new(source.clone(), clock(), Duration::from_secs(60));

        cache.get_or_fetch(URL).await.unwrap();
        cache
            .get_or_fetch("https://s3.amazonaws.com/echo.api/other.pem")
            .await
            .unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_cache_empty() {
        let cache = CertificateCache::new(Arc::new(FailingSource), clock(), Duration::from_secs(60));
        assert!(cache.get_or_fetch(URL).await.is_err());
        assert!(cache.is_empty());
    }
}
