//! Cache of parsed DDS/DAS metadata per dataset URL.
//!
//! The schema pass and the data pass both need every input's metadata, and
//! concurrent workers may ask for the same URL at once. Entries live in an
//! LRU; concurrent misses for one URL share a single fetch.

use super::das::Das;
use super::dds::Dds;
use crate::pipeline::Metrics;
use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const DEFAULT_ENTRIES: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(n) => n,
    None => unreachable!(),
};

/// Parsed metadata of one DAP dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DapMetadata {
    pub dds: Dds,
    pub das: Das,
}

type FetchResult = Result<Arc<DapMetadata>, String>;

pub struct MetadataCache {
    cache: RwLock<LruCache<String, Arc<DapMetadata>>>,
    /// Fetches in progress; waiters subscribe to the sender
    in_flight: DashMap<String, broadcast::Sender<FetchResult>>,
    metrics: Option<Arc<Metrics>>,
}

impl MetadataCache {
    pub fn new(max_entries: usize, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            cache: RwLock::new(LruCache::new(
                NonZeroUsize::new(max_entries).unwrap_or(DEFAULT_ENTRIES),
            )),
            in_flight: DashMap::new(),
            metrics,
        }
    }

    /// Cached metadata for `url`, or the result of `load`.
    ///
    /// Only one caller runs `load` for a given URL at a time; the others wait
    /// for its result. Failures are not cached.
    pub async fn get_or_load<F, Fut>(&self, url: &str, load: F) -> Result<Arc<DapMetadata>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DapMetadata>>,
    {
        {
            let mut cache = self.cache.write().await;
            if let Some(cached) = cache.get(url) {
                if let Some(ref m) = self.metrics {
                    m.add_metadata_cache_hit();
                }
                return Ok(cached.clone());
            }
        }

        // The entry guard must be released before awaiting.
        let (pending, waiter) = match self.in_flight.entry(url.to_string()) {
            Entry::Occupied(entry) => (None, Some(entry.get().subscribe())),
            Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(16);
                entry.insert(tx.clone());
                (
                    Some(InFlight {
                        map: &self.in_flight,
                        url,
                        tx,
                    }),
                    None,
                )
            }
        };

        if let Some(mut rx) = waiter {
            if let Some(ref m) = self.metrics {
                m.add_metadata_cache_coalesced();
            }
            return match rx.recv().await {
                Ok(Ok(cached)) => Ok(cached),
                Ok(Err(e)) => Err(anyhow::anyhow!("Coalesced metadata fetch failed: {}", e)),
                Err(_) => Err(anyhow::anyhow!("Metadata fetch for {} was abandoned", url)),
            };
        }
        let pending = pending.context("in-flight sender missing")?;

        if let Some(ref m) = self.metrics {
            m.add_metadata_cache_miss();
        }

        match load().await {
            Ok(metadata) => {
                let metadata = Arc::new(metadata);
                self.cache.write().await.put(url.to_string(), metadata.clone());
                pending.finish(Ok(metadata.clone()));
                Ok(metadata)
            }
            Err(e) => {
                pending.finish(Err(e.to_string()));
                Err(e)
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

/// A fetch this caller is running. Dropping it, even when the loading future
/// is cancelled, removes the in-flight entry so waiters are released.
struct InFlight<'a> {
    map: &'a DashMap<String, broadcast::Sender<FetchResult>>,
    url: &'a str,
    tx: broadcast::Sender<FetchResult>,
}

impl InFlight<'_> {
    fn finish(self, result: FetchResult) {
        self.release();
        let _ = self.tx.send(result);
    }

    fn release(&self) {
        // A later fetch of the same URL may own the entry by now.
        self.map.remove_if(self.url, |_, tx| tx.same_channel(&self.tx));
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::dap::das::parse_das;
    use crate::io::dap::dds::parse_dds;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn metadata() -> DapMetadata {
        DapMetadata {
            dds: parse_dds("Dataset { Int32 v; } d;").unwrap(),
            das: parse_das("Attributes { }").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_load() {
        let metrics = Metrics::new();
        let cache = MetadataCache::new(4, Some(metrics.clone()));
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let md = cache
                .get_or_load("http://server/a", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(metadata())
                })
                .await
                .unwrap();
            assert_eq!(md.dds.name, "d");
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.metadata_cache_hits, 2);
        assert_eq!(snapshot.metadata_cache_misses, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_load() {
        let cache = Arc::new(MetadataCache::new(4, None));
        let loads = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let loads = loads.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_load("http://server/b", || async move {
                            loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(metadata())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_load_releases_waiters() {
        let cache = Arc::new(MetadataCache::new(4, None));

        let loader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load("http://server/d", || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(metadata())
                    })
                    .await
            })
        };
        while !cache.in_flight.contains_key("http://server/d") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_load("http://server/d", || async { Ok(metadata()) }).await })
        };
        while cache
            .in_flight
            .get("http://server/d")
            .map_or(0, |tx| tx.receiver_count())
            == 0
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        loader.abort();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert!(result.is_err());
        assert!(cache.in_flight.is_empty());

        let retried = cache.get_or_load("http://server/d", || async { Ok(metadata()) }).await;
        assert!(retried.is_ok());
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = MetadataCache::new(4, None);
        let err = cache
            .get_or_load("http://server/c", || async { Err(anyhow::anyhow!("boom")) })
            .await;
        assert!(err.is_err());
        assert!(cache.is_empty().await);

        let ok = cache.get_or_load("http://server/c", || async { Ok(metadata()) }).await;
        assert!(ok.is_ok());
    }
}
