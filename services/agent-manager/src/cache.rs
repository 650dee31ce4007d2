//! Zone score cache.
//!
//! Metrics backends are flaky. Scores are cached with a TTL and a failed
//! fetch falls back to the cached value, then to an empty map, so spot
//! placement degrades to uniform weighting instead of failing the pass.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleet_reconcile::ZoneScores;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// How long fetched scores stay usable.
pub const DEFAULT_SCORE_TTL: Duration = Duration::from_secs(600);

/// Storage for fetched zone scores.
#[async_trait]
pub trait ScoreCache: Send + Sync {
    /// Returns the cached scores for `key` if present and not expired.
    async fn get(&self, key: &str) -> Option<ZoneScores>;

    async fn put(&self, key: &str, scores: ZoneScores);
}

#[derive(Debug)]
struct CacheEntry {
    scores: ZoneScores,
    stored_at: Instant,
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

/// In-process cache whose entries expire after a fixed TTL.
#[derive(Debug)]
pub struct TtlCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
    stats: CacheStats,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new(DEFAULT_SCORE_TTL)
    }
}

#[async_trait]
impl ScoreCache for TtlCache {
    async fn get(&self, key: &str) -> Option<ZoneScores> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.scores.clone())
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn put(&self, key: &str, scores: ZoneScores) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        entries.insert(
            key.to_string(),
            CacheEntry {
                scores,
                stored_at: Instant::now(),
            },
        );
    }
}

pub fn preemptions_key(project: &str, window: Duration) -> String {
    format!("preemptions-{project}-{}", window.as_secs() / 60)
}

pub fn resource_exhaustions_key(project: &str, window: Duration) -> String {
    format!("resource-exhaustions-{project}-{}", window.as_secs() / 60)
}

/// Fetch scores, caching successes and falling back on failure.
///
/// Never fails: with neither a fresh fetch nor a cached value the result is
/// an empty map.
pub async fn fetch_scores_with_cache<F>(key: &str, cache: &dyn ScoreCache, fetch: F) -> ZoneScores
where
    F: Future<Output = anyhow::Result<ZoneScores>>,
{
    match fetch.await {
        Ok(scores) => {
            cache.put(key, scores.clone()).await;
            scores
        }
        Err(e) => {
            warn!(key, error = %e, "Fetching zone scores failed, using cached value");
            match cache.get(key).await {
                Some(scores) => scores,
                None => {
                    debug!(key, "No cached zone scores");
                    ZoneScores::new()
                }
            }
        }
    }
}
