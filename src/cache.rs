//! In-memory score cache keyed by `(article_id, model)`.
//!
//! The cache keeps the most recent model response for a key so a scoring run
//! never calls the inference endpoint twice for the same perspective. It is
//! advisory: persistence decisions and aggregation always read the store.
//! Entries are evicted per article when a run completes; there is no global
//! TTL.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::model::ScoreResponse;

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Number of active entries
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Thread-safe score cache shared by all runs of one engine.
pub struct ScoreCache {
    entries: Arc<RwLock<HashMap<(i64, String), ScoreResponse>>>,
    stats: Arc<RwLock<CacheStats>>,
}

impl ScoreCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(CacheStats::default())),
        }
    }

    /// Look up the cached response for `(article_id, model)`, recording a
    /// hit or miss.
    pub async fn get(&self, article_id: i64, model: &str) -> Option<ScoreResponse> {
        let entries = self.entries.read().await;
        let found = entries.get(&(article_id, model.to_string())).cloned();
        drop(entries);

        let mut stats = self.stats.write().await;
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }

        found
    }

    /// Store the most recent response for `(article_id, model)`.
    pub async fn put(&self, article_id: i64, model: impl Into<String>, response: ScoreResponse) {
        let mut entries = self.entries.write().await;
        entries.insert((article_id, model.into()), response);

        let mut stats = self.stats.write().await;
        stats.entry_count = entries.len() as u64;
    }

    /// Drop every entry belonging to an article. Called when its scoring run
    /// completes.
    pub async fn evict_article(&self, article_id: i64) {
        let mut entries = self.entries.write().await;
        entries.retain(|(id, _), _| *id != article_id);

        let mut stats = self.stats.write().await;
        stats.entry_count = entries.len() as u64;
    }

    /// Drop all entries and reset statistics.
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();

        let mut stats = self.stats.write().await;
        *stats = CacheStats::default();
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for ScoreCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(score: f64, confidence: f64) -> ScoreResponse {
        ScoreResponse {
            score,
            confidence,
            reasoning: None,
            raw: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_get_put_round_trip() {
        let cache = ScoreCache::new();

        assert!(cache.get(1, "left").await.is_none());

        cache.put(1, "left", response(-0.6, 0.8)).await;
        let cached = cache.get(1, "left").await.unwrap();
        assert_eq!(cached.score, -0.6);
        assert_eq!(cached.confidence, 0.8);

        // Same model under a different article is a different key
        assert!(cache.get(2, "left").await.is_none());
    }

    #[tokio::test]
    async fn test_evict_article_is_scoped() {
        let cache = ScoreCache::new();
        cache.put(1, "left", response(-0.6, 0.8)).await;
        cache.put(1, "right", response(0.7, 0.9)).await;
        cache.put(2, "left", response(0.1, 0.5)).await;

        cache.evict_article(1).await;

        assert!(cache.get(1, "left").await.is_none());
        assert!(cache.get(1, "right").await.is_none());
        assert!(cache.get(2, "left").await.is_some());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_put_replaces() {
        let cache = ScoreCache::new();
        cache.put(1, "left", response(-0.6, 0.8)).await;
        cache.put(1, "left", response(-0.2, 0.4)).await;

        let cached = cache.get(1, "left").await.unwrap();
        assert_eq!(cached.score, -0.2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let cache = ScoreCache::new();
        cache.get(1, "left").await;
        cache.put(1, "left", response(0.0, 1.0)).await;
        cache.get(1, "left").await;
        cache.get(1, "left").await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }
}
