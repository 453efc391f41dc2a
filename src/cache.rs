//! Read-side cache for article scores and their ensemble history.
//!
//! The scoring core only needs "evict by key" ([`ScoreCache`]); the API layer
//! also reads through [`ArticleScoreCache`] (cache-aside).
//!
//! A reader takes a [`Generation`] before it queries the store and hands it
//! back with the row. Every eviction bumps the generation, so a row read
//! before a commit can never be cached after that commit's eviction.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::CacheError;
use crate::model::{ArticleScoreState, EnsembleRecord};

pub const NS_ARTICLE: &str = "article";
pub const NS_ENSEMBLE: &str = "ensemble";

/// Namespaces holding derived views of an article's score. All of them are
/// evicted after a committed scoring run.
pub const SCORE_NAMESPACES: [&str; 2] = [NS_ARTICLE, NS_ENSEMBLE];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: &'static str,
    pub article_id: i64,
}

impl CacheKey {
    pub fn new(namespace: &'static str, article_id: i64) -> Self {
        Self {
            namespace,
            article_id,
        }
    }

    pub fn article(article_id: i64) -> Self {
        Self::new(NS_ARTICLE, article_id)
    }

    pub fn ensemble(article_id: i64) -> Self {
        Self::new(NS_ENSEMBLE, article_id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.article_id)
    }
}

/// Eviction capability the score manager depends on.
pub trait ScoreCache: Send + Sync {
    fn evict(&self, key: &CacheKey) -> Result<(), CacheError>;
}

/// Cache that holds nothing; for deployments without a read cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl ScoreCache for NoopCache {
    fn evict(&self, _key: &CacheKey) -> Result<(), CacheError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Cached {
    Score(ArticleScoreState),
    Ensemble(Arc<Vec<EnsembleRecord>>),
}

/// Eviction counter observed before a store read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

/// Bounded, TTL-limited in-memory cache (LRU-ish eviction via Moka).
#[derive(Clone)]
pub struct ArticleScoreCache {
    entries: Cache<CacheKey, Cached>,
    // Held across check-and-insert and bump-and-invalidate.
    generation: Arc<Mutex<u64>>,
}

impl ArticleScoreCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            generation: Arc::new(Mutex::new(0)),
        }
    }

    /// Take before reading the store; pass to `put_*` with the result.
    pub fn generation(&self) -> Generation {
        Generation(*self.generation.lock())
    }

    pub fn get_score(&self, article_id: i64) -> Option<ArticleScoreState> {
        match self.entries.get(&CacheKey::article(article_id)) {
            Some(Cached::Score(s)) => Some(s),
            _ => None,
        }
    }

    /// Cache `state` unless an eviction happened since `seen`. Returns
    /// whether the entry was stored.
    pub fn put_score(&self, seen: Generation, state: ArticleScoreState) -> bool {
        self.insert_if_current(
            seen,
            CacheKey::article(state.article_id),
            Cached::Score(state),
        )
    }

    pub fn get_ensemble(&self, article_id: i64) -> Option<Arc<Vec<EnsembleRecord>>> {
        match self.entries.get(&CacheKey::ensemble(article_id)) {
            Some(Cached::Ensemble(v)) => Some(v),
            _ => None,
        }
    }

    /// Same rule as [`put_score`](Self::put_score); the records are
    /// returned shared either way.
    pub fn put_ensemble(
        &self,
        seen: Generation,
        article_id: i64,
        records: Vec<EnsembleRecord>,
    ) -> Arc<Vec<EnsembleRecord>> {
        let shared = Arc::new(records);
        self.insert_if_current(
            seen,
            CacheKey::ensemble(article_id),
            Cached::Ensemble(shared.clone()),
        );
        shared
    }

    fn insert_if_current(&self, seen: Generation, key: CacheKey, value: Cached) -> bool {
        let current = self.generation.lock();
        if *current != seen.0 {
            debug!(key = %key, "store read raced an eviction, not caching");
            return false;
        }
        self.entries.insert(key, value);
        true
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }
}

impl ScoreCache for ArticleScoreCache {
    fn evict(&self, key: &CacheKey) -> Result<(), CacheError> {
        let mut current = self.generation.lock();
        *current = current.wrapping_add(1);
        self.entries.invalidate(key);
        Ok(())
    }
}

impl fmt::Debug for ArticleScoreCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArticleScoreCache")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state(id: i64, score: f64) -> ArticleScoreState {
        ArticleScoreState {
            article_id: id,
            composite_score: score,
            confidence: 0.8,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn key_format() {
        assert_eq!(CacheKey::article(42).to_string(), "article:42");
        assert_eq!(CacheKey::ensemble(7).to_string(), "ensemble:7");
    }

    #[test]
    fn put_get_evict() {
        let c = ArticleScoreCache::new(100, Duration::from_secs(60));
        assert!(c.put_score(c.generation(), state(1, 0.3)));
        assert_eq!(c.get_score(1).unwrap().composite_score, 0.3);
        assert!(c.get_ensemble(1).is_none());

        c.evict(&CacheKey::article(1)).unwrap();
        assert!(c.get_score(1).is_none());
        assert!(!c.contains(&CacheKey::article(1)));
    }

    #[test]
    fn namespaces_do_not_collide() {
        let c = ArticleScoreCache::new(100, Duration::from_secs(60));
        c.put_score(c.generation(), state(2, -0.1));
        c.put_ensemble(c.generation(), 2, Vec::new());
        c.evict(&CacheKey::ensemble(2)).unwrap();
        assert!(c.get_score(2).is_some());
        assert!(c.get_ensemble(2).is_none());
    }

    #[test]
    fn read_before_eviction_is_not_cached() {
        let c = ArticleScoreCache::new(100, Duration::from_secs(60));
        // Reader snapshots, a writer commits and evicts, the reader returns.
        let seen = c.generation();
        c.evict(&CacheKey::article(3)).unwrap();
        assert!(!c.put_score(seen, state(3, 0.1)));
        assert!(c.get_score(3).is_none());

        let shared = c.put_ensemble(seen, 3, Vec::new());
        assert!(shared.is_empty());
        assert!(c.get_ensemble(3).is_none());

        assert!(c.put_score(c.generation(), state(3, 0.2)));
        assert_eq!(c.get_score(3).unwrap().composite_score, 0.2);
    }
}
