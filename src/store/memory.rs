// src/store/memory.rs
//! In-process [`ScoreStore`]. Writes are staged on the transaction and
//! applied under one lock at commit; per-article row locks serialize writers
//! to the same article while different articles proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{ScoreStore, ScoreTransaction};
use crate::error::StoreError;
use crate::model::{ArticleScoreState, EnsembleRecord};

const ROW_LOCK_PRUNE_AT: usize = 1024;

#[derive(Debug, Default)]
struct Tables {
    ensembles: HashMap<i64, Vec<EnsembleRecord>>,
    scores: HashMap<i64, ArticleScoreState>,
    next_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryScoreStore {
    tables: Arc<Mutex<Tables>>,
    row_locks: Arc<Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>>,
}

impl MemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn row_lock(&self, article_id: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.row_locks.lock();
        if locks.len() >= ROW_LOCK_PRUNE_AT {
            // Only the map holds an idle lock; waiters and holders own a clone.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
        }
        locks
            .entry(article_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Total ensemble rows across all articles.
    pub fn ensemble_count(&self) -> usize {
        self.tables.lock().ensembles.values().map(Vec::len).sum()
    }
}

#[async_trait::async_trait]
impl ScoreStore for MemoryScoreStore {
    async fn begin(&self, article_id: i64) -> Result<Box<dyn ScoreTransaction>, StoreError> {
        let guard = self.row_lock(article_id).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            tables: self.tables.clone(),
            article_id,
            ensembles: Vec::new(),
            score: None,
            _row: guard,
        }))
    }

    async fn fetch_article_score(
        &self,
        article_id: i64,
    ) -> Result<Option<ArticleScoreState>, StoreError> {
        Ok(self.tables.lock().scores.get(&article_id).cloned())
    }

    async fn list_ensemble_records(
        &self,
        article_id: i64,
    ) -> Result<Vec<EnsembleRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .ensembles
            .get(&article_id)
            .cloned()
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    article_id: i64,
    ensembles: Vec<EnsembleRecord>,
    score: Option<ArticleScoreState>,
    _row: OwnedMutexGuard<()>,
}

#[async_trait::async_trait]
impl ScoreTransaction for MemoryTransaction {
    async fn insert_ensemble(&mut self, record: &EnsembleRecord) -> Result<i64, StoreError> {
        // Ids are reserved eagerly; a rolled-back run leaves a gap, as
        // AUTOINCREMENT does.
        let id = {
            let mut t = self.tables.lock();
            t.next_id += 1;
            t.next_id
        };
        let mut row = record.clone();
        row.id = Some(id);
        self.ensembles.push(row);
        Ok(id)
    }

    async fn upsert_article_score(&mut self, state: &ArticleScoreState) -> Result<(), StoreError> {
        if state.article_id != self.article_id {
            return Err(StoreError::Unavailable(format!(
                "transaction for article {} cannot write article {}",
                self.article_id, state.article_id
            )));
        }
        self.score = Some(state.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            tables,
            ensembles,
            score,
            _row,
            ..
        } = *self;
        let mut t = tables.lock();
        for row in ensembles {
            t.ensembles.entry(row.article_id).or_default().push(row);
        }
        if let Some(s) = score {
            t.scores.insert(s.article_id, s);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn record(article_id: i64) -> EnsembleRecord {
        EnsembleRecord {
            id: None,
            article_id,
            perspective_scores: Vec::new(),
            composite_score: 0.0,
            confidence: 0.0,
            perspectives_used: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    fn state(article_id: i64, v: f64) -> ArticleScoreState {
        ArticleScoreState {
            article_id,
            composite_score: v,
            confidence: 0.5,
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn staged_writes_invisible_until_commit() {
        let s = MemoryScoreStore::new();
        let mut tx = s.begin(1).await.unwrap();
        tx.insert_ensemble(&record(1)).await.unwrap();
        tx.upsert_article_score(&state(1, 0.2)).await.unwrap();
        assert!(s.fetch_article_score(1).await.unwrap().is_none());
        tx.commit().await.unwrap();
        assert_eq!(s.fetch_article_score(1).await.unwrap().unwrap().composite_score, 0.2);
        assert_eq!(s.list_ensemble_records(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_discards_and_releases_lock() {
        let s = MemoryScoreStore::new();
        {
            let mut tx = s.begin(1).await.unwrap();
            tx.insert_ensemble(&record(1)).await.unwrap();
        }
        let tx = tokio::time::timeout(Duration::from_secs(1), s.begin(1))
            .await
            .expect("row lock released on drop")
            .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(s.ensemble_count(), 0);
    }

    #[tokio::test]
    async fn same_article_serializes_other_articles_do_not() {
        let s = MemoryScoreStore::new();
        let held = s.begin(1).await.unwrap();

        let other = tokio::time::timeout(Duration::from_millis(200), s.begin(2)).await;
        assert!(other.is_ok(), "different article must not wait");

        let same = tokio::time::timeout(Duration::from_millis(50), s.begin(1)).await;
        assert!(same.is_err(), "same article must wait for the holder");

        held.commit().await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(200), s.begin(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn cross_article_write_rejected() {
        let s = MemoryScoreStore::new();
        let mut tx = s.begin(1).await.unwrap();
        assert!(tx.upsert_article_score(&state(2, 0.0)).await.is_err());
    }
}
