// src/store/mod.rs
//! Transactional persistence for scoring runs.
//!
//! A run writes two things that must land together: one append-only
//! [`EnsembleRecord`] and the article's [`ArticleScoreState`]. Both go through
//! a [`ScoreTransaction`]; nothing is visible until `commit`, and dropping an
//! uncommitted transaction rolls it back.
//!
//! Writers to the same article serialize inside `begin`/the first write
//! (row lock in the memory store, the database write lock in SQLite).

pub mod memory;
pub mod sqlite;

use crate::error::StoreError;
use crate::model::{ArticleScoreState, EnsembleRecord};

pub use memory::MemoryScoreStore;
pub use sqlite::SqliteScoreStore;

#[async_trait::async_trait]
pub trait ScoreStore: Send + Sync {
    /// Open a write transaction for one article.
    async fn begin(&self, article_id: i64) -> Result<Box<dyn ScoreTransaction>, StoreError>;

    async fn fetch_article_score(
        &self,
        article_id: i64,
    ) -> Result<Option<ArticleScoreState>, StoreError>;

    /// Ensemble rows for an article, oldest first.
    async fn list_ensemble_records(
        &self,
        article_id: i64,
    ) -> Result<Vec<EnsembleRecord>, StoreError>;

    fn name(&self) -> &'static str;
}

#[async_trait::async_trait]
pub trait ScoreTransaction: Send {
    /// Append the ensemble row; returns its id.
    async fn insert_ensemble(&mut self, record: &EnsembleRecord) -> Result<i64, StoreError>;

    /// Insert or overwrite the article's composite state.
    async fn upsert_article_score(&mut self, state: &ArticleScoreState) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Pick a store from a URL: `memory://` for the in-process store, anything
/// else is handed to SQLite.
pub async fn open_store(
    database_url: &str,
    max_connections: u32,
    busy_timeout: std::time::Duration,
) -> Result<std::sync::Arc<dyn ScoreStore>, StoreError> {
    if database_url.starts_with("memory://") {
        return Ok(std::sync::Arc::new(MemoryScoreStore::new()));
    }
    let store = SqliteScoreStore::connect(database_url, max_connections, busy_timeout).await?;
    store.migrate().await?;
    Ok(std::sync::Arc::new(store))
}
