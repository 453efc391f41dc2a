// src/store/sqlite.rs
//! SQLite-backed [`ScoreStore`] (sqlx).
//!
//! Schema:
//! - `ensemble_records`: append-only, one row per scoring run; the input
//!   scores and the perspectives used are stored as JSON text.
//! - `article_scores`: one row per article, upserted by each run.
//!
//! SQLite allows a single writer at a time; concurrent runs queue on the
//! write lock for up to `busy_timeout`.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info};

use super::{ScoreStore, ScoreTransaction};
use crate::error::StoreError;
use crate::model::{ArticleScoreState, EnsembleRecord};

const CREATE_ENSEMBLE_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS ensemble_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    article_id INTEGER NOT NULL,
    perspective_scores TEXT NOT NULL,
    composite_score REAL NOT NULL,
    confidence REAL NOT NULL,
    perspectives_used TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL
)
"#;

const CREATE_ENSEMBLE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_ensemble_records_article ON ensemble_records(article_id, id)";

const CREATE_ARTICLE_SCORES: &str = r#"
CREATE TABLE IF NOT EXISTS article_scores (
    article_id INTEGER PRIMARY KEY,
    composite_score REAL NOT NULL,
    confidence REAL NOT NULL,
    score_source TEXT NOT NULL DEFAULT 'llm',
    last_updated TIMESTAMP NOT NULL
)
"#;

#[derive(Debug, Clone)]
pub struct SqliteScoreStore {
    pool: SqlitePool,
}

impl SqliteScoreStore {
    /// Connect to a file database, creating it (and its directory) if needed.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        if is_memory_url(database_url) {
            return Self::in_memory().await;
        }
        ensure_parent_dir(database_url)?;

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(busy_timeout.max(Duration::from_secs(1)))
            .connect_with(options)
            .await?;

        info!(
            url = database_url,
            max_connections,
            busy_timeout_ms = busy_timeout.as_millis() as u64,
            "score database pool ready"
        );
        Ok(Self { pool })
    }

    /// Private in-memory database. One connection, kept alive for the pool's
    /// lifetime so the data does not vanish.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables if missing. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for stmt in [
            CREATE_ENSEMBLE_RECORDS,
            CREATE_ENSEMBLE_INDEX,
            CREATE_ARTICLE_SCORES,
        ] {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        debug!("score schema ensured");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ScoreStore for SqliteScoreStore {
    async fn begin(&self, article_id: i64) -> Result<Box<dyn ScoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteScoreTransaction { tx, article_id }))
    }

    async fn fetch_article_score(
        &self,
        article_id: i64,
    ) -> Result<Option<ArticleScoreState>, StoreError> {
        let row = sqlx::query(
            "SELECT article_id, composite_score, confidence, last_updated
             FROM article_scores WHERE article_id = ?",
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<ArticleScoreState, StoreError> {
            Ok(ArticleScoreState {
                article_id: r.try_get("article_id")?,
                composite_score: r.try_get("composite_score")?,
                confidence: r.try_get("confidence")?,
                last_updated: r.try_get::<DateTime<Utc>, _>("last_updated")?,
            })
        })
        .transpose()
    }

    async fn list_ensemble_records(
        &self,
        article_id: i64,
    ) -> Result<Vec<EnsembleRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, article_id, perspective_scores, composite_score, confidence,
                    perspectives_used, created_at
             FROM ensemble_records WHERE article_id = ? ORDER BY id",
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_ensemble_row).collect()
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

fn decode_ensemble_row(r: &SqliteRow) -> Result<EnsembleRecord, StoreError> {
    let scores: String = r.try_get("perspective_scores")?;
    let used: String = r.try_get("perspectives_used")?;
    Ok(EnsembleRecord {
        id: Some(r.try_get("id")?),
        article_id: r.try_get("article_id")?,
        perspective_scores: serde_json::from_str(&scores)?,
        composite_score: r.try_get("composite_score")?,
        confidence: r.try_get("confidence")?,
        perspectives_used: serde_json::from_str(&used)?,
        created_at: r.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

pub struct SqliteScoreTransaction {
    tx: Transaction<'static, Sqlite>,
    article_id: i64,
}

#[async_trait::async_trait]
impl ScoreTransaction for SqliteScoreTransaction {
    async fn insert_ensemble(&mut self, record: &EnsembleRecord) -> Result<i64, StoreError> {
        let scores = serde_json::to_string(&record.perspective_scores)?;
        let used = serde_json::to_string(&record.perspectives_used)?;
        let res = sqlx::query(
            "INSERT INTO ensemble_records
                (article_id, perspective_scores, composite_score, confidence, perspectives_used, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.article_id)
        .bind(scores)
        .bind(record.composite_score)
        .bind(record.confidence)
        .bind(used)
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(res.last_insert_rowid())
    }

    async fn upsert_article_score(&mut self, state: &ArticleScoreState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO article_scores (article_id, composite_score, confidence, score_source, last_updated)
             VALUES (?, ?, ?, 'llm', ?)
             ON CONFLICT(article_id) DO UPDATE SET
                composite_score = excluded.composite_score,
                confidence = excluded.confidence,
                score_source = excluded.score_source,
                last_updated = excluded.last_updated",
        )
        .bind(state.article_id)
        .bind(state.composite_score)
        .bind(state.confidence)
        .bind(state.last_updated)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let SqliteScoreTransaction { tx, article_id } = *self;
        tx.commit().await?;
        debug!(article_id, "score transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let SqliteScoreTransaction { tx, article_id } = *self;
        tx.rollback().await?;
        debug!(article_id, "score transaction rolled back");
        Ok(())
    }
}

/// Named or shared-cache memory URLs go through the regular pool.
fn is_memory_url(url: &str) -> bool {
    url == "sqlite::memory:"
}

/// `sqlite://data/scores.db?mode=rwc` → create `data/`.
fn ensure_parent_dir(url: &str) -> Result<(), StoreError> {
    let path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("creating {}: {e}", parent.display())))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Perspective, PerspectiveScore};
    use std::collections::BTreeSet;

    async fn store() -> SqliteScoreStore {
        let s = SqliteScoreStore::in_memory().await.unwrap();
        s.migrate().await.unwrap();
        s
    }

    fn record(article_id: i64, composite: f64) -> EnsembleRecord {
        EnsembleRecord {
            id: None,
            article_id,
            perspective_scores: vec![PerspectiveScore::new("left", -0.4).with_confidence(0.9)],
            composite_score: composite,
            confidence: 0.9,
            perspectives_used: BTreeSet::from([Perspective::Left]),
            created_at: Utc::now(),
        }
    }

    fn state(article_id: i64, composite: f64) -> ArticleScoreState {
        ArticleScoreState {
            article_id,
            composite_score: composite,
            confidence: 0.9,
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn commit_makes_both_rows_visible() {
        let s = store().await;
        let mut tx = s.begin(1).await.unwrap();
        let id = tx.insert_ensemble(&record(1, -0.4)).await.unwrap();
        tx.upsert_article_score(&state(1, -0.4)).await.unwrap();
        tx.commit().await.unwrap();

        let got = s.fetch_article_score(1).await.unwrap().unwrap();
        assert_eq!(got.composite_score, -0.4);
        let rows = s.list_ensemble_records(1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, Some(id));
        assert_eq!(rows[0].perspective_scores[0].model, "left");
        assert!(rows[0].perspectives_used.contains(&Perspective::Left));
    }

    #[tokio::test]
    async fn rollback_and_drop_leave_nothing() {
        let s = store().await;
        let mut tx = s.begin(2).await.unwrap();
        tx.insert_ensemble(&record(2, 0.1)).await.unwrap();
        tx.upsert_article_score(&state(2, 0.1)).await.unwrap();
        tx.rollback().await.unwrap();

        {
            let mut tx = s.begin(2).await.unwrap();
            tx.insert_ensemble(&record(2, 0.2)).await.unwrap();
            // dropped without commit
        }

        assert!(s.fetch_article_score(2).await.unwrap().is_none());
        assert!(s.list_ensemble_records(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_overwrites_state_but_ensemble_appends() {
        let s = store().await;
        for v in [0.1, 0.3] {
            let mut tx = s.begin(3).await.unwrap();
            tx.insert_ensemble(&record(3, v)).await.unwrap();
            tx.upsert_article_score(&state(3, v)).await.unwrap();
            tx.commit().await.unwrap();
        }
        assert_eq!(s.fetch_article_score(3).await.unwrap().unwrap().composite_score, 0.3);
        assert_eq!(s.list_ensemble_records(3).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn schema_leaves_bounds_to_the_config() {
        let s = store().await;
        let mut tx = s.begin(4).await.unwrap();
        tx.upsert_article_score(&state(4, 1.5)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(s.fetch_article_score(4).await.unwrap().unwrap().composite_score, 1.5);
    }

    #[test]
    fn only_the_private_memory_url_is_redirected() {
        assert!(is_memory_url("sqlite::memory:"));
        assert!(!is_memory_url("sqlite://file:x?mode=memory&cache=shared"));
        assert!(!is_memory_url("sqlite://data/scores.db"));
    }
}
