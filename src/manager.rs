//! # Score Manager
//! Drives one scoring run end to end: calculate, persist atomically, then the
//! post-commit side effects (cache eviction, terminal progress).
//!
//! ```text
//! progress InProgress ─▶ calculate ─▶ begin ─▶ insert ensemble ─▶ upsert state ─▶ commit
//!                           │                              (any failure: rollback)   │
//!                           ▼                                                         ▼
//!                     progress Error                                   evict cache, progress Success
//! ```
//!
//! Cache eviction and progress updates sit outside the transaction. Both are
//! best-effort: a failure there is logged and never changes the result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, ScoreCache, SCORE_NAMESPACES};
use crate::calculator::{DefaultScoreCalculator, ScoreCalculator};
use crate::clock::{self, SharedClock};
use crate::config::CompositeScoreConfig;
use crate::error::{Result, ScoreError, StoreError};
use crate::metrics::{CACHE_EVICTIONS_FAILED_TOTAL, SCORING_PERSIST_MS, SCORING_RUNS_TOTAL};
use crate::model::{ArticleScoreState, EnsembleRecord, PerspectiveScore, ScoreResult};
use crate::progress::{ProgressState, ProgressStatus, ProgressStep, ProgressTracker};
use crate::store::{ScoreStore, ScoreTransaction};

pub const MSG_CANCELLED: &str = "scoring cancelled";
pub const MSG_DEADLINE: &str = "persistence deadline exceeded";

#[derive(Clone)]
pub struct ScoreManager {
    store: Arc<dyn ScoreStore>,
    cache: Arc<dyn ScoreCache>,
    calculator: Arc<dyn ScoreCalculator>,
    progress: Arc<ProgressTracker>,
    clock: SharedClock,
    persist_timeout: Option<Duration>,
}

impl ScoreManager {
    pub fn new(
        store: Arc<dyn ScoreStore>,
        cache: Arc<dyn ScoreCache>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            store,
            cache,
            calculator: Arc::new(DefaultScoreCalculator::new()),
            progress,
            clock: clock::system(),
            persist_timeout: None,
        }
    }

    pub fn with_calculator(mut self, calculator: Arc<dyn ScoreCalculator>) -> Self {
        self.calculator = calculator;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Deadline for begin..upsert; a COMMIT already issued is always awaited.
    /// `None` waits as long as the store does.
    pub fn with_persist_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.persist_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn ScoreStore> {
        &self.store
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    /// Poller entry point.
    pub fn get_progress(&self, article_id: i64) -> Option<ProgressState> {
        self.progress.get(article_id)
    }

    /// Score one article and persist the result. Returns
    /// `(composite_score, confidence)` of the committed run.
    pub async fn update_article_score(
        &self,
        article_id: i64,
        scores: &[PerspectiveScore],
        cfg: &CompositeScoreConfig,
    ) -> Result<(f64, f64)> {
        self.update_article_score_with_cancel(article_id, scores, cfg, &CancellationToken::new())
            .await
    }

    /// Same as [`update_article_score`](Self::update_article_score); `cancel`
    /// rolls the transaction back if it fires before COMMIT is issued.
    pub async fn update_article_score_with_cancel(
        &self,
        article_id: i64,
        scores: &[PerspectiveScore],
        cfg: &CompositeScoreConfig,
        cancel: &CancellationToken,
    ) -> Result<(f64, f64)> {
        let outcome = self.run(article_id, scores, cfg, cancel).await;
        let label = match &outcome {
            Ok(_) => "success",
            Err(e) => e.code(),
        };
        counter!(SCORING_RUNS_TOTAL, "outcome" => label).increment(1);
        outcome
    }

    async fn run(
        &self,
        article_id: i64,
        scores: &[PerspectiveScore],
        cfg: &CompositeScoreConfig,
        cancel: &CancellationToken,
    ) -> Result<(f64, f64)> {
        self.progress.advance(
            article_id,
            ProgressStep::Start,
            ProgressStatus::InProgress,
            0,
            "Starting scoring",
        );
        self.progress.advance(
            article_id,
            ProgressStep::Calculating,
            ProgressStatus::InProgress,
            20,
            "Calculating composite score",
        );

        let result = match self.calculator.calculate(scores, cfg) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    article_id,
                    calculator = self.calculator.name(),
                    error = %e,
                    "score calculation failed"
                );
                self.progress
                    .fail(article_id, "Error calculating score", e.to_string());
                return Err(e);
            }
        };
        debug!(
            article_id,
            composite = result.composite_score,
            confidence = result.confidence,
            perspectives = result.perspectives_used.len(),
            "composite calculated"
        );

        let started = Instant::now();
        let persisted = self.persist_guarded(article_id, scores, &result, cancel).await;
        histogram!(SCORING_PERSIST_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        if let Err(e) = persisted {
            let message = match &e {
                ScoreError::Cancelled(m) => m.clone(),
                _ => "Error storing score".to_string(),
            };
            warn!(article_id, store = self.store.name(), error = %e, "score not persisted");
            self.progress.fail(article_id, message, e.to_string());
            return Err(e);
        }

        self.evict(article_id);
        self.progress.complete(article_id, result.composite_score);
        info!(
            article_id,
            composite = result.composite_score,
            confidence = result.confidence,
            "article score updated"
        );
        Ok((result.composite_score, result.confidence))
    }

    /// Races the staged writes against cancellation and the deadline; losing
    /// the race drops the transaction, which rolls it back. Once COMMIT is
    /// issued it is awaited to completion so the reported outcome matches
    /// what the store holds.
    async fn persist_guarded(
        &self,
        article_id: i64,
        scores: &[PerspectiveScore],
        result: &ScoreResult,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        let deadline = self
            .persist_timeout
            .map(|d| tokio::time::Instant::now() + d);
        let expired = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        let (tx, id) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ScoreError::Cancelled(MSG_CANCELLED.to_string())),
            _ = expired => return Err(ScoreError::Cancelled(MSG_DEADLINE.to_string())),
            staged = self.stage(article_id, scores, result) => staged?,
        };

        let interrupted = if cancel.is_cancelled() {
            Some(MSG_CANCELLED)
        } else if deadline.is_some_and(|at| tokio::time::Instant::now() >= at) {
            Some(MSG_DEADLINE)
        } else {
            None
        };
        if let Some(msg) = interrupted {
            if let Err(rb) = tx.rollback().await {
                warn!(article_id, error = %rb, "rollback failed");
            }
            return Err(ScoreError::Cancelled(msg.to_string()));
        }

        tx.commit().await?;
        debug!(article_id, ensemble_id = id, "scoring transaction committed");
        Ok(id)
    }

    /// begin, insert, upsert. The open transaction is handed back for the
    /// caller to commit; on a write error it is rolled back here.
    async fn stage(
        &self,
        article_id: i64,
        scores: &[PerspectiveScore],
        result: &ScoreResult,
    ) -> std::result::Result<(Box<dyn ScoreTransaction>, i64), StoreError> {
        let now = self.clock.now();
        let record = EnsembleRecord {
            id: None,
            article_id,
            perspective_scores: scores.to_vec(),
            composite_score: result.composite_score,
            confidence: result.confidence,
            perspectives_used: result.perspectives_used.clone(),
            created_at: now,
        };
        let state = ArticleScoreState {
            article_id,
            composite_score: result.composite_score,
            confidence: result.confidence,
            last_updated: now,
        };

        let mut tx = self.store.begin(article_id).await?;
        self.progress.advance(
            article_id,
            ProgressStep::Storing,
            ProgressStatus::InProgress,
            60,
            "Storing ensemble record",
        );

        let written = async {
            let id = tx.insert_ensemble(&record).await?;
            self.progress.advance(
                article_id,
                ProgressStep::Updating,
                ProgressStatus::InProgress,
                80,
                "Updating article score",
            );
            tx.upsert_article_score(&state).await?;
            Ok::<_, StoreError>(id)
        }
        .await;

        match written {
            Ok(id) => Ok((tx, id)),
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(article_id, error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }

    fn evict(&self, article_id: i64) {
        for ns in SCORE_NAMESPACES {
            let key = CacheKey::new(ns, article_id);
            if let Err(e) = self.cache.evict(&key) {
                counter!(CACHE_EVICTIONS_FAILED_TOTAL).increment(1);
                warn!(article_id, key = %key, error = %e, "cache eviction failed");
            }
        }
    }
}
