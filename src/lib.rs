// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod cache;
pub mod calculator;
pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod model;
pub mod progress;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::{router, AppState};
pub use crate::calculator::{DefaultScoreCalculator, ScoreCalculator};
pub use crate::config::{CompositeScoreConfig, EngineConfig, MissingPerspectivePolicy};
pub use crate::error::{ScoreError, StoreError};
pub use crate::manager::ScoreManager;
pub use crate::model::{
    ArticleScoreState, EnsembleRecord, Perspective, PerspectiveScore, ScoreResult,
};
pub use crate::progress::{ProgressState, ProgressStatus, ProgressTracker};

use std::sync::Arc;

use crate::cache::ArticleScoreCache;

/// Everything the HTTP layer needs, built from one [`EngineConfig`].
pub struct Service {
    pub manager: ScoreManager,
    pub cache: Arc<ArticleScoreCache>,
    pub progress: Arc<ProgressTracker>,
    pub state: AppState,
}

/// Wire store, cache, tracker and manager. Does not start the sweeper.
pub async fn build_service(cfg: &EngineConfig) -> Result<Service, StoreError> {
    let store =
        store::open_store(&cfg.database_url, cfg.max_connections, cfg.busy_timeout()).await?;
    let cache = Arc::new(ArticleScoreCache::new(cfg.cache_capacity, cfg.cache_ttl()));
    let progress = Arc::new(ProgressTracker::new(cfg.progress_ttl()));
    let manager = ScoreManager::new(store, cache.clone(), progress.clone())
        .with_persist_timeout(cfg.persist_timeout());
    let state = AppState::new(manager.clone(), cache.clone(), cfg.composite.clone());
    Ok(Service {
        manager,
        cache,
        progress,
        state,
    })
}
