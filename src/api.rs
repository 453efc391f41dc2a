// src/api.rs
//! HTTP handler layer over the score manager.
//!
//! Translates [`ScoreError`] into status codes: client errors are 4xx,
//! persistence and cancellation are 5xx. Reads go through the
//! [`ArticleScoreCache`] first (cache-aside); the `x-score-cache` header
//! reports HIT or MISS.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::ArticleScoreCache;
use crate::config::CompositeScoreConfig;
use crate::error::{ScoreError, StoreError};
use crate::manager::ScoreManager;
use crate::model::{ArticleScoreState, EnsembleRecord, PerspectiveScore};
use crate::progress::ProgressState;

pub const CACHE_HEADER: &str = "x-score-cache";

#[derive(Clone)]
pub struct AppState {
    manager: ScoreManager,
    cache: Arc<ArticleScoreCache>,
    composite: Arc<CompositeScoreConfig>,
}

impl AppState {
    /// `cache` should be the same instance the manager evicts from.
    pub fn new(
        manager: ScoreManager,
        cache: Arc<ArticleScoreCache>,
        composite: CompositeScoreConfig,
    ) -> Self {
        Self {
            manager,
            cache,
            composite: Arc::new(composite),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/api/articles/{id}/score",
            post(score_article).get(get_article_score),
        )
        .route("/api/articles/{id}/rescore", post(rescore_article))
        .route("/api/articles/{id}/ensemble", get(get_ensemble))
        .route(
            "/api/progress/{id}",
            get(get_progress).delete(ack_progress),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ScoreRequest {
    pub scores: Vec<PerspectiveScore>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub article_id: i64,
    pub composite_score: f64,
    pub confidence: f64,
}

async fn score_article(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ScoreRequest>,
) -> Result<Json<ScoreResponse>, ApiError> {
    let (composite_score, confidence) = state
        .manager
        .update_article_score(id, &body.scores, &state.composite)
        .await?;
    Ok(Json(ScoreResponse {
        article_id: id,
        composite_score,
        confidence,
    }))
}

/// Start tracking and score in the background; poll `/api/progress/{id}`.
async fn rescore_article(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ScoreRequest>,
) -> (StatusCode, Json<ProgressState>) {
    let queued = state.manager.progress().start(id);
    let manager = state.manager.clone();
    let cfg = state.composite.clone();
    tokio::spawn(async move {
        if let Err(e) = manager.update_article_score(id, &body.scores, &cfg).await {
            warn!(article_id = id, code = e.code(), error = %e, "background rescore failed");
        }
    });
    info!(article_id = id, "rescore queued");
    (StatusCode::ACCEPTED, Json(queued))
}

async fn get_article_score(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    if let Some(hit) = state.cache.get_score(id) {
        return Ok(with_cache_header(Json(hit), "HIT"));
    }
    let seen = state.cache.generation();
    let stored: ArticleScoreState = state
        .manager
        .store()
        .fetch_article_score(id)
        .await?
        .ok_or(ApiError::NotFound("article has no score"))?;
    state.cache.put_score(seen, stored.clone());
    Ok(with_cache_header(Json(stored), "MISS"))
}

async fn get_ensemble(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    if let Some(hit) = state.cache.get_ensemble(id) {
        let rows: Vec<EnsembleRecord> = hit.as_ref().clone();
        return Ok(with_cache_header(Json(rows), "HIT"));
    }
    let seen = state.cache.generation();
    let rows = state.manager.store().list_ensemble_records(id).await?;
    let shared = state.cache.put_ensemble(seen, id, rows);
    Ok(with_cache_header(Json(shared.as_ref().clone()), "MISS"))
}

async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ProgressState>, ApiError> {
    state
        .manager
        .get_progress(id)
        .map(Json)
        .ok_or(ApiError::NotFound("article is not tracked"))
}

async fn ack_progress(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state
        .manager
        .progress()
        .remove(id)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or(ApiError::NotFound("article is not tracked"))
}

fn with_cache_header(body: impl IntoResponse, signal: &'static str) -> Response {
    let mut resp = body.into_response();
    resp.headers_mut()
        .insert(CACHE_HEADER, HeaderValue::from_static(signal));
    resp
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Score(#[from] ScoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("not found: {0}")]
    NotFound(&'static str),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Score(e @ ScoreError::InvalidInput(_)) => (StatusCode::BAD_REQUEST, e.code()),
            ApiError::Score(e @ ScoreError::IncompleteInput { .. }) => {
                (StatusCode::UNPROCESSABLE_ENTITY, e.code())
            }
            ApiError::Score(e @ ScoreError::Persistence(_)) if e.is_retryable() => {
                (StatusCode::SERVICE_UNAVAILABLE, e.code())
            }
            ApiError::Score(e @ ScoreError::Persistence(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, e.code())
            }
            ApiError::Score(e @ ScoreError::Cancelled(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, e.code())
            }
            ApiError::Store(e) if e.is_transient() => {
                (StatusCode::SERVICE_UNAVAILABLE, "persistence_error")
            }
            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence_error"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            warn!(code, error = %self, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Perspective;

    #[test]
    fn error_mapping() {
        let cases = [
            (ApiError::from(ScoreError::InvalidInput("x".into())), 400),
            (
                ApiError::from(ScoreError::IncompleteInput {
                    missing: vec![Perspective::Left],
                }),
                422,
            ),
            (
                ApiError::from(ScoreError::from(StoreError::CommitFailed("x".into()))),
                500,
            ),
            (
                ApiError::from(ScoreError::from(StoreError::Unavailable("x".into()))),
                503,
            ),
            (ApiError::from(ScoreError::Cancelled("x".into())), 503),
            (ApiError::NotFound("x"), 404),
        ];
        for (err, want) in cases {
            assert_eq!(err.status_and_code().0.as_u16(), want, "{err}");
        }
    }
}
