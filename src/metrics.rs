use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub const SCORING_RUNS_TOTAL: &str = "scoring_runs_total";
pub const SCORING_PERSIST_MS: &str = "scoring_persist_ms";
pub const PROGRESS_ENTRIES: &str = "progress_entries";
pub const PROGRESS_SWEPT_TOTAL: &str = "progress_swept_total";
pub const CACHE_EVICTIONS_FAILED_TOTAL: &str = "cache_evictions_failed_total";

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            SCORING_RUNS_TOTAL,
            "Scoring runs by outcome (success, invalid_input, incomplete_input, persistence_error, cancelled)."
        );
        describe_histogram!(
            SCORING_PERSIST_MS,
            "Time spent in the scoring transaction, in milliseconds."
        );
        describe_gauge!(PROGRESS_ENTRIES, "Progress entries currently tracked.");
        describe_counter!(
            PROGRESS_SWEPT_TOTAL,
            "Progress entries removed by the stale-entry sweeper."
        );
        describe_counter!(
            CACHE_EVICTIONS_FAILED_TOTAL,
            "Post-commit cache evictions that failed (logged, not propagated)."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder. Call at most once per process.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
