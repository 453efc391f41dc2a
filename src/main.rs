//! News Bias Scorer: binary entrypoint.
//! Loads config, wires store/cache/progress/manager, starts the progress
//! sweeper and serves the Axum router until Ctrl-C.

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use news_bias_scorer::metrics::Metrics;
use news_bias_scorer::{build_service, router, EngineConfig};

/// `LOG_FORMAT=json` for JSON lines, compact otherwise. `RUST_LOG` overrides
/// the default filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("news_bias_scorer=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = EngineConfig::load_default().context("loading scorer config")?;
    let service = build_service(&cfg)
        .await
        .context("opening score store")?;

    let shutdown = CancellationToken::new();
    let sweeper = service
        .progress
        .spawn_sweeper(cfg.sweep_interval(), shutdown.child_token());

    let mut app = router(service.state.clone());
    if cfg.metrics_enabled {
        match Metrics::init() {
            Ok(m) => app = app.merge(m.router()),
            Err(e) => warn!(error = %e, "metrics exporter not installed"),
        }
    }

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    info!(addr = %cfg.bind_addr, store = service.manager.store().name(), "news bias scorer listening");

    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            token.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }
    Ok(())
}
