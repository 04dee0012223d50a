//! Confidence Engine binary entrypoint.
//! Loads config, boots the engine and its background tasks, serves the HTTP API.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use confidence_engine::notify::webhook::{spawn_forwarder, WebhookNotifier};
use confidence_engine::scheduler::{spawn_feedback_flusher, spawn_window_ticker};
use confidence_engine::{router, ConfidenceEngine, EngineConfig};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

/// `RUST_LOG` filter; `LOG_FORMAT=json` for JSON lines, compact otherwise.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("confidence_engine=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl_c handler failed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let mut cfg = EngineConfig::load().context("loading engine config")?;
    if let Ok(url) = std::env::var("CONVERGENCE_WEBHOOK_URL") {
        if !url.trim().is_empty() {
            cfg.notify.webhook_url = Some(url);
        }
    }
    let webhook_url = cfg.notify.webhook_url.clone();

    let engine = Arc::new(ConfidenceEngine::new(cfg).context("building engine")?);

    let mut tasks = vec![
        spawn_window_ticker(engine.clone()),
        spawn_feedback_flusher(engine.clone()),
    ];
    if let Some(url) = webhook_url {
        tracing::info!("convergence webhook forwarding enabled");
        tasks.push(spawn_forwarder(engine.subscribe(), WebhookNotifier::new(url)));
    }

    let app = router(engine.clone())?;
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    for t in tasks {
        t.shutdown().await;
    }
    // apply feedback still queued at shutdown
    engine.flush_feedback();
    tracing::info!("shutdown complete");
    Ok(())
}
