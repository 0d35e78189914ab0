mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::Router;
use codepad_common::Config;
use codepad_engine::executor::{MAX_INPUT_BYTES, MAX_SOURCE_CODE_BYTES};
use codepad_engine::Engine;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// Room for the largest accepted source and input once JSON-escaped; the
/// engine enforces the exact limits
pub const MAX_REQUEST_BODY_BYTES: usize = 2 * (MAX_SOURCE_CODE_BYTES + MAX_INPUT_BYTES) + 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // LOG_FORMAT=json for log shippers, human-readable otherwise
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Build the application router around an engine
pub fn app(engine: Arc<Engine>) -> Router {
    let state = Arc::new(AppState { engine });

    Router::new()
        .merge(routes::routes())
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => warn!("Received shutdown signal, finishing in-flight jobs..."),
        Err(e) => {
            error!(error = %e, "Failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Codepad API booting...");

    metrics::init_metrics().context("Failed to register metrics")?;
    info!("Metrics registry initialized");

    let config = Config::from_env();
    let engine = Engine::from_config(config.clone()).with_context(|| {
        format!(
            "Failed to load language configuration from {}",
            config.language_config_path.display()
        )
    })?;

    info!(
        work_dir = %config.work_dir.display(),
        languages = ?engine.languages().list_languages(),
        default_timeout_ms = config.default_timeout_ms,
        max_output_bytes = config.max_output_bytes,
        "Engine configured"
    );

    // Missing toolchains are not fatal: those languages fail per request
    for probe in engine.probe_toolchains().await {
        match &probe.resolved {
            Some(program) => info!(
                language = %probe.language,
                slot = probe.slot,
                program = %program,
                version = probe.version.as_deref().unwrap_or("unknown"),
                "Toolchain available"
            ),
            None => warn!(
                language = %probe.language,
                slot = probe.slot,
                candidates = ?probe.candidates,
                "Toolchain not found"
            ),
        }
    }

    let engine = Arc::new(engine);
    let app = app(engine.clone());

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!("HTTP server listening on {}", config.bind_addr);
    info!("Ready to accept jobs");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    engine.flush().await;
    info!("Shutdown complete");
    Ok(())
}
