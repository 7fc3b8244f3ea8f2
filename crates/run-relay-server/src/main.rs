//! Run relay server.
//!
//! Starts agent runs over HTTP and streams their events to any number of
//! observers as server-sent events.

mod config;
mod shutdown;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use clap::Parser;
use run_relay_executor::{AutoApproveHandler, CommandExecutor};
use run_relay_session::{AdmissionController, RunOrchestrator, SessionRegistry};
use run_relay_transport::{AppState, router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Args;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let cors = build_cors(&args.allow_origins)?;

    let registry = SessionRegistry::new();
    let executor = CommandExecutor::new(args.command_builder(), args.working_dir());
    let orchestrator = Arc::new(RunOrchestrator::new(
        registry.clone(),
        Arc::new(executor),
        Arc::new(AutoApproveHandler),
        AdmissionController::new(args.mode),
    ));
    let heartbeat = registry.spawn_heartbeat(args.keep_alive());

    let mut app = router(AppState::new(Arc::clone(&orchestrator)));
    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind listener on {}", args.bind))?;
    tracing::info!(mode = %args.mode, "run relay listening on http://{}", args.bind);

    // Open event streams never end on their own, so shutdown has to close
    // them before the server can drain.
    let draining = Arc::clone(&orchestrator);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = shutdown::wait_for_signal().await {
                tracing::error!("Failed to listen for shutdown signals: {e}");
                std::future::pending::<()>().await;
            }
            draining.shutdown().await;
        })
        .await
        .context("server error")?;

    heartbeat.abort();
    tracing::info!("run relay stopped");
    Ok(())
}

/// CORS for the configured origins. `None` when no origin is configured.
fn build_cors(origins: &[String]) -> Result<Option<CorsLayer>> {
    if origins.is_empty() {
        return Ok(None);
    }
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    if origins.iter().any(|o| o == "*") {
        return Ok(Some(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(methods)
                .allow_headers(Any),
        ));
    }

    let allowed = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid --allow-origin value: {origin}"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(methods)
            .allow_headers(Any),
    ))
}
