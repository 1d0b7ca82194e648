// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The orchestrator HTTP edge.
//!
//! Many concurrent chat requests run cooperatively in one process; each
//! owns an independent consumer on its session's egress stream.  All
//! waits are on bus reads, LLM stream reads (inside the workers), or
//! timers — blocking I/O never happens on these tasks.

pub mod chat;
mod error;
pub mod mode;
mod sessions;
mod state;

use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tracing::info;

use solva_bus::{Bus, RedisBus};
use solva_config::Config;
use solva_store::Store;

pub use chat::{relay, ChatRequest, SseFrame};
pub use error::ServerError;
pub use mode::{pick_mode, ModeAssigner};
pub use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat::chat))
        .route(
            "/api/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/api/sessions/:session_id",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/api/sessions/:session_id/history", get(sessions::get_history))
        .route("/api/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let bus_status = match state.bus.ping().await {
        Ok(()) => "healthy",
        Err(_) => "unhealthy",
    };
    let database_status = match state.store.ping().await {
        Ok(()) => "healthy",
        Err(_) => "unhealthy",
    };
    let session_streams = state
        .bus
        .list_streams("solva:agent_to_backend_session_")
        .await
        .map(|streams| streams.len())
        .unwrap_or(0);
    let status = if bus_status == "healthy" && database_status == "healthy" {
        "healthy"
    } else {
        "degraded"
    };
    Json(serde_json::json!({
        "type": "health_check",
        "status": status,
        "bus_status": bus_status,
        "database_status": database_status,
        "session_streams": session_streams,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Run the orchestrator until the process is stopped.
pub async fn serve(config: Arc<Config>) -> anyhow::Result<()> {
    let bus: Arc<dyn Bus> = Arc::new(
        RedisBus::connect(&config.bus.redis_url, config.bus.stream_trim_maxlen)
            .await
            .context("connecting to the bus")?,
    );

    let database_url = config
        .store
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for the orchestrator")?;
    let store = Store::connect(database_url, config.store.max_connections)
        .await
        .context("connecting to the session store")?;

    let state = AppState::new(bus, store, config.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    info!(bind = %config.server.bind, "orchestrator listening");
    axum::serve(listener, app).await?;
    Ok(())
}
