use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use shared::error::{ApiError, ErrorCode};
use tracing::info;

mod app_state;
mod config;
mod demo;
mod ws;

use app_state::AppState;
use config::load_settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let state = AppState::with_demo(&settings).context("failed to build hosted widgets")?;
    info!(widgets = ?state.names(), "widgets hosted");
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", settings.server_bind))?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/widgets", get(list_widgets))
        .route("/widgets/:name/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_widgets(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.names())
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, (StatusCode, Json<ApiError>)> {
    let widget = state.widget(&name).cloned().ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ApiError::new(
                ErrorCode::NotFound,
                format!("no widget named `{name}`"),
            )),
        )
    })?;
    let ws = ws.ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(
                ErrorCode::Validation,
                "websocket upgrade required",
            )),
        )
    })?;
    let render_buffer = state.render_buffer;
    Ok(ws
        .on_upgrade(move |socket| ws::connection(widget, socket, render_buffer))
        .into_response())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
