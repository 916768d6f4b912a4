//! HTTP API.
//!
//! JSON in, JSON out. Requests authenticate with `Authorization: Bearer
//! <token>`; every request carries a [`convo_store::Context`] with the
//! configured deadline, installed by [`extract::request_context`].

mod events;
mod extract;
mod inbound;
mod tasks;
mod threads;
mod users;
mod views;


use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, Method};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ServerError;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);
    // Multipart overhead on top of the largest upload.
    let body_limit = state.config.max_blob_size + 1024 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/blobs/{*path}", get(blob_download))
        .merge(users::routes())
        .merge(threads::routes())
        .merge(events::routes())
        .merge(inbound::routes())
        .merge(tasks::routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            extract::request_context,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Content type from the leading bytes; uploads carry no extension.
fn sniff(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG") {
        "image/png"
    } else if data.starts_with(b"\xFF\xD8\xFF") {
        "image/jpeg"
    } else if data.starts_with(b"GIF8") {
        "image/gif"
    } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

async fn blob_download(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ServerError> {
    let data = state.clients.blobs.get(&path).await?;
    Ok(([(header::CONTENT_TYPE, sniff(&data))], data).into_response())
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
