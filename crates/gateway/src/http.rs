//! HTTP surface: health, the WebSocket upgrade, and media serving.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::GatewayState;

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(crate::peers::ws::gateway_ws))
        .route("/media/:file", get(serve_media))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "healthy"}))
}

/// `GET /media/{uuid}.{ext}`: stream a stored attachment. 404 when
/// missing, 410 when past its `expiresAt` metadata.
async fn serve_media(
    State(state): State<GatewayState>,
    Path(file): Path<String>,
) -> Response {
    let Some(blob_key) = state.media_index.get(&file).ok().flatten() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(Some((bytes, meta))) = state.blob.get(&blob_key) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Some(expires_at) = meta.custom.get("expiresAt") {
        if let Ok(expires_at) = DateTime::parse_from_rfc3339(expires_at) {
            if expires_at.with_timezone(&Utc) < Utc::now() {
                return StatusCode::GONE.into_response();
            }
        }
    }
    let content_type = if meta.content_type.is_empty() {
        "application/octet-stream".to_owned()
    } else {
        meta.content_type
    };
    ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
}
