//! Small JSON/HTML surfaces: liveness, version, cover proxy, cache
//! administration.

use crate::auth::{authenticate, AuthState};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use sabcache::CacheIndex;
use sabstore::CacheStatus;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct ApiState {
    pub auth: AuthState,
    pub index: Arc<CacheIndex>,
}

pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/covers/{item_id}", get(cover))
        .route("/cache", get(cache_list))
        .route("/cache/status/{item_id}", get(cache_status))
        .route("/cache/{item_id}", delete(cache_delete))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "sabridge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Proxies the ABS cover image with the user's token attached, so the
/// browser never needs ABS credentials.
async fn cover(
    State(state): State<ApiState>,
    jar: CookieJar,
    Path(item_id): Path<String>,
) -> Response {
    let user = match authenticate(&state.auth.store, &state.auth.cipher, &jar) {
        Ok(user) => user,
        Err(status) => return status.into_response(),
    };

    match state.auth.abs.cover(&user.abs_token, &item_id).await {
        Ok(upstream) => {
            let content_type = upstream
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("image/jpeg")
                .to_string();
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from_stream(upstream.bytes_stream()))
                .unwrap()
                .into_response()
        }
        Err(sababs::AbsError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!("Cover proxy failed for {}: {}", item_id, e);
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn cache_list(State(state): State<ApiState>, jar: CookieJar) -> Response {
    if let Err(status) = authenticate(&state.auth.store, &state.auth.cipher, &jar) {
        return status.into_response();
    }

    match state.index.list_all() {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => {
            warn!("Cache listing failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// HTML fragment the item page polls while a build runs.
async fn cache_status(
    State(state): State<ApiState>,
    jar: CookieJar,
    Path(item_id): Path<String>,
) -> Response {
    if let Err(status) = authenticate(&state.auth.store, &state.auth.cipher, &jar) {
        return status.into_response();
    }

    let entry = match state.index.lookup(&item_id) {
        Ok(entry) => entry,
        Err(e) => {
            warn!("Cache status lookup failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    Html(cache_status_fragment(entry.as_ref().map(|e| e.status))).into_response()
}

pub fn cache_status_fragment(status: Option<CacheStatus>) -> String {
    let (class, label) = match status {
        Some(CacheStatus::Ready) => ("ready", "Cached"),
        Some(CacheStatus::InProgress) => ("in-progress", "Preparing…"),
        Some(CacheStatus::Pending) => ("pending", "Queued"),
        Some(CacheStatus::Failed) => ("failed", "Failed"),
        None => ("none", "Not cached"),
    };
    format!(r#"<span class="cache-status {}">{}</span>"#, class, label)
}

async fn cache_delete(
    State(state): State<ApiState>,
    jar: CookieJar,
    Path(item_id): Path<String>,
) -> Response {
    if let Err(status) = authenticate(&state.auth.store, &state.auth.cipher, &jar) {
        return status.into_response();
    }

    match state.index.delete(&item_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!("Cache delete failed for {}: {}", item_id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
