// =============================================================================
// Query Server — Axum 0.7
// =============================================================================
//
// `/candles?limit=N` (any method) returns the newest N candles as
// `[bucket_start, open, high, low, close]` tuples, oldest first. Bad or
// missing limits are corrected, never rejected: this endpoint always answers
// 200 with whatever history is held.
//
// CORS is fully permissive; the feed is public and read-only.
// =============================================================================

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Json, Query, State},
    response::{Html, IntoResponse},
    routing::{any, get},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;

const INFO_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Candle Recorder</title>
    <style>
        body { background: #121212; color: #ccc; font-family: sans-serif; text-align: center; padding-top: 100px; }
        .status { font-size: 2.5em; background: #00c853; display: inline-block; padding: 20px 40px; border-radius: 10px; color: white; font-weight: bold; }
        .desc { margin-top: 20px; font-size: 0.9em; color: #888; }
    </style>
</head>
<body>
    <div class="status">Server running</div>
    <div class="desc">Candles available at /candles?limit=N</div>
</body>
</html>
"#;

// =============================================================================
// Router construction
// =============================================================================

/// Build the router with CORS middleware and shared state. Unknown paths
/// get the static info page.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/candles", any(candles))
        .route("/candles/", any(candles))
        .route("/api/v1/health", get(health))
        .fallback(info_page)
        .layer(cors)
        .with_state(state)
}

/// Resolve the `limit` query value.
///
/// Only the leading integer is read, so `"5abc"` and `"3.7"` mean 5 and 3.
/// Absent, non-numeric and zero fall back to `default`; negative values
/// clamp to zero.
pub fn effective_limit(raw: Option<&str>, default: usize) -> usize {
    match raw.and_then(leading_integer) {
        Some(n) if n > 0 => usize::try_from(n).unwrap_or(usize::MAX),
        Some(n) if n < 0 => 0,
        _ => default,
    }
}

/// Optional sign followed by at least one digit, ignoring leading space.
fn leading_integer(raw: &str) -> Option<i64> {
    let s = raw.trim_start();
    let sign_len = usize::from(s.starts_with(['-', '+']));
    let digits = s[sign_len..].bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    s[..sign_len + digits].parse().ok()
}

// =============================================================================
// Candles
// =============================================================================

async fn candles(
    State(state): State<Arc<AppState>>,
    client: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let limit = effective_limit(
        params.get("limit").map(String::as_str),
        state.config.default_limit,
    );
    let rows = state.recent_candles(limit);

    let client = client
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    info!(
        client = %client,
        limit,
        returned = rows.len(),
        at = %chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "candle query"
    );

    Json(rows)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

// =============================================================================
// Fallback
// =============================================================================

async fn info_page() -> impl IntoResponse {
    Html(INFO_PAGE)
}

// =============================================================================
// Tests
// =============================================================================
