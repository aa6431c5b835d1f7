use std::sync::atomic::Ordering;

use axum::{extract::Extension, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::state::{LiveSessions, Rooms};

pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

async fn health(
    Extension(rooms): Extension<Rooms>,
    Extension(live): Extension<LiveSessions>,
) -> Json<Value> {
    Json(json!({
        "status":   "ok",
        "rooms":    rooms.len().await,
        "sessions": live.load(Ordering::Relaxed),
    }))
}
