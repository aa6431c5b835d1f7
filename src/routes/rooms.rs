//! routes/rooms.rs — room metadata CRUD
use axum::{
    extract::{rejection::JsonRejection, Extension, Json, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{
    error::{bad, AppResult},
    state::{RoomInfo, RoomSummary, Rooms},
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomInput {
    label: String,
    #[serde(default)]
    widget_url: String,
}

pub fn router() -> Router {
    Router::new()
        .route("/rooms", get(list_rooms).post(create_room))
        .route("/rooms/:id", get(get_room).put(update_room).delete(delete_room))
}

async fn list_rooms(Extension(rooms): Extension<Rooms>) -> Json<Vec<RoomSummary>> {
    Json(rooms.list().await)
}

async fn get_room(
    Extension(rooms): Extension<Rooms>,
    Path(id): Path<String>,
) -> AppResult<Json<RoomInfo>> {
    Ok(Json(rooms.lookup(&id).await?))
}

async fn create_room(
    Extension(rooms): Extension<Rooms>,
    body: Result<Json<RoomInput>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(p) = body.map_err(bad)?;
    let room = rooms.create(p.label, p.widget_url).await;
    info!(room = %room.id, label = %room.label, "room created");
    Ok((StatusCode::CREATED, Json(room)))
}

async fn update_room(
    Extension(rooms): Extension<Rooms>,
    Path(id): Path<String>,
    body: Result<Json<RoomInput>, JsonRejection>,
) -> AppResult<Json<RoomInfo>> {
    let Json(p) = body.map_err(bad)?;
    Ok(Json(rooms.update(&id, p.label, p.widget_url).await?))
}

async fn delete_room(
    Extension(rooms): Extension<Rooms>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    rooms.delete(&id).await?;
    info!(room = %id, "room deleted");
    Ok(Json(json!({ "message": "room deleted" })))
}
