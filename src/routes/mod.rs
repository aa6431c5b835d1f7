use axum::Router;

pub mod health;
pub mod rooms;
pub mod ws;

pub fn router() -> Router {
    Router::new()
        .merge(rooms::router())
        .merge(ws::router())
        .merge(health::router())
}
