use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::fmt::Display;

pub type AppResult<T> = Result<T, AppErr>;

/* ── HTTP-facing errors (room endpoints, upgrade) ── */
#[derive(thiserror::Error, Debug)]
pub enum AppErr {
    #[error("Bad request: {0}")]
    Bad(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl IntoResponse for AppErr {
    fn into_response(self) -> axum::response::Response {
        let (code, message) = match self {
            AppErr::Bad(msg)       => (StatusCode::BAD_REQUEST, msg),
            AppErr::NotFound(msg)  => (StatusCode::NOT_FOUND, msg),
            AppErr::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
        };
        (code, Json(json!({ "message": message }))).into_response()
    }
}

/* helper: any displayable error → 400 */
pub fn bad<E: Display>(e: E) -> AppErr { AppErr::Bad(e.to_string()) }

/// The target room is absent, either never created or deleted concurrently.
/// Always absorbed by the caller, never fatal.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("room not found: {0}")]
pub struct RoomNotFound(pub String);

impl From<RoomNotFound> for AppErr {
    fn from(_: RoomNotFound) -> Self { AppErr::NotFound("room not found".into()) }
}

/// Why a session could not be added to a room.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinErr {
    #[error(transparent)]
    NotFound(#[from] RoomNotFound),

    #[error("session {0} cannot take the chat replay, join refused")]
    NoReplay(String),
}

/// A frame that does not conform to the envelope format.
#[derive(thiserror::Error, Debug)]
pub enum DecodeErr {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("bad {kind} payload: expected {expected}")]
    Payload { kind: &'static str, expected: &'static str },
}

/// Errors that end a session's receive loop.
#[derive(thiserror::Error, Debug)]
pub enum SessionErr {
    #[error(transparent)]
    Decode(#[from] DecodeErr),

    #[error("encode outbound: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("outbound queue closed")]
    Closed,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigErr {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
