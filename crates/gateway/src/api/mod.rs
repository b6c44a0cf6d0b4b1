pub mod admin;
pub mod auth;
pub mod chat;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Authentication is per-user: every `/chat/{user_id}` handler validates
/// the bearer credential itself because it must also compare the resolved
/// user against the path. Only `/health` is public.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(admin::health))
        .route("/chat/:user_id", post(chat::chat))
        .route("/chat/:user_id/conversations", get(chat::list_conversations))
        .route(
            "/chat/:user_id/conversations/:conversation_id",
            get(chat::conversation_transcript),
        )
}

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}
