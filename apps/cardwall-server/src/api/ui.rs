use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use cardwall_protocol::UiEvent;
use serde_json::json;

use crate::responses::problem_from;
use crate::{coordinate, AppState};

/// Inbound browser events: confirm/skip responses, send-to-agent
/// actions, clicks and selection changes.
pub async fn ui_event(
    State(state): State<AppState>,
    Json(ev): Json<UiEvent>,
) -> impl IntoResponse {
    match coordinate::dispatch(&state, &ev) {
        Ok(handled) => (StatusCode::ACCEPTED, Json(json!({"handled": handled}))).into_response(),
        Err(err) => problem_from(&err),
    }
}
