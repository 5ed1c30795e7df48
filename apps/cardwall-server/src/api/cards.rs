use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use cardwall_protocol::CardSubmission;
use serde::Deserialize;
use serde_json::json;

use crate::responses::problem_from;
use crate::{coordinate, AppState};

/// Write or replace a card. The card is pushed to connected viewers
/// before the response returns.
pub async fn cards_write(
    State(state): State<AppState>,
    Json(sub): Json<CardSubmission>,
) -> impl IntoResponse {
    match coordinate::write_card(&state, &sub) {
        Ok(card) => (StatusCode::CREATED, Json(card)).into_response(),
        Err(err) => problem_from(&err),
    }
}

pub async fn run_cards(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> impl IntoResponse {
    match state.kernel().list_cards(&label) {
        Ok(cards) => Json(json!({"run": label, "count": cards.len(), "items": cards}))
            .into_response(),
        Err(err) => problem_from(&err),
    }
}

#[derive(Deserialize)]
pub struct ShowRequest {
    pub card: CardSubmission,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
}

/// Blocking show. The handler suspends until the reviewer responds or
/// the timeout elapses, so remote callers get the same semantics as an
/// embedded one.
pub async fn cards_show(
    State(state): State<AppState>,
    Json(req): Json<ShowRequest>,
) -> impl IntoResponse {
    match coordinate::show_and_wait(&state, req.card, req.prompt, req.timeout_secs).await {
        Ok((card, outcome)) => {
            Json(json!({"card_id": card.id, "run": card.run, "outcome": outcome})).into_response()
        }
        Err(err) => problem_from(&err),
    }
}
