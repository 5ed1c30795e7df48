use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use cardwall_events::topics;
use serde_json::json;

use crate::responses::problem_from;
use crate::AppState;

/// At-least-once: the same request keeps appearing here until it is
/// acknowledged.
pub async fn pending_list(State(state): State<AppState>) -> impl IntoResponse {
    match state.kernel().list_pending() {
        Ok(items) => Json(json!({"count": items.len(), "items": items})).into_response(),
        Err(err) => problem_from(&err),
    }
}

pub async fn pending_ack(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.kernel().ack_pending(&id) {
        Ok(acked) => {
            if acked {
                state
                    .bus()
                    .publish(topics::TOPIC_PENDING_ACKED, &json!({"id": id}));
            }
            Json(json!({"acked": acked})).into_response()
        }
        Err(err) => problem_from(&err),
    }
}
