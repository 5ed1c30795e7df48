use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use cardwall_events::topics;
use cardwall_protocol::parse_older_than;
use serde::Deserialize;
use serde_json::json;

use crate::responses::{admin_ok, problem_from, unauthorized};
use crate::AppState;

pub async fn runs_list(State(state): State<AppState>) -> impl IntoResponse {
    match state.kernel().list_runs() {
        Ok(items) => Json(json!({"count": items.len(), "items": items})).into_response(),
        Err(err) => problem_from(&err),
    }
}

/// Idempotent: deleting an absent run reports `deleted: false`.
pub async fn runs_delete(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> impl IntoResponse {
    if !admin_ok(&headers) {
        return unauthorized();
    }
    match state.kernel().delete_run(&label) {
        Ok(deleted) => {
            if deleted {
                state
                    .bus()
                    .publish(topics::TOPIC_RUN_DELETED, &json!({"run": label}));
            }
            Json(json!({"deleted": deleted})).into_response()
        }
        Err(err) => problem_from(&err),
    }
}

#[derive(Deserialize)]
pub struct CleanRequest {
    pub older_than: String,
}

pub async fn runs_clean(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CleanRequest>,
) -> impl IntoResponse {
    if !admin_ok(&headers) {
        return unauthorized();
    }
    let cutoff = match parse_older_than(&req.older_than) {
        Ok(d) => d,
        Err(err) => return problem_from(&err),
    };
    match state.kernel().clean_runs(cutoff) {
        Ok(removed) => Json(json!({"removed": removed})).into_response(),
        Err(err) => problem_from(&err),
    }
}
