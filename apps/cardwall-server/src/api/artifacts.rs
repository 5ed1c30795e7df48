use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;

use crate::responses::problem_from;
use crate::AppState;

pub async fn artifact_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.kernel().get_artifact(&id) {
        Ok(payload) => Json(payload).into_response(),
        Err(err) => problem_from(&err),
    }
}
