use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;

use crate::export::{self, ExportFormat};
use crate::responses::{admin_ok, problem_from, unauthorized};
use crate::AppState;

#[derive(Deserialize)]
pub struct ExportRequest {
    pub path: PathBuf,
    pub format: ExportFormat,
    #[serde(default)]
    pub run: Option<String>,
}

/// Read-only: exporting never touches run activity timestamps.
pub async fn export_write(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<ExportRequest>,
) -> impl IntoResponse {
    if !admin_ok(&headers) {
        return unauthorized();
    }
    match export::export(state.kernel(), &req.path, req.format, req.run.as_deref()) {
        Ok(path) => Json(json!({"path": path})).into_response(),
        Err(err) => problem_from(&err),
    }
}
