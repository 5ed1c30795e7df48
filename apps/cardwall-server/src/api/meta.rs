use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use cardwall_events::topics;
use cardwall_protocol::About;
use serde_json::json;

use crate::responses::{admin_ok, problem_from, unauthorized};
use crate::AppState;

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn about(State(state): State<AppState>) -> impl IntoResponse {
    let runs = match state.kernel().count_runs() {
        Ok(n) => n,
        Err(err) => return problem_from(&err),
    };
    Json(About {
        service: "cardwall".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        pid: std::process::id(),
        port: state.port(),
        uptime_secs: state.uptime_secs(),
        runs,
    })
    .into_response()
}

/// Remote shutdown of a detached instance. Run state on disk survives;
/// only the serving process goes away.
pub async fn shutdown(headers: HeaderMap, State(state): State<AppState>) -> impl IntoResponse {
    if !admin_ok(&headers) {
        return unauthorized();
    }
    state
        .bus()
        .publish(topics::TOPIC_SERVICE_STOPPING, &json!({"pid": std::process::id()}));
    state.request_shutdown();
    Json(json!({"stopping": true})).into_response()
}
