use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cardwall_protocol::Error;
use serde_json::json;
use sha2::Digest as _;

use crate::config;

pub fn problem(status: StatusCode, title: &str, detail: Option<&str>) -> Response {
    let mut body = json!({"type": "about:blank", "title": title, "status": status.as_u16()});
    if let Some(d) = detail {
        body["detail"] = json!(d);
    }
    (status, Json(body)).into_response()
}

pub fn problem_from(err: &Error) -> Response {
    match err {
        Error::Validation(d) => problem(StatusCode::BAD_REQUEST, "Bad Request", Some(d)),
        Error::NotFound(d) => problem(StatusCode::NOT_FOUND, "Not Found", Some(d)),
        Error::Bind(d) | Error::Transport(d) => {
            problem(StatusCode::BAD_GATEWAY, "Transport Error", Some(d))
        }
        Error::Storage(d) => problem(StatusCode::INTERNAL_SERVER_ERROR, "Error", Some(d)),
    }
}

pub fn unauthorized() -> Response {
    problem(StatusCode::UNAUTHORIZED, "Unauthorized", None)
}

/// Gate for destructive endpoints. Debug mode opens them for local
/// development; otherwise `CARDWALL_ADMIN_TOKEN` must match the bearer
/// token or `X-Cardwall-Admin` header.
pub fn admin_ok(headers: &HeaderMap) -> bool {
    if config::debug_mode() {
        return true;
    }
    let Some(want) = config::admin_token() else {
        // No token configured: local single-user setup, allow.
        return true;
    };
    let mut presented: Option<String> = None;
    if let Some(hv) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(bearer) = hv.strip_prefix("Bearer ") {
            presented = Some(bearer.to_string());
        }
    }
    if presented.is_none() {
        if let Some(hv) = headers.get("X-Cardwall-Admin").and_then(|h| h.to_str().ok()) {
            presented = Some(hv.to_string());
        }
    }
    let Some(ptok) = presented else { return false };
    // Compare digests so length differences leak nothing.
    let digest = |s: &str| -> [u8; 32] {
        let mut h = sha2::Sha256::new();
        h.update(s.as_bytes());
        h.finalize().into()
    };
    let (a, b) = (digest(&want), digest(&ptok));
    let mut diff: u8 = 0;
    for i in 0..a.len() {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}
