use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use cardwall_events::Bus;
use cardwall_kernel::Kernel;
use cardwall_server::{router, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tower::util::ServiceExt;

fn build_state(dir: &Path) -> (AppState, watch::Receiver<bool>) {
    let bus = Bus::new_with_replay(64, 64);
    let kernel = Kernel::open(dir).expect("open kernel");
    let (tx, rx) = watch::channel(false);
    (AppState::new(bus, kernel, tx, 0), rx)
}

fn app(state: AppState) -> Router {
    router::build_router().with_state(state)
}

async fn send_json(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    let resp = app.clone().oneshot(req).await.expect("response");
    let status = resp.status();
    let bytes = resp.into_body().collect().await.expect("body").to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    let resp = app.clone().oneshot(req).await.expect("response");
    let status = resp.status();
    let bytes = resp.into_body().collect().await.expect("body").to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn markdown_card(run: &str, title: &str) -> Value {
    json!({
        "kind": "markdown",
        "payload": {"text": format!("# {title}")},
        "title": title,
        "run": run,
    })
}

#[tokio::test]
async fn write_then_read_preserves_render_order() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _rx) = build_state(dir.path());
    let app = app(state);

    let (status, _) = send_json(&app, "POST", "/cards", markdown_card("r1", "Intro")).await;
    assert_eq!(status, StatusCode::CREATED);
    let cohort = json!({
        "kind": "table",
        "title": "Cohort",
        "run": "r1",
        "payload": {"columns": ["id", "age"], "rows": [[1, 34], [2, 41], [3, 29], [4, 55], [5, 38]]},
    });
    send_json(&app, "POST", "/cards", cohort).await;
    let mut banner = markdown_card("r1", "Headline");
    banner["position"] = json!("top");
    send_json(&app, "POST", "/cards", banner).await;

    let (status, body) = get_json(&app, "/runs/r1/cards").await;
    assert_eq!(status, StatusCode::OK);
    let titles: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["title"].as_str().unwrap())
        .collect();
    assert_eq!(titles, ["Headline", "Intro", "Cohort"]);
}

#[tokio::test]
async fn malformed_payloads_are_rejected_with_problem_json() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _rx) = build_state(dir.path());
    let app = app(state);

    let bad = json!({"kind": "table", "run": "r1", "payload": {"rows": [[1]]}});
    let (status, body) = send_json(&app, "POST", "/cards", bad).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["title"], "Bad Request");
    assert!(body["detail"].as_str().unwrap().contains("column"));
}

#[tokio::test]
async fn ui_event_for_unknown_card_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _rx) = build_state(dir.path());
    let app = app(state);

    let ev = json!({"card_id": "missing", "action": "click"});
    let (status, _) = send_json(&app, "POST", "/ui/events", ev).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn send_actions_queue_until_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _rx) = build_state(dir.path());
    let app = app(state);

    let mut card = markdown_card("r1", "Odd spike");
    card["interactive"] = json!(true);
    card["on_send"] = json!("investigate the spike");
    let (_, created) = send_json(&app, "POST", "/cards", card).await;
    let card_id = created["id"].as_str().unwrap().to_string();

    let ev = json!({
        "card_id": card_id,
        "action": "send",
        "message": "what happened here?",
        "selection": [{"t": "12:00", "v": 981}],
    });
    let (status, body) = send_json(&app, "POST", "/ui/events", ev).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["handled"], "enqueued");

    // At-least-once: still there on a second poll.
    for _ in 0..2 {
        let (_, body) = get_json(&app, "/pending").await;
        assert_eq!(body["count"], 1);
        let req = &body["items"][0];
        assert_eq!(req["card_id"].as_str().unwrap(), card_id);
        assert_eq!(req["prompt"], "what happened here?");
        assert_eq!(req["instruction"], "investigate the spike");
        assert!(req["artifact_id"].is_string());
    }

    let (_, body) = get_json(&app, "/pending").await;
    let req_id = body["items"][0]["id"].as_str().unwrap().to_string();
    let artifact_id = body["items"][0]["artifact_id"].as_str().unwrap().to_string();

    let (_, body) = send_json(&app, "POST", &format!("/pending/{req_id}/ack"), json!({})).await;
    assert_eq!(body["acked"], true);
    let (_, body) = get_json(&app, "/pending").await;
    assert_eq!(body["count"], 0);
    let (_, body) = send_json(&app, "POST", &format!("/pending/{req_id}/ack"), json!({})).await;
    assert_eq!(body["acked"], false);

    // The captured selection stays retrievable by id.
    let (status, body) = get_json(&app, &format!("/artifacts/{artifact_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["v"], 981);
}

#[tokio::test]
async fn artifact_lookup_errors_are_distinguished() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _rx) = build_state(dir.path());
    let app = app(state);

    let (status, _) = get_json(&app, "/artifacts/nonsense").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let absent = "0".repeat(64);
    let (status, _) = get_json(&app, &format!("/artifacts/{absent}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_run_is_idempotent_and_clean_respects_age() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _rx) = build_state(dir.path());
    let app = app(state);

    send_json(&app, "POST", "/cards", markdown_card("r1", "a")).await;
    send_json(&app, "POST", "/cards", markdown_card("r2", "b")).await;

    let req = Request::builder()
        .method("DELETE")
        .uri("/runs/r1")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value =
        serde_json::from_slice(&resp.into_body().collect().await.unwrap().to_bytes()).unwrap();
    assert_eq!(body["deleted"], true);

    let (_, body) = get_json(&app, "/runs").await;
    let labels: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["label"].as_str().unwrap())
        .collect();
    assert_eq!(labels, ["r2"]);

    // Nothing is older than 7 days yet.
    let (_, body) = send_json(&app, "POST", "/runs/clean", json!({"older_than": "7d"})).await;
    assert_eq!(body["removed"], 0);
    // "0d" means all runs regardless of age.
    let (_, body) = send_json(&app, "POST", "/runs/clean", json!({"older_than": "0d"})).await;
    assert_eq!(body["removed"], 1);
    let (_, body) = send_json(&app, "POST", "/runs/clean", json!({"older_than": "soon"})).await;
    assert_eq!(body["status"], 400);
    // An absurd count is a 400 too, not a crashed handler.
    let huge = json!({"older_than": "999999999999999d"});
    let (status, _) = send_json(&app, "POST", "/runs/clean", huge).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn blocking_show_times_out_promptly_without_a_browser() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _rx) = build_state(dir.path());
    let app = app(state);

    let req = json!({
        "card": markdown_card("r1", "please review"),
        "prompt": "ok to proceed?",
        "timeout_secs": 0.1,
    });
    let started = Instant::now();
    let (status, body) = send_json(&app, "POST", "/show", req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"]["action"], "timeout");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_show_resolves_once_with_the_first_event() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _rx) = build_state(dir.path());
    let app = app(state);

    let show = json!({
        "card": markdown_card("r1", "gate"),
        "timeout_secs": 5.0,
    });
    let app2 = app.clone();
    let waiter = tokio::spawn(async move { send_json(&app2, "POST", "/show", show).await });

    // Give the show handler time to write the card and register the wait.
    let card_id = loop {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (_, body) = get_json(&app, "/runs/r1/cards").await;
        if let Some(id) = body["items"][0]["id"].as_str() {
            break id.to_string();
        }
    };

    let confirm = json!({
        "card_id": card_id,
        "action": "confirm",
        "message": "looks right",
        "selection": [{"row": 1}, {"row": 2}],
    });
    let (status, body) = send_json(&app, "POST", "/ui/events", confirm.clone()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["handled"], "resolved_wait");

    let (_, body) = waiter.await.unwrap();
    assert_eq!(body["outcome"]["action"], "confirm");
    assert_eq!(body["outcome"]["message"], "looks right");
    assert_eq!(body["outcome"]["summary"], "confirmed with 2 selected rows");
    let artifact_id = body["outcome"]["artifact_id"].as_str().unwrap().to_string();

    // A duplicate confirm finds no open wait and falls through to the
    // callback path instead of resolving anything twice.
    let (_, body) = send_json(&app, "POST", "/ui/events", confirm).await;
    assert_eq!(body["handled"], "callbacks");

    let (status, body) = get_json(&app, &format!("/artifacts/{artifact_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn skip_resolves_without_an_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _rx) = build_state(dir.path());
    let app = app(state);

    let show = json!({"card": markdown_card("r1", "gate"), "timeout_secs": 5.0});
    let app2 = app.clone();
    let waiter = tokio::spawn(async move { send_json(&app2, "POST", "/show", show).await });
    let card_id = loop {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (_, body) = get_json(&app, "/runs/r1/cards").await;
        if let Some(id) = body["items"][0]["id"].as_str() {
            break id.to_string();
        }
    };
    send_json(
        &app,
        "POST",
        "/ui/events",
        json!({"card_id": card_id, "action": "skip"}),
    )
    .await;
    let (_, body) = waiter.await.unwrap();
    assert_eq!(body["outcome"]["action"], "skip");
    assert!(body["outcome"]["artifact_id"].is_null());
}

#[tokio::test]
async fn export_json_round_trips_cards() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _rx) = build_state(dir.path());
    let app = app(state);

    send_json(&app, "POST", "/cards", markdown_card("r1", "one")).await;
    send_json(&app, "POST", "/cards", markdown_card("r1", "two")).await;
    send_json(&app, "POST", "/cards", markdown_card("other", "x")).await;

    let out = dir.path().join("export.json");
    let (status, body) = send_json(
        &app,
        "POST",
        "/export",
        json!({"path": out.to_str().unwrap(), "format": "json", "run": "r1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"].as_str().unwrap(), out.to_str().unwrap());

    let doc: Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(doc["runs"].as_array().unwrap().len(), 1);
    let exported: Vec<&str> = doc["runs"][0]["cards"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_str().unwrap())
        .collect();
    let (_, live) = get_json(&app, "/runs/r1/cards").await;
    let served: Vec<&str> = live["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_str().unwrap())
        .collect();
    assert_eq!(exported, served);
}

#[tokio::test]
async fn export_of_an_empty_run_is_valid() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _rx) = build_state(dir.path());
    let app = app(state);

    let out = dir.path().join("empty.html");
    let (status, _) = send_json(
        &app,
        "POST",
        "/export",
        json!({"path": out.to_str().unwrap(), "format": "html", "run": "nothing-here"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let html = std::fs::read_to_string(&out).unwrap();
    assert!(html.starts_with("<!doctype html>"));
    assert!(html.contains("nothing-here"));
}

#[tokio::test]
async fn replace_updates_in_place_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _rx) = build_state(dir.path());
    let app = app(state);

    let (_, first) = send_json(&app, "POST", "/cards", markdown_card("r1", "draft")).await;
    let id = first["id"].as_str().unwrap();
    send_json(&app, "POST", "/cards", markdown_card("r1", "later")).await;

    let mut replacement = markdown_card("r1", "final");
    replacement["replace"] = json!(id);
    let (status, replaced) = send_json(&app, "POST", "/cards", replacement).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(replaced["id"].as_str().unwrap(), id);

    let (_, body) = get_json(&app, "/runs/r1/cards").await;
    assert_eq!(body["count"], 2);
    assert_eq!(body["items"][0]["title"], "final");

    let mut strict = markdown_card("r1", "nope");
    strict["replace"] = json!("missing-id");
    strict["strict"] = json!(true);
    let (status, _) = send_json(&app, "POST", "/cards", strict).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn shutdown_endpoint_signals_the_serve_loop() {
    let dir = tempfile::tempdir().unwrap();
    let (state, mut rx) = build_state(dir.path());
    let app = app(state);

    let (status, body) = send_json(&app, "POST", "/shutdown", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopping"], true);
    assert!(rx.has_changed().unwrap());
}

#[tokio::test]
async fn healthz_and_about_report_service_state() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _rx) = build_state(dir.path());
    let app = app(state);

    let (status, _) = get_json(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    send_json(&app, "POST", "/cards", markdown_card("r1", "a")).await;
    let (status, body) = get_json(&app, "/about").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "cardwall");
    assert_eq!(body["runs"], 1);
}
