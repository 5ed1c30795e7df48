use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use cardwall_events::Envelope;
use serde::Deserialize;
use tokio_stream::StreamExt as _;

use crate::AppState;

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub replay: Option<usize>,
}

fn wants(env: &Envelope, run: Option<&str>) -> bool {
    let Some(run) = run else { return true };
    // Service-level events carry no run and go to everyone.
    match env.payload.get("run").and_then(|v| v.as_str()) {
        Some(r) => r == run,
        None => true,
    }
}

/// Push channel to the browser: every bus envelope as an SSE event,
/// optionally filtered to one run, with bounded replay for late joiners.
pub async fn events_sse(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> impl IntoResponse {
    let (tx, rx) = tokio::sync::mpsc::channel::<Envelope>(128);
    let run_filter = q.run.clone();
    if let Some(n) = q.replay {
        if n > 0 {
            let tx2 = tx.clone();
            let backlog: Vec<Envelope> = state
                .bus()
                .replay(n)
                .into_iter()
                .filter(|env| wants(env, run_filter.as_deref()))
                .collect();
            tokio::spawn(async move {
                for env in backlog {
                    let _ = tx2.send(env).await;
                }
            });
        }
    }
    let mut bus_rx = state.bus().subscribe();
    tokio::spawn(async move {
        while let Ok(env) = bus_rx.recv().await {
            if wants(&env, run_filter.as_deref()) && tx.send(env).await.is_err() {
                break;
            }
        }
    });
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(|env| {
        let data = serde_json::to_string(&env).unwrap_or_else(|_| "{}".to_string());
        Result::<SseEvent, std::convert::Infallible>::Ok(
            SseEvent::default().event(env.kind.clone()).data(data),
        )
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(10))
            .text("keep-alive"),
    )
}
