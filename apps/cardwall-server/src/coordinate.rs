use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cardwall_events::topics;
use cardwall_protocol::{
    Card, CardSubmission, Error, OutcomeAction, PendingRequest, Result, ShowOutcome, UiAction,
    UiEvent, DEFAULT_WAIT_TIMEOUT_SECS,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::AppState;

pub type EventCallback = Arc<dyn Fn(&UiEvent) -> anyhow::Result<()> + Send + Sync>;

/// Correlates inbound browser events with blocking waits, the durable
/// pending queue and registered callbacks. Waits are memory-only;
/// resolution is exactly-once because the oneshot sender is removed from
/// the map under the lock before anyone uses it.
#[derive(Default)]
pub struct Coordinator {
    waits: Mutex<HashMap<String, oneshot::Sender<ShowOutcome>>>,
    callbacks: Mutex<Vec<EventCallback>>,
}

impl Coordinator {
    /// At most one outstanding wait per card id; a re-register drops the
    /// stale sender, which wakes the previous caller empty-handed.
    pub fn register_wait(&self, card_id: &str) -> oneshot::Receiver<ShowOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waits
            .lock()
            .expect("waits lock")
            .insert(card_id.to_string(), tx);
        rx
    }

    pub fn take_wait(&self, card_id: &str) -> Option<oneshot::Sender<ShowOutcome>> {
        self.waits.lock().expect("waits lock").remove(card_id)
    }

    pub fn open_waits(&self) -> usize {
        self.waits.lock().expect("waits lock").len()
    }

    pub fn add_callback(&self, cb: EventCallback) {
        self.callbacks.lock().expect("callbacks lock").push(cb);
    }

    fn run_callbacks(&self, ev: &UiEvent) {
        let cbs: Vec<EventCallback> = self.callbacks.lock().expect("callbacks lock").clone();
        for cb in cbs {
            if let Err(err) = cb(ev) {
                tracing::warn!(card_id = %ev.card_id, %err, "on_event callback failed");
            }
        }
    }
}

/// What the dispatcher did with an event.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Dispatched {
    ResolvedWait,
    Enqueued,
    Callbacks,
}

/// Single dispatch point for every inbound browser event: open blocking
/// wait first, then the durable queue for send actions, then callbacks.
pub fn dispatch(state: &AppState, ev: &UiEvent) -> Result<Dispatched> {
    let card = state
        .kernel()
        .get_card(&ev.card_id)?
        .ok_or_else(|| Error::NotFound(format!("card {}", ev.card_id)))?;
    state.bus().publish(topics::TOPIC_UI_EVENT, ev);

    if matches!(ev.action, UiAction::Confirm | UiAction::Skip) {
        if let Some(tx) = state.coordinator().take_wait(&ev.card_id) {
            let outcome = build_outcome(state, &card, ev)?;
            state.bus().publish(
                topics::TOPIC_WAIT_RESOLVED,
                &json!({"card_id": card.id, "action": outcome.action}),
            );
            // Receiver gone means the caller gave up between our remove
            // and this send; the timeout already answered them.
            let _ = tx.send(outcome);
            return Ok(Dispatched::ResolvedWait);
        }
    }

    if ev.action == UiAction::Send && card.interactive {
        let req = enqueue_pending(state, &card, ev)?;
        state.bus().publish(topics::TOPIC_PENDING_CREATED, &req);
        return Ok(Dispatched::Enqueued);
    }

    state.coordinator().run_callbacks(ev);
    Ok(Dispatched::Callbacks)
}

fn build_outcome(state: &AppState, card: &Card, ev: &UiEvent) -> Result<ShowOutcome> {
    match ev.action {
        UiAction::Confirm => {
            let artifact_id = match &ev.selection {
                Some(sel) => Some(state.kernel().put_artifact(&card.run, sel)?),
                None => None,
            };
            let summary = match selection_rows(ev.selection.as_ref()) {
                Some(n) => format!("confirmed with {n} selected rows"),
                None => "confirmed".to_string(),
            };
            Ok(ShowOutcome {
                action: OutcomeAction::Confirm,
                message: ev.message.clone(),
                summary,
                artifact_id,
            })
        }
        UiAction::Skip => Ok(ShowOutcome {
            action: OutcomeAction::Skip,
            message: ev.message.clone(),
            summary: "skipped".to_string(),
            artifact_id: None,
        }),
        _ => Err(Error::Validation("not a resolving action".into())),
    }
}

fn enqueue_pending(state: &AppState, card: &Card, ev: &UiEvent) -> Result<PendingRequest> {
    let artifact_id = match &ev.selection {
        Some(sel) => Some(state.kernel().put_artifact(&card.run, sel)?),
        None => None,
    };
    state
        .kernel()
        .insert_pending(card, ev.message.as_deref(), artifact_id.as_deref())
}

fn selection_rows(selection: Option<&Value>) -> Option<usize> {
    match selection {
        Some(Value::Array(rows)) => Some(rows.len()),
        Some(Value::Object(map)) => match map.get("rows") {
            Some(Value::Array(rows)) => Some(rows.len()),
            _ => None,
        },
        _ => None,
    }
}

/// Non-blocking write: store, push, return the card.
pub fn write_card(state: &AppState, sub: &CardSubmission) -> Result<Card> {
    let card = state.kernel().insert_card(sub)?;
    state.bus().publish(topics::TOPIC_CARD_WRITTEN, &card);
    Ok(card)
}

/// Blocking show: write the card interactive, then suspend until a
/// confirm/skip event or the timeout. First writer wins at the boundary:
/// whoever removes the wait slot under the lock decides the resolution.
pub async fn show_and_wait(
    state: &AppState,
    mut sub: CardSubmission,
    prompt: Option<String>,
    timeout_secs: Option<f64>,
) -> Result<(Card, ShowOutcome)> {
    let secs = timeout_secs.unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS as f64);
    // Rejected before the card is written so a bad timeout leaves no trace.
    if !secs.is_finite() {
        return Err(Error::Validation(format!("timeout_secs must be finite, got {secs}")));
    }
    let dur = Duration::try_from_secs_f64(secs.max(0.0))
        .map_err(|_| Error::Validation(format!("timeout_secs out of range: {secs}")))?;
    sub.interactive = true;
    if sub.description.is_none() {
        sub.description = prompt;
    }
    let card = write_card(state, &sub)?;
    let mut rx = state.coordinator().register_wait(&card.id);
    tokio::select! {
        res = &mut rx => {
            let outcome = res.unwrap_or_else(|_| ShowOutcome::timeout());
            Ok((card, outcome))
        }
        _ = tokio::time::sleep(dur) => {
            if state.coordinator().take_wait(&card.id).is_some() {
                Ok((card, ShowOutcome::timeout()))
            } else {
                // An event claimed the slot right at the deadline; its
                // resolution is already in flight on the channel.
                let outcome = rx.await.unwrap_or_else(|_| ShowOutcome::timeout());
                Ok((card, outcome))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_slots_resolve_exactly_once() {
        let c = Coordinator::default();
        let _rx = c.register_wait("c1");
        assert_eq!(c.open_waits(), 1);
        assert!(c.take_wait("c1").is_some());
        assert!(c.take_wait("c1").is_none());
        assert_eq!(c.open_waits(), 0);
    }

    #[test]
    fn reregistering_a_wait_drops_the_stale_slot() {
        let c = Coordinator::default();
        let mut first = c.register_wait("c1");
        let _second = c.register_wait("c1");
        assert_eq!(c.open_waits(), 1);
        // The first caller wakes with a closed channel, not a phantom wait.
        assert!(first.try_recv().is_err());
    }

    #[test]
    fn selection_row_counting() {
        assert_eq!(selection_rows(Some(&json!([1, 2, 3]))), Some(3));
        assert_eq!(selection_rows(Some(&json!({"rows": [1]}))), Some(1));
        assert_eq!(selection_rows(Some(&json!({"cells": 4}))), None);
        assert_eq!(selection_rows(None), None);
    }

    #[tokio::test]
    async fn bad_timeouts_are_rejected_without_writing_a_card() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = cardwall_kernel::Kernel::open(dir.path()).unwrap();
        let bus = cardwall_events::Bus::new(8);
        let (tx, _rx) = tokio::sync::watch::channel(false);
        let state = AppState::new(bus, kernel, tx, 0);
        for bad in [f64::NAN, f64::INFINITY, 1e30] {
            let err = show_and_wait(
                &state,
                CardSubmission {
                    kind: Some(cardwall_protocol::CardKind::Markdown),
                    payload: json!("# gate"),
                    run: Some("r1".into()),
                    ..Default::default()
                },
                None,
                Some(bad),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }
        assert!(state.kernel().list_cards("r1").unwrap().is_empty());
    }

    #[test]
    fn callback_errors_are_contained() {
        let c = Coordinator::default();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        c.add_callback(Arc::new(|_| anyhow::bail!("boom")));
        let hits2 = hits.clone();
        c.add_callback(Arc::new(move |_| {
            hits2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }));
        let ev = UiEvent {
            card_id: "c1".into(),
            action: UiAction::Click,
            message: None,
            selection: None,
        };
        c.run_callbacks(&ev);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
