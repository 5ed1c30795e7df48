use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{api, AppState};

pub mod paths {
    pub const HEALTHZ: &str = "/healthz";
    pub const ABOUT: &str = "/about";
    pub const SHUTDOWN: &str = "/shutdown";
    pub const CARDS: &str = "/cards";
    pub const SHOW: &str = "/show";
    pub const RUN_CARDS: &str = "/runs/{label}/cards";
    pub const EVENTS: &str = "/events";
    pub const UI_EVENTS: &str = "/ui/events";
    pub const RUNS: &str = "/runs";
    pub const RUN: &str = "/runs/{label}";
    pub const RUNS_CLEAN: &str = "/runs/clean";
    pub const ARTIFACT: &str = "/artifacts/{id}";
    pub const PENDING: &str = "/pending";
    pub const PENDING_ACK: &str = "/pending/{id}/ack";
    pub const EXPORT: &str = "/export";
}

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route(paths::HEALTHZ, get(api::meta::healthz))
        .route(paths::ABOUT, get(api::meta::about))
        .route(paths::SHUTDOWN, post(api::meta::shutdown))
        .route(paths::CARDS, post(api::cards::cards_write))
        .route(paths::SHOW, post(api::cards::cards_show))
        .route(paths::RUN_CARDS, get(api::cards::run_cards))
        .route(paths::EVENTS, get(api::events::events_sse))
        .route(paths::UI_EVENTS, post(api::ui::ui_event))
        .route(paths::RUNS, get(api::runs::runs_list))
        .route(paths::RUN, delete(api::runs::runs_delete))
        .route(paths::RUNS_CLEAN, post(api::runs::runs_clean))
        .route(paths::ARTIFACT, get(api::artifacts::artifact_get))
        .route(paths::PENDING, get(api::pending::pending_list))
        .route(paths::PENDING_ACK, post(api::pending::pending_ack))
        .route(paths::EXPORT, post(api::export::export_write))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
