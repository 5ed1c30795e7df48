pub mod api;
pub mod app_state;
pub mod config;
pub mod coordinate;
pub mod export;
pub mod responses;
pub mod router;
pub mod service;
pub mod telemetry;

pub use app_state::AppState;
pub use service::{
    server_status, start, stop_server, Mode, ServerStatus, ServiceHandle, StartOptions,
};
