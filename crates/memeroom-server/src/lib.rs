pub mod api;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod health;
pub mod prompts;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod transition;
pub mod ws;

use std::time::Duration;

use axum::Router;
use axum::http::Method;
use axum::routing::get;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use config::ServerConfig;
use state::AppState;

/// Build the Axum router and application state from a config.
pub fn build_app(config: ServerConfig) -> (Router<()>, AppState) {
    router(AppState::new(config))
}

/// Build the router around an existing state.
pub fn router(state: AppState) -> (Router<()>, AppState) {
    let api_routes = Router::new()
        .route("/rooms", get(api::list_rooms))
        .route("/rooms/{room_id}", get(api::get_room));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .nest("/api/v1", api_routes)
        .layer(cors)
        .with_state(state.clone());

    (app, state)
}

/// Background upkeep: the idle-room reaper. Stops when `shutdown` fires.
pub fn spawn_background_tasks(state: &AppState, shutdown: CancellationToken) -> JoinHandle<()> {
    let every = Duration::from_secs(state.config.rooms.reap_interval_secs);
    state.registry.spawn_reaper(every, shutdown)
}
