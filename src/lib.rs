//! PIN-addressed ephemeral chat rooms: a room registry, a participant
//! directory, a membership coordinator and a message fan-out engine behind
//! an HTTP + websocket surface.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod messages;
pub mod models;
pub mod participants;
pub mod presence;
pub mod rooms;
pub mod routes;
pub mod state;
pub mod utils;

use axum::{extract::DefaultBodyLimit, Extension, Router};
use tower_http::{limit::RequestBodyLimitLayer, services::ServeDir, trace::TraceLayer};

use crate::state::AppState;

/// The full router with state, body limits, upload serving and request
/// tracing layered on.
pub fn app(state: AppState) -> Router {
    let limit = state.config.body_limit;
    let uploads = ServeDir::new(&state.config.upload_dir);
    Router::new()
        .merge(routes::router())
        .nest_service("/uploads", uploads)
        .layer(Extension(state))
        .layer(DefaultBodyLimit::max(limit))
        .layer(RequestBodyLimitLayer::new(limit))
        .layer(TraceLayer::new_for_http())
}
