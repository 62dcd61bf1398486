use axum::Router;

pub mod extract;
pub mod messages;
pub mod rooms;
pub mod session;
pub mod upload;
pub mod ws;

pub fn router() -> Router {
    Router::new()
        .nest(
            "/api",
            rooms::router()
                .merge(session::router())
                .merge(messages::router())
                .merge(upload::router()),
        )
        .nest("/ws", ws::router())
}
