use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{delete, get},
    Extension, Json, Router,
};
use serde::Deserialize;

use crate::{
    error::AppResult,
    messages::{self, SendMessage},
    models::{Message, Pagination},
    state::AppState,
};

use super::extract::Session;

pub fn router() -> Router {
    Router::new()
        .route("/messages", get(history).post(send))
        .route("/messages/search", get(search))
        .route("/messages/files", get(files))
        .route("/messages/:id", delete(remove))
}

#[derive(Deserialize)]
struct HistoryQuery {
    room_id:  Option<String>,
    limit:    Option<i64>,
    offset:   Option<i64>,
    after_id: Option<i64>,
}

#[derive(Deserialize)]
struct SearchQuery {
    room_id: Option<String>,
    q:       String,
    limit:   Option<i64>,
    offset:  Option<i64>,
}

async fn history(
    Extension(state): Extension<AppState>,
    session: Session,
    Query(q): Query<HistoryQuery>,
) -> AppResult<Json<Vec<Message>>> {
    let room_id = session.room(q.room_id.as_deref())?;
    let page = Pagination { limit: q.limit, offset: q.offset };
    Ok(Json(messages::list(&state.pool, &room_id, page, q.after_id).await?))
}

async fn send(
    Extension(state): Extension<AppState>,
    Session(p): Session,
    Json(req): Json<SendMessage>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let message = messages::send(&state, &p.id, req).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn search(
    Extension(state): Extension<AppState>,
    session: Session,
    Query(q): Query<SearchQuery>,
) -> AppResult<Json<Vec<Message>>> {
    let room_id = session.room(q.room_id.as_deref())?;
    let page = Pagination { limit: q.limit, offset: q.offset };
    Ok(Json(messages::search(&state.pool, &room_id, &q.q, page).await?))
}

async fn files(
    Extension(state): Extension<AppState>,
    session: Session,
    Query(q): Query<HistoryQuery>,
) -> AppResult<Json<Vec<Message>>> {
    let room_id = session.room(q.room_id.as_deref())?;
    let page = Pagination { limit: q.limit, offset: q.offset };
    Ok(Json(messages::list_files(&state.pool, &room_id, page).await?))
}

async fn remove(
    Extension(state): Extension<AppState>,
    Session(p): Session,
    Path(id): Path<i64>,
) -> AppResult<Json<Message>> {
    Ok(Json(messages::soft_delete(&state, id, &p.id).await?))
}
