use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::AppResult,
    events::LeaveReason,
    models::{Pagination, Room},
    participants, presence,
    rooms::{self, NewRoom, OwnerStats, RoomPatch},
    state::AppState,
};

use super::extract::{Admin, Session};

pub fn router() -> Router {
    Router::new()
        .route("/rooms", post(create).get(list))
        .route("/rooms/stats", get(overview))
        .route("/rooms/:id", get(detail).patch(update).delete(remove))
        .route("/rooms/:id/activate", post(activate))
        .route("/rooms/:id/deactivate", post(deactivate))
        .route("/rooms/:id/participants", get(roster))
        .route("/pin/:pin", get(by_pin))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    include_inactive: bool,
    limit:            Option<i64>,
    offset:           Option<i64>,
}

/* ---------------- admin ---------------- */

async fn create(
    Extension(state): Extension<AppState>,
    Admin(owner): Admin,
    Json(draft): Json<NewRoom>,
) -> AppResult<(StatusCode, Json<Room>)> {
    let room = rooms::create_room(&state.pool, &owner, draft).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

async fn list(
    Extension(state): Extension<AppState>,
    Admin(owner): Admin,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<Vec<Room>>> {
    let page = Pagination { limit: q.limit, offset: q.offset };
    Ok(Json(rooms::list_by_owner(&state.pool, &owner, q.include_inactive, page).await?))
}

async fn overview(
    Extension(state): Extension<AppState>,
    Admin(owner): Admin,
) -> AppResult<Json<OwnerStats>> {
    Ok(Json(rooms::owner_stats(&state.pool, &owner).await?))
}

async fn detail(
    Extension(state): Extension<AppState>,
    Admin(owner): Admin,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let room = rooms::find_owned(&state.pool, &id, &owner).await?;
    let stats = rooms::stats(&state.pool, &id).await?;
    let online = participants::online_in_room(&state.pool, &id).await?;
    let connections = state.bindings.bindings_for_room(&id).await.len();
    Ok(Json(json!({
        "room": room,
        "stats": stats,
        "participants": online,
        "connections": connections,
    })))
}

async fn update(
    Extension(state): Extension<AppState>,
    Admin(owner): Admin,
    Path(id): Path<String>,
    Json(patch): Json<RoomPatch>,
) -> AppResult<Json<Value>> {
    let (room, evicted) = presence::update_room(&state, &id, &owner, &patch).await?;
    state.bindings.evict(&evicted, LeaveReason::Evicted).await;
    Ok(Json(json!({ "room": room, "evicted": evicted })))
}

async fn deactivate(
    Extension(state): Extension<AppState>,
    Admin(owner): Admin,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let evicted = presence::deactivate_room(&state, &id, &owner).await?;
    state.bindings.evict(&evicted, LeaveReason::RoomClosed).await;
    let room = rooms::find_by_id(&state.pool, &id).await?;
    Ok(Json(json!({ "room": room, "evicted": evicted.len() })))
}

async fn activate(
    Extension(state): Extension<AppState>,
    Admin(owner): Admin,
    Path(id): Path<String>,
) -> AppResult<Json<Room>> {
    Ok(Json(rooms::activate(&state.pool, &id, &owner).await?))
}

async fn remove(
    Extension(state): Extension<AppState>,
    Admin(owner): Admin,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let evicted = presence::delete_room(&state, &id, &owner).await?;
    state.bindings.evict(&evicted, LeaveReason::RoomClosed).await;
    Ok(StatusCode::NO_CONTENT)
}

/* ---------------- public / participant ---------------- */

async fn by_pin(
    Extension(state): Extension<AppState>,
    Path(pin): Path<String>,
) -> AppResult<Json<Value>> {
    let room = rooms::find_by_pin(&state.pool, &pin).await?;
    let remaining = rooms::capacity_remaining(&state.pool, &room.id).await?;
    Ok(Json(json!({
        "id": room.id,
        "name": room.name,
        "description": room.description,
        "kind": room.kind,
        "capacity": room.capacity,
        "remaining": remaining,
        "max_file_size": room.max_file_size,
        "allowed_file_types": room.allowed_types().collect::<Vec<_>>(),
        "expires_at": room.expires_at,
    })))
}

async fn roster(
    Extension(state): Extension<AppState>,
    session: Session,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let room_id = session.room(Some(id.as_str()))?;
    let online = participants::online_in_room(&state.pool, &room_id).await?;
    Ok(Json(json!({ "room_id": room_id, "participants": online })))
}
