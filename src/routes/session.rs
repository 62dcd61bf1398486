use axum::{http::HeaderMap, routing::{get, post}, Extension, Json, Router};
use serde_json::{json, Value};

use crate::{
    error::AppResult,
    events::{LeaveReason, ServerEvent},
    models::Participant,
    presence::{self, JoinRequest},
    state::AppState,
    utils::jwt::{self, Role},
};

use super::extract::{user_agent, ClientOrigin, Session};

pub fn router() -> Router {
    Router::new()
        .route("/join", post(join))
        .route("/leave", post(leave))
        .route("/heartbeat", post(heartbeat))
        .route("/me", get(me))
}

async fn join(
    Extension(state): Extension<AppState>,
    ClientOrigin(origin): ClientOrigin,
    headers: HeaderMap,
    Json(mut req): Json<JoinRequest>,
) -> AppResult<Json<Value>> {
    if req.user_agent.is_none() {
        req.user_agent = user_agent(&headers);
    }
    let joined = presence::join(&state, &req, &origin, None).await?;
    let p = &joined.participant;

    let event = ServerEvent::UserJoined {
        room_id:        joined.room.id.clone(),
        participant_id: p.id.clone(),
        nickname:       p.nickname.clone(),
    };
    state.bindings.broadcast(&joined.room.id, &event, None).await;

    let token = jwt::sign(&p.session_token, Role::Participant, &state.config.jwt_secret, state.config.token_ttl)?;
    Ok(Json(json!({
        "participant": p,
        "room": joined.room,
        "session_token": p.session_token,
        "token": token,
    })))
}

async fn leave(
    Extension(state): Extension<AppState>,
    Session(p): Session,
) -> AppResult<Json<Value>> {
    let departure = presence::leave(&state, &p.id).await?;
    if let Some(d) = &departure {
        state.bindings.evict(std::slice::from_ref(d), LeaveReason::Left).await;
    }
    Ok(Json(json!({ "left": departure.is_some() })))
}

/// Activity was already recorded by the `Session` extractor.
async fn heartbeat(Session(p): Session) -> Json<Value> {
    Json(json!({ "ok": true, "participant_id": p.id }))
}

async fn me(Session(p): Session) -> Json<Participant> {
    Json(p)
}
