use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Extension, Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{sync::mpsc, time};
use uuid::Uuid;

use crate::{
    error::{AppErr, AppResult},
    events::{ClientEvent, LeaveReason, ServerEvent},
    gateway::{Binding, ConnId},
    messages::{self, SendMessage},
    models::MessageKind,
    participants,
    presence::{self, JoinRequest},
    rooms,
    state::AppState,
};

use super::extract::{user_agent, ClientOrigin};

pub fn router() -> Router {
    Router::new().route("/chat", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<AppState>,
    ClientOrigin(origin): ClientOrigin,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ua = user_agent(&headers);
    ws.on_upgrade(move |s| user_ws(s, state, origin, ua))
}

/* ---------------- per connection ---------------- */
async fn user_ws(sock: WebSocket, state: AppState, origin: String, user_agent: Option<String>) {
    let conn = Uuid::new_v4();
    let (mut sink, mut stream) = sock.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.bindings.register(conn, tx).await;
    tracing::debug!(%conn, %origin, "socket open");

    // single writer: events leave in the order they were queued
    let writer = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            let text = match serde_json::to_string(&ev) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(error = %e, "unserialisable event dropped");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let conn_state = Connection { state: &state, conn, origin, user_agent };
    loop {
        let frame = match time::timeout(state.config.keepalive, stream.next()).await {
            Err(_) => {
                tracing::info!(%conn, "keepalive expired");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Message::Text(raw) => conn_state.dispatch(&raw).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    conn_state.disconnect().await;
    writer.abort();
    tracing::debug!(%conn, "socket closed");
}

struct Connection<'a> {
    state:      &'a AppState,
    conn:       ConnId,
    origin:     String,
    user_agent: Option<String>,
}

impl Connection<'_> {
    async fn reply(&self, ev: ServerEvent) {
        self.state.bindings.send_to(self.conn, ev).await;
    }

    async fn bound(&self) -> AppResult<Binding> {
        self.state.bindings.binding(self.conn).await.ok_or(AppErr::NotInRoom)
    }

    /// Failures go back to this connection only.
    async fn dispatch(&self, raw: &str) {
        let outcome = match serde_json::from_str::<ClientEvent>(raw) {
            Ok(ev) => self.handle(ev).await,
            Err(e) => Err(AppErr::Bad(format!("malformed event: {e}"))),
        };
        if let Err(e) = outcome {
            tracing::debug!(conn = %self.conn, code = e.code(), error = %e, "event rejected");
            self.reply(ServerEvent::from(&e)).await;
        }
    }

    async fn handle(&self, ev: ClientEvent) -> AppResult<()> {
        let state = self.state;
        match ev {
            ClientEvent::JoinRoom { pin, nickname } => self.join(pin, nickname).await,
            ClientEvent::Attach { session_token } => self.attach(&session_token).await,
            ClientEvent::SendMessage { kind, content, file } => {
                let b = self.bound().await?;
                let req = SendMessage {
                    room_id: b.room_id,
                    kind: kind.unwrap_or(MessageKind::Text),
                    content,
                    file,
                };
                messages::send(state, &b.participant_id, req).await.map(drop)
            }
            ClientEvent::Typing { is_typing } => {
                let b = self.bound().await?;
                let event = ServerEvent::UserTyping {
                    room_id:        b.room_id.clone(),
                    participant_id: b.participant_id.clone(),
                    nickname:       b.nickname,
                    is_typing,
                };
                state.bindings.broadcast(&b.room_id, &event, Some(self.conn)).await;
                participants::touch(&state.pool, &b.participant_id).await
            }
            ClientEvent::DeleteMessage { message_id } => {
                let b = self.bound().await?;
                messages::soft_delete(state, message_id, &b.participant_id).await.map(drop)
            }
            ClientEvent::LeaveRoom => {
                let b = self.bound().await?;
                match presence::leave(state, &b.participant_id).await? {
                    Some(d) => state.bindings.evict(&[d], LeaveReason::Left).await,
                    // already released elsewhere; just drop the stale binding
                    None => {
                        state.bindings.unbind(self.conn).await;
                        self.reply(ServerEvent::Left { room_id: b.room_id, reason: LeaveReason::Left }).await;
                    }
                }
                Ok(())
            }
            ClientEvent::Ping => {
                if let Some(b) = state.bindings.binding(self.conn).await {
                    participants::touch(&state.pool, &b.participant_id).await?;
                }
                self.reply(ServerEvent::Pong).await;
                Ok(())
            }
        }
    }

    async fn join(&self, pin: String, nickname: String) -> AppResult<()> {
        let state = self.state;
        let prior = state.bindings.binding(self.conn).await;
        let req = JoinRequest { pin, nickname, user_agent: self.user_agent.clone() };
        let joined = presence::join(state, &req, &self.origin, prior.as_ref()).await?;
        if let Some(d) = &joined.displaced {
            state.bindings.evict(std::slice::from_ref(d), LeaveReason::Moved).await;
        }

        let p = joined.participant;
        let room = joined.room;
        state
            .bindings
            .bind(self.conn, Binding {
                session_token:  p.session_token.clone(),
                participant_id: p.id.clone(),
                room_id:        room.id.clone(),
                nickname:       p.nickname.clone(),
            })
            .await;

        let event = ServerEvent::UserJoined {
            room_id:        room.id.clone(),
            participant_id: p.id.clone(),
            nickname:       p.nickname.clone(),
        };
        state.bindings.broadcast(&room.id, &event, Some(self.conn)).await;

        let members = state.bindings.members(&room.id).await;
        let session_token = p.session_token.clone();
        self.reply(ServerEvent::Joined { participant: p, room, session_token, members }).await;
        Ok(())
    }

    /// Binds this socket to a session created over HTTP.
    async fn attach(&self, session_token: &str) -> AppResult<()> {
        let state = self.state;
        let p = participants::find_by_session(&state.pool, session_token)
            .await?
            .filter(|p| p.online)
            .ok_or(AppErr::Unauthorized("unknown or ended session"))?;
        let room_id = p.room_id.clone().ok_or(AppErr::NotInRoom)?;
        if let Some(prior) = state.bindings.binding(self.conn).await {
            if prior.participant_id != p.id {
                return Err(AppErr::Bad("connection is already bound; leave first".into()));
            }
        }
        let room = rooms::find_by_id(&state.pool, &room_id).await?;

        state
            .bindings
            .bind(self.conn, Binding {
                session_token:  p.session_token.clone(),
                participant_id: p.id.clone(),
                room_id:        room_id.clone(),
                nickname:       p.nickname.clone(),
            })
            .await;
        participants::touch(&state.pool, &p.id).await?;
        tracing::debug!(conn = %self.conn, participant_id = %p.id, room_id = %room_id, "socket attached");

        let members = state.bindings.members(&room_id).await;
        let session_token = p.session_token.clone();
        self.reply(ServerEvent::Joined { participant: p, room, session_token, members }).await;
        Ok(())
    }

    /// The socket is gone: drop its binding and, unless another connection
    /// still carries the same participant, release the slot.
    async fn disconnect(&self) {
        let state = self.state;
        let Some(b) = state.bindings.remove(self.conn).await else {
            return;
        };
        if state.bindings.is_participant_bound(&b.participant_id).await {
            return;
        }
        match presence::leave(state, &b.participant_id).await {
            Ok(Some(d)) => state.bindings.announce_departure(&d, LeaveReason::Disconnected).await,
            Ok(None) => {}
            Err(e) => tracing::warn!(conn = %self.conn, error = %e, "release on disconnect failed"),
        }
    }
}
