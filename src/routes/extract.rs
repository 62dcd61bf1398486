//! Request identity: admin bearer tokens, participant sessions, origins.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};

use crate::{
    error::{AppErr, AppResult},
    models::Participant,
    participants,
    state::AppState,
    utils::jwt::{self, Role},
};

pub const SESSION_HEADER: &str = "x-session-id";

fn app_state(parts: &Parts) -> AppResult<AppState> {
    parts
        .extensions
        .get::<AppState>()
        .cloned()
        .ok_or_else(|| AppErr::Config("AppState extension missing".into()))
}

fn bearer(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Verified admin id.
pub struct Admin(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Admin {
    type Rejection = AppErr;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        let state = app_state(parts)?;
        let token = bearer(parts).ok_or(AppErr::Unauthorized("missing bearer token"))?;
        let claims = jwt::verify(token, &state.config.jwt_secret)?;
        if claims.role != Role::Admin {
            return Err(AppErr::Forbidden);
        }
        Ok(Admin(claims.sub))
    }
}

/// The caller's online participant record. Extracting it counts as activity.
pub struct Session(pub Participant);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Session {
    type Rejection = AppErr;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        let state = app_state(parts)?;
        let token = match parts.headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            Some(t) => t.trim().to_owned(),
            None => {
                let raw = bearer(parts).ok_or(AppErr::Unauthorized("missing session"))?;
                let claims = jwt::verify(raw, &state.config.jwt_secret)?;
                if claims.role != Role::Participant {
                    return Err(AppErr::Unauthorized("not a participant token"));
                }
                claims.sub
            }
        };

        let p = participants::find_by_session(&state.pool, &token)
            .await?
            .filter(|p| p.online)
            .ok_or(AppErr::Unauthorized("unknown or ended session"))?;
        participants::touch(&state.pool, &p.id).await?;
        Ok(Session(p))
    }
}

impl Session {
    /// The room the caller asked about, defaulting to its own; it must be
    /// bound there.
    pub fn room(&self, asked: Option<&str>) -> AppResult<String> {
        let room_id = match asked {
            Some(r) => r.to_owned(),
            None => self.0.room_id.clone().ok_or(AppErr::NotInRoom)?,
        };
        if !self.0.is_bound_to(&room_id) {
            return Err(AppErr::NotInRoom);
        }
        Ok(room_id)
    }
}

/// Network origin used for the one-device-per-room rule: the peer address,
/// or the first `X-Forwarded-For` hop when the proxy is trusted.
pub struct ClientOrigin(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientOrigin {
    type Rejection = AppErr;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        let state = app_state(parts)?;
        if state.config.trust_forwarded {
            let forwarded = parts
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(ip) = forwarded {
                return Ok(ClientOrigin(ip.to_owned()));
            }
        }
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".into());
        Ok(ClientOrigin(peer))
    }
}

pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.chars().take(500).collect())
}
