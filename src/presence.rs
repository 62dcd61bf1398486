//! Presence and membership coordinator.
//!
//! Per participant: UNBOUND -> JOINING -> BOUND -> LEAVING -> UNBOUND, where
//! JOINING and LEAVING last exactly as long as the directory statement that
//! implements them. Every transition here changes the store only; the
//! returned [`Departure`]s tell the caller which live connections to notify.

use serde::{Deserialize, Serialize};

use crate::{
    error::{AppErr, AppResult},
    gateway::Binding,
    messages,
    models::{Participant, Room},
    participants::{self, valid_nickname},
    rooms::{self, RoomPatch},
    state::AppState,
};

#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequest {
    pub pin:        String,
    pub nickname:   String,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// A participant that stopped occupying a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Departure {
    pub participant_id: String,
    pub nickname:       String,
    pub room_id:        String,
}

impl Departure {
    /// `p` as it was while bound; `None` if it had no room.
    pub fn of(p: &Participant) -> Option<Self> {
        p.room_id.as_ref().map(|room_id| Self {
            participant_id: p.id.clone(),
            nickname:       p.nickname.clone(),
            room_id:        room_id.clone(),
        })
    }
}

impl From<&Binding> for Departure {
    fn from(b: &Binding) -> Self {
        Self {
            participant_id: b.participant_id.clone(),
            nickname:       b.nickname.clone(),
            room_id:        b.room_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Joined {
    pub participant: Participant,
    pub room:        Room,
    /// Set when the joining connection was bound elsewhere and got moved.
    pub displaced:   Option<Departure>,
}

fn valid_pin(pin: &str) -> AppResult<&str> {
    let pin = pin.trim();
    if (4..=10).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit()) {
        Ok(pin)
    } else {
        Err(AppErr::Bad("PIN must be 4-10 digits".into()))
    }
}

/// Joins the room behind `req.pin`.
///
/// `prior` is the live binding the requesting connection already holds, if
/// any. A binding to another room is released once the new slot is held
/// (the client moved without leaving); a binding to the same room is a
/// duplicate.
pub async fn join(
    state: &AppState,
    req: &JoinRequest,
    origin: &str,
    prior: Option<&Binding>,
) -> AppResult<Joined> {
    let nickname = valid_nickname(&req.nickname)?;
    let pin = valid_pin(&req.pin)?;
    let room = rooms::find_by_pin(&state.pool, pin).await?;

    if prior.is_some_and(|b| b.room_id == room.id) {
        return Err(AppErr::DuplicateConnection);
    }

    // early answer only; reserve_slot decides for real
    if rooms::capacity_remaining(&state.pool, &room.id).await? == 0 {
        return Err(AppErr::RoomFull);
    }

    let participant = {
        let _guard = state.membership.lock(&room.id).await;
        participants::reserve_slot(&state.pool, &room.id, &nickname, origin, req.user_agent.as_deref())
            .await?
    };

    // the old slot is only given up once the new one is held
    let displaced = match prior {
        Some(b) => {
            let _guard = state.membership.lock(&b.room_id).await;
            participants::release(&state.pool, &b.participant_id).await?;
            tracing::info!(participant_id = %b.participant_id, from = %b.room_id, to = %room.id, "moving participant");
            Some(Departure::from(b))
        }
        None => None,
    };

    tracing::info!(participant_id = %participant.id, room_id = %room.id, nickname = %participant.nickname, "joined");
    Ok(Joined { participant, room, displaced })
}

/// Releases a participant. `Ok(None)` when it was already out of any room.
pub async fn leave(state: &AppState, participant_id: &str) -> AppResult<Option<Departure>> {
    if participants::find_by_id(&state.pool, participant_id).await?.is_none() {
        return Err(AppErr::NotFound("participant"));
    }
    let gone = participants::release(&state.pool, participant_id).await?;
    let departure = gone.as_ref().and_then(Departure::of);
    if let Some(d) = &departure {
        tracing::info!(participant_id, room_id = %d.room_id, "left");
    }
    Ok(departure)
}

/// Releases every online member of a room. Caller holds the membership lock.
async fn evict_members(state: &AppState, members: &[Participant]) -> AppResult<Vec<Departure>> {
    let mut out = Vec::with_capacity(members.len());
    for p in members {
        if let Some(gone) = participants::release(&state.pool, &p.id).await? {
            out.extend(Departure::of(&gone));
        }
    }
    Ok(out)
}

async fn close(state: &AppState, room: &Room, note: &str) -> AppResult<Vec<Departure>> {
    let _guard = state.membership.lock(&room.id).await;
    if room.active {
        messages::announce(state, &room.id, note).await?;
    }
    let members = participants::online_in_room(&state.pool, &room.id).await?;
    let departures = evict_members(state, &members).await?;
    rooms::set_active(&state.pool, &room.id, false).await?;
    tracing::info!(room_id = %room.id, evicted = departures.len(), "room closed");
    Ok(departures)
}

/// Owner-only. Evicts every bound participant, then flips the room inactive.
pub async fn deactivate_room(state: &AppState, room_id: &str, owner_id: &str) -> AppResult<Vec<Departure>> {
    let room = rooms::find_owned(&state.pool, room_id, owner_id).await?;
    close(state, &room, "This room has been closed.").await
}

/// Owner-only update. Shrinking capacity below the online count evicts the
/// most recent joiners beyond the new capacity.
pub async fn update_room(
    state: &AppState,
    room_id: &str,
    owner_id: &str,
    patch: &RoomPatch,
) -> AppResult<(Room, Vec<Departure>)> {
    let room = rooms::find_owned(&state.pool, room_id, owner_id).await?;
    let _guard = state.membership.lock(room_id).await;
    let updated = rooms::apply_patch(&state.pool, &room, patch).await?;

    let mut departures = Vec::new();
    if updated.capacity < room.capacity {
        let members = participants::online_in_room(&state.pool, room_id).await?;
        let excess: Vec<Participant> = members.into_iter().skip(updated.capacity as usize).collect();
        departures = evict_members(state, &excess).await?;
        if !departures.is_empty() {
            tracing::info!(room_id, evicted = departures.len(), capacity = updated.capacity, "capacity reduced");
        }
    }
    Ok((updated, departures))
}

/// Owner-only hard delete; an active room is closed first.
pub async fn delete_room(state: &AppState, room_id: &str, owner_id: &str) -> AppResult<Vec<Departure>> {
    let room = rooms::find_owned(&state.pool, room_id, owner_id).await?;
    let departures = if room.active { close(state, &room, "This room has been deleted.").await? } else { vec![] };
    rooms::delete(&state.pool, room_id, owner_id).await?;
    state.membership.forget(room_id);
    state.writers.forget(room_id);
    Ok(departures)
}

/// Releases participants idle past the configured inactivity window.
pub async fn sweep_inactive(state: &AppState) -> AppResult<Vec<Departure>> {
    let gone = participants::sweep_inactive(&state.pool, state.config.inactivity).await?;
    Ok(gone.iter().filter_map(Departure::of).collect())
}

/// Closes expired rooms and empties inactive rooms that still have members.
pub async fn close_expired(state: &AppState) -> AppResult<Vec<Departure>> {
    let mut rooms = rooms::expired(&state.pool).await?;
    rooms.extend(rooms::closed_with_members(&state.pool).await?);

    let mut departures = Vec::new();
    for room in &rooms {
        departures.extend(close(state, room, "This room has expired.").await?);
    }
    Ok(departures)
}
