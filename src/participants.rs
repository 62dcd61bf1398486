//! Participant directory: ephemeral, session-scoped identities and their
//! room slots.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    error::{unique_violation, AppErr, AppResult},
    models::{ago, Participant},
    rooms,
};

pub const SESSION_TOKEN_LEN: usize = 32;

/// 2-50 characters of ASCII letters, digits, space, `-`, `_`, `.`.
pub fn valid_nickname(raw: &str) -> AppResult<String> {
    let nick = raw.trim();
    if !(2..=50).contains(&nick.chars().count()) {
        return Err(AppErr::Bad("nickname must be 2-50 characters".into()));
    }
    if !nick.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.')) {
        return Err(AppErr::Bad("nickname contains characters that are not allowed".into()));
    }
    Ok(nick.to_owned())
}

/// Claims a slot in `room_id` for a fresh participant.
///
/// Capacity, room activity and both uniqueness rules are decided by one
/// `INSERT ... SELECT` at write time: the `WHERE` clause re-counts online
/// members and the partial unique indexes on `(room_id, nickname)` and
/// `(room_id, origin)` reject duplicates. Nothing read earlier is trusted.
pub async fn reserve_slot(
    pool: &SqlitePool,
    room_id: &str,
    nickname: &str,
    origin: &str,
    user_agent: Option<&str>,
) -> AppResult<Participant> {
    let now = Utc::now();
    let id = Uuid::new_v4().to_string();
    let token = nanoid::nanoid!(SESSION_TOKEN_LEN);

    let inserted = sqlx::query_as::<_, Participant>(
        "INSERT INTO participants
             (id, nickname, session_token, origin, user_agent, room_id, online, last_activity, joined_at)
         SELECT ?, ?, ?, ?, ?, r.id, 1, ?, ?
         FROM rooms r
         WHERE r.id = ?
           AND r.active = 1
           AND (r.expires_at IS NULL OR r.expires_at > ?)
           AND (SELECT COUNT(*) FROM participants p WHERE p.room_id = r.id AND p.online = 1) < r.capacity
         RETURNING *",
    )
    .bind(&id)
    .bind(nickname)
    .bind(&token)
    .bind(origin)
    .bind(user_agent)
    .bind(now)
    .bind(now)
    .bind(room_id)
    .bind(now)
    .fetch_optional(pool)
    .await;

    match inserted {
        Ok(Some(p)) => Ok(p),
        Ok(None) => {
            // nothing inserted: say why
            let room = rooms::find_by_id(pool, room_id).await?;
            Err(if room.is_expired(now) {
                AppErr::Expired
            } else if !room.active {
                AppErr::NotFound("room")
            } else {
                AppErr::RoomFull
            })
        }
        Err(e) => match unique_violation(&e) {
            Some(msg) if msg.contains("nickname") => Err(AppErr::NicknameTaken),
            Some(msg) if msg.contains("origin") => Err(AppErr::DuplicateConnection),
            _ => Err(e.into()),
        },
    }
}

/// Takes a participant offline and out of its room. Returns the participant
/// as it was while bound, or `None` when it was already released; releasing
/// twice is not an error.
pub async fn release(pool: &SqlitePool, participant_id: &str) -> AppResult<Option<Participant>> {
    let Some(p) = find_by_id(pool, participant_id).await? else {
        return Ok(None);
    };
    let Some(room_id) = p.room_id.clone().filter(|_| p.online) else {
        return Ok(None);
    };

    let done = sqlx::query(
        "UPDATE participants SET online = 0, room_id = NULL, last_activity = ?
         WHERE id = ? AND online = 1 AND room_id = ?",
    )
    .bind(Utc::now())
    .bind(participant_id)
    .bind(&room_id)
    .execute(pool)
    .await?;

    // a concurrent release got there first
    if done.rows_affected() == 0 {
        return Ok(None);
    }
    Ok(Some(p))
}

/// Heartbeat.
pub async fn touch(pool: &SqlitePool, participant_id: &str) -> AppResult<()> {
    sqlx::query("UPDATE participants SET last_activity = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(participant_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Releases every online participant idle for longer than `idle` and
/// returns them as they were bound. Rows are kept.
pub async fn sweep_inactive(pool: &SqlitePool, idle: Duration) -> AppResult<Vec<Participant>> {
    let stale: Vec<(String,)> =
        sqlx::query_as("SELECT id FROM participants WHERE online = 1 AND last_activity < ?")
            .bind(ago(idle))
            .fetch_all(pool)
            .await?;

    let mut released = Vec::with_capacity(stale.len());
    for (id,) in stale {
        if let Some(p) = release(pool, &id).await? {
            released.push(p);
        }
    }
    Ok(released)
}

/// Hard-removes offline participants idle for longer than `idle`.
pub async fn purge_stale(pool: &SqlitePool, idle: Duration) -> AppResult<u64> {
    let done = sqlx::query("DELETE FROM participants WHERE online = 0 AND last_activity < ?")
        .bind(ago(idle))
        .execute(pool)
        .await?;
    Ok(done.rows_affected())
}

pub async fn find_by_id(pool: &SqlitePool, participant_id: &str) -> AppResult<Option<Participant>> {
    let p = sqlx::query_as("SELECT * FROM participants WHERE id = ?")
        .bind(participant_id)
        .fetch_optional(pool)
        .await?;
    Ok(p)
}

pub async fn find_by_session(pool: &SqlitePool, token: &str) -> AppResult<Option<Participant>> {
    let p = sqlx::query_as("SELECT * FROM participants WHERE session_token = ?")
        .bind(token)
        .fetch_optional(pool)
        .await?;
    Ok(p)
}

/// Online members of a room, earliest joiner first.
pub async fn online_in_room(pool: &SqlitePool, room_id: &str) -> AppResult<Vec<Participant>> {
    let list = sqlx::query_as(
        "SELECT * FROM participants WHERE room_id = ? AND online = 1 ORDER BY joined_at, id",
    )
    .bind(room_id)
    .fetch_all(pool)
    .await?;
    Ok(list)
}
