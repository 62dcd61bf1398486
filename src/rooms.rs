//! Room registry: room records, PINs, expiry and capacity arithmetic.
//!
//! Membership side effects of deactivation live in `presence`; this module
//! only owns the rows.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::{
    error::{unique_violation, AppErr, AppResult},
    models::{Pagination, Room, RoomKind},
};

pub const PIN_ATTEMPTS: usize = 10;
pub const DEFAULT_CAPACITY: i64 = 50;
pub const MAX_CAPACITY: i64 = 1000;
pub const DEFAULT_MAX_FILE_SIZE: i64 = 10 * 1024 * 1024;
pub const MAX_FILE_SIZE: i64 = 100 * 1024 * 1024;
pub const DEFAULT_FILE_TYPES: &str = "image/jpeg,image/png,image/gif,application/pdf,text/plain";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewRoom {
    pub name:               String,
    pub description:        Option<String>,
    pub kind:               Option<RoomKind>,
    pub capacity:           Option<i64>,
    pub max_file_size:      Option<i64>,
    pub allowed_file_types: Option<Vec<String>>,
    pub expires_at:         Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomPatch {
    pub name:               Option<String>,
    pub description:        Option<String>,
    pub kind:               Option<RoomKind>,
    pub capacity:           Option<i64>,
    pub max_file_size:      Option<i64>,
    pub allowed_file_types: Option<Vec<String>>,
    pub expires_at:         Option<DateTime<Utc>>,
    #[serde(default)]
    pub clear_expiry:       bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub online_count:  i64,
    pub message_count: i64,
    pub sender_count:  i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoomsByKind {
    pub text:       i64,
    pub multimedia: i64,
}

/// Totals across every room an admin owns, active or not.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OwnerStats {
    pub total_rooms:         i64,
    pub active_rooms:        i64,
    pub inactive_rooms:      i64,
    pub online_participants: i64,
    pub total_messages:      i64,
    pub rooms_by_kind:       RoomsByKind,
}

/* ---------------- validation ---------------- */

fn valid_name(name: &str) -> AppResult<String> {
    let name = name.trim();
    match name.chars().count() {
        3..=100 => Ok(name.to_owned()),
        _ => Err(AppErr::Bad("room name must be 3-100 characters".into())),
    }
}

fn valid_description(d: Option<&str>) -> AppResult<Option<String>> {
    match d.map(str::trim).filter(|d| !d.is_empty()) {
        Some(d) if d.chars().count() > 500 => {
            Err(AppErr::Bad("description must be at most 500 characters".into()))
        }
        other => Ok(other.map(str::to_owned)),
    }
}

fn valid_capacity(c: i64) -> AppResult<i64> {
    if (1..=MAX_CAPACITY).contains(&c) {
        Ok(c)
    } else {
        Err(AppErr::Bad(format!("capacity must be between 1 and {MAX_CAPACITY}")))
    }
}

fn valid_file_size(size: i64) -> AppResult<i64> {
    if (1..=MAX_FILE_SIZE).contains(&size) {
        Ok(size)
    } else {
        Err(AppErr::Bad(format!("max_file_size must be between 1 and {MAX_FILE_SIZE} bytes")))
    }
}

fn valid_types(types: &[String]) -> AppResult<String> {
    let mut out = Vec::with_capacity(types.len());
    for t in types.iter().map(|t| t.trim().to_ascii_lowercase()) {
        let well_formed = matches!(t.split_once('/'), Some((a, b)) if !a.is_empty() && !b.is_empty())
            && !t.contains(',');
        if !well_formed {
            return Err(AppErr::Bad(format!("`{t}` is not a MIME type")));
        }
        out.push(t);
    }
    Ok(out.join(","))
}

fn valid_expiry(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> AppResult<Option<DateTime<Utc>>> {
    match at {
        Some(at) if at <= now => Err(AppErr::Bad("expires_at must be in the future".into())),
        other => Ok(other),
    }
}

/* ---------------- creation ---------------- */

/// Uniform 6-digit PIN.
pub fn generate_pin() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

pub async fn create_room(pool: &SqlitePool, owner_id: &str, draft: NewRoom) -> AppResult<Room> {
    create_room_with(pool, owner_id, draft, generate_pin).await
}

/// Inserts the room, drawing PINs from `next_pin` until one is free among
/// active rooms. The partial unique index decides collisions.
pub async fn create_room_with(
    pool: &SqlitePool,
    owner_id: &str,
    draft: NewRoom,
    mut next_pin: impl FnMut() -> String,
) -> AppResult<Room> {
    let now = Utc::now();
    let name = valid_name(&draft.name)?;
    let description = valid_description(draft.description.as_deref())?;
    let capacity = valid_capacity(draft.capacity.unwrap_or(DEFAULT_CAPACITY))?;
    let max_file_size = valid_file_size(draft.max_file_size.unwrap_or(DEFAULT_MAX_FILE_SIZE))?;
    let allowed = match &draft.allowed_file_types {
        Some(types) => valid_types(types)?,
        None => DEFAULT_FILE_TYPES.to_owned(),
    };
    let expires_at = valid_expiry(draft.expires_at, now)?;
    let kind = draft.kind.unwrap_or(RoomKind::Text);
    let id = Uuid::new_v4().to_string();

    for attempt in 1..=PIN_ATTEMPTS {
        let pin = next_pin();
        let inserted = sqlx::query_as::<_, Room>(
            "INSERT INTO rooms (id, name, description, pin, kind, capacity, max_file_size,
                                allowed_file_types, active, expires_at, owner_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(&id)
        .bind(&name)
        .bind(&description)
        .bind(&pin)
        .bind(kind)
        .bind(capacity)
        .bind(max_file_size)
        .bind(&allowed)
        .bind(expires_at)
        .bind(owner_id)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await;

        match inserted {
            Ok(room) => {
                tracing::info!(room_id = %room.id, owner_id, capacity, "room created");
                return Ok(room);
            }
            Err(e) if unique_violation(&e).is_some() => {
                tracing::debug!(attempt, "PIN collision, drawing again");
            }
            Err(e) => return Err(e.into()),
        }
    }
    tracing::warn!(owner_id, "gave up allocating a room PIN");
    Err(AppErr::PinExhausted)
}

/* ---------------- lookups ---------------- */

pub async fn find_by_id(pool: &SqlitePool, room_id: &str) -> AppResult<Room> {
    sqlx::query_as("SELECT * FROM rooms WHERE id = ?")
        .bind(room_id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppErr::NotFound("room"))
}

/// Like `find_by_id` but only for the room's owner.
pub async fn find_owned(pool: &SqlitePool, room_id: &str, owner_id: &str) -> AppResult<Room> {
    let room = find_by_id(pool, room_id).await?;
    if room.owner_id != owner_id {
        return Err(AppErr::Forbidden);
    }
    Ok(room)
}

/// Active, unexpired room behind a PIN. A room found past its expiry is
/// deactivated on the spot and reported as `Expired`; the sweeper evicts
/// whoever is still bound to it.
pub async fn find_by_pin(pool: &SqlitePool, pin: &str) -> AppResult<Room> {
    let room: Room = sqlx::query_as("SELECT * FROM rooms WHERE pin = ? AND active = 1")
        .bind(pin.trim())
        .fetch_optional(pool)
        .await?
        .ok_or(AppErr::NotFound("room"))?;

    if room.is_expired(Utc::now()) {
        set_active(pool, &room.id, false).await?;
        tracing::info!(room_id = %room.id, "room expired on lookup");
        return Err(AppErr::Expired);
    }
    Ok(room)
}

pub async fn list_by_owner(
    pool: &SqlitePool,
    owner_id: &str,
    include_inactive: bool,
    page: Pagination,
) -> AppResult<Vec<Room>> {
    let (limit, offset) = page.bounds(100);
    let rooms = sqlx::query_as(
        "SELECT * FROM rooms
         WHERE owner_id = ? AND (active = 1 OR ?)
         ORDER BY created_at DESC LIMIT ? OFFSET ?",
    )
    .bind(owner_id)
    .bind(include_inactive)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rooms)
}

pub async fn online_count<'e>(db: impl SqliteExecutor<'e>, room_id: &str) -> AppResult<i64> {
    let (n,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM participants WHERE room_id = ? AND online = 1")
            .bind(room_id)
            .fetch_one(db)
            .await?;
    Ok(n)
}

/// Free slots left; never negative.
pub async fn capacity_remaining(pool: &SqlitePool, room_id: &str) -> AppResult<i64> {
    let room = find_by_id(pool, room_id).await?;
    let online = online_count(pool, room_id).await?;
    Ok((room.capacity - online).max(0))
}

pub async fn stats(pool: &SqlitePool, room_id: &str) -> AppResult<RoomStats> {
    let online_count = online_count(pool, room_id).await?;
    let (message_count, sender_count): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COUNT(DISTINCT sender_id) FROM messages WHERE room_id = ? AND deleted = 0",
    )
    .bind(room_id)
    .fetch_one(pool)
    .await?;
    Ok(RoomStats { online_count, message_count, sender_count })
}

pub async fn owner_stats(pool: &SqlitePool, owner_id: &str) -> AppResult<OwnerStats> {
    let (total_rooms, active_rooms, text, multimedia): (i64, i64, i64, i64) = sqlx::query_as(
        "SELECT COUNT(*),
                COALESCE(SUM(active), 0),
                COALESCE(SUM(kind = 'text'), 0),
                COALESCE(SUM(kind = 'multimedia'), 0)
         FROM rooms WHERE owner_id = ?",
    )
    .bind(owner_id)
    .fetch_one(pool)
    .await?;

    let (online_participants,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM participants p JOIN rooms r ON r.id = p.room_id
         WHERE r.owner_id = ? AND p.online = 1",
    )
    .bind(owner_id)
    .fetch_one(pool)
    .await?;

    let (total_messages,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM messages m JOIN rooms r ON r.id = m.room_id
         WHERE r.owner_id = ? AND m.deleted = 0",
    )
    .bind(owner_id)
    .fetch_one(pool)
    .await?;

    Ok(OwnerStats {
        total_rooms,
        active_rooms,
        inactive_rooms: total_rooms - active_rooms,
        online_participants,
        total_messages,
        rooms_by_kind: RoomsByKind { text, multimedia },
    })
}

/// Active rooms whose expiry has passed.
pub async fn expired(pool: &SqlitePool) -> AppResult<Vec<Room>> {
    let rooms = sqlx::query_as(
        "SELECT * FROM rooms WHERE active = 1 AND expires_at IS NOT NULL AND expires_at <= ?",
    )
    .bind(Utc::now())
    .fetch_all(pool)
    .await?;
    Ok(rooms)
}

/// Inactive rooms that still have online participants, e.g. after a PIN
/// lookup found them expired.
pub async fn closed_with_members(pool: &SqlitePool) -> AppResult<Vec<Room>> {
    let rooms = sqlx::query_as(
        "SELECT * FROM rooms r WHERE r.active = 0
           AND EXISTS (SELECT 1 FROM participants p WHERE p.room_id = r.id AND p.online = 1)",
    )
    .fetch_all(pool)
    .await?;
    Ok(rooms)
}

/* ---------------- mutation ---------------- */

pub async fn set_active(pool: &SqlitePool, room_id: &str, active: bool) -> AppResult<bool> {
    let done = sqlx::query("UPDATE rooms SET active = ?, updated_at = ? WHERE id = ? AND active != ?")
        .bind(active)
        .bind(Utc::now())
        .bind(room_id)
        .bind(active)
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}

/// Ownership-checked flag flip. Callers that need bound participants gone
/// first go through `presence::deactivate_room`.
pub async fn deactivate(pool: &SqlitePool, room_id: &str, owner_id: &str) -> AppResult<Room> {
    find_owned(pool, room_id, owner_id).await?;
    set_active(pool, room_id, false).await?;
    tracing::info!(room_id, "room deactivated");
    find_by_id(pool, room_id).await
}

pub async fn activate(pool: &SqlitePool, room_id: &str, owner_id: &str) -> AppResult<Room> {
    activate_with(pool, room_id, owner_id, generate_pin).await
}

/// Reopens an inactive, unexpired room. The room keeps its PIN unless an
/// active room took it in the meantime; then fresh PINs are drawn from
/// `next_pin` the same way creation does.
pub async fn activate_with(
    pool: &SqlitePool,
    room_id: &str,
    owner_id: &str,
    next_pin: impl FnMut() -> String,
) -> AppResult<Room> {
    let room = find_owned(pool, room_id, owner_id).await?;
    if room.active {
        return Ok(room);
    }
    if room.is_expired(Utc::now()) {
        return Err(AppErr::Expired);
    }

    let pins = std::iter::once(room.pin.clone()).chain(std::iter::repeat_with(next_pin));
    for (attempt, pin) in pins.take(PIN_ATTEMPTS + 1).enumerate() {
        let updated = sqlx::query_as::<_, Room>(
            "UPDATE rooms SET active = 1, pin = ?, updated_at = ?
             WHERE id = ? AND active = 0 RETURNING *",
        )
        .bind(&pin)
        .bind(Utc::now())
        .bind(room_id)
        .fetch_optional(pool)
        .await;

        match updated {
            Ok(Some(done)) => {
                let pin_changed = done.pin != room.pin;
                tracing::info!(room_id, pin_changed, "room reactivated");
                return Ok(done);
            }
            // someone else reactivated it first
            Ok(None) => return find_by_id(pool, room_id).await,
            Err(e) if unique_violation(&e).is_some() => {
                tracing::debug!(attempt, room_id, "PIN taken by an active room, drawing again");
            }
            Err(e) => return Err(e.into()),
        }
    }
    tracing::warn!(room_id, "gave up allocating a PIN for reactivation");
    Err(AppErr::PinExhausted)
}

/// Validates and writes a patch. Capacity is taken as given; shrinking
/// below the online count is handled by the caller.
pub async fn apply_patch(pool: &SqlitePool, room: &Room, patch: &RoomPatch) -> AppResult<Room> {
    let now = Utc::now();
    let name = match &patch.name {
        Some(n) => valid_name(n)?,
        None => room.name.clone(),
    };
    let description = match &patch.description {
        Some(d) => valid_description(Some(d.as_str()))?,
        None => room.description.clone(),
    };
    let capacity = valid_capacity(patch.capacity.unwrap_or(room.capacity))?;
    let max_file_size = valid_file_size(patch.max_file_size.unwrap_or(room.max_file_size))?;
    let allowed = match &patch.allowed_file_types {
        Some(types) => valid_types(types)?,
        None => room.allowed_file_types.clone(),
    };
    let expires_at = match (patch.clear_expiry, patch.expires_at) {
        (true, _) => None,
        (false, Some(at)) => valid_expiry(Some(at), now)?,
        (false, None) => room.expires_at,
    };

    let room = sqlx::query_as(
        "UPDATE rooms SET name = ?, description = ?, kind = ?, capacity = ?, max_file_size = ?,
                          allowed_file_types = ?, expires_at = ?, updated_at = ?
         WHERE id = ? RETURNING *",
    )
    .bind(name)
    .bind(description)
    .bind(patch.kind.unwrap_or(room.kind))
    .bind(capacity)
    .bind(max_file_size)
    .bind(allowed)
    .bind(expires_at)
    .bind(now)
    .bind(&room.id)
    .fetch_one(pool)
    .await?;
    Ok(room)
}

/// Hard delete; the room must already be inactive.
pub async fn delete(pool: &SqlitePool, room_id: &str, owner_id: &str) -> AppResult<()> {
    let room = find_owned(pool, room_id, owner_id).await?;
    if room.active {
        return Err(AppErr::Bad("deactivate the room before deleting it".into()));
    }
    sqlx::query("DELETE FROM rooms WHERE id = ?").bind(room_id).execute(pool).await?;
    tracing::info!(room_id, "room deleted");
    Ok(())
}
