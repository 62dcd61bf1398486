//! Message broadcast engine: validate, persist, fan out.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::{
    error::{AppErr, AppResult},
    events::ServerEvent,
    models::{ago, mime_essence, FileDescriptor, Message, MessageKind, MessageRow, Pagination, Room, RoomKind},
    participants, rooms,
    state::AppState,
};

pub const MAX_CONTENT_CHARS: usize = 2000;
pub const MAX_SEARCH_CHARS: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessage {
    pub room_id: String,
    #[serde(default = "text_kind")]
    pub kind:    MessageKind,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub file:    Option<FileDescriptor>,
}

fn text_kind() -> MessageKind { MessageKind::Text }

fn valid_content(content: Option<&str>) -> AppResult<Option<String>> {
    match content.map(str::trim).filter(|c| !c.is_empty()) {
        Some(c) if c.chars().count() > MAX_CONTENT_CHARS => {
            Err(AppErr::Bad(format!("content must be at most {MAX_CONTENT_CHARS} characters")))
        }
        other => Ok(other.map(str::to_owned)),
    }
}

/// Kind-specific payload rules plus the room's file policy. Returns the
/// normalised content.
fn check_payload(room: &Room, req: &SendMessage) -> AppResult<Option<String>> {
    let content = valid_content(req.content.as_deref())?;
    match req.kind {
        MessageKind::System => Err(AppErr::Bad("system messages are server-only".into())),
        MessageKind::Text => {
            if req.file.is_some() {
                return Err(AppErr::Bad("text messages cannot carry a file".into()));
            }
            content.ok_or_else(|| AppErr::Bad("text messages need content".into())).map(Some)
        }
        MessageKind::File => {
            let file = req.file.as_ref().ok_or_else(|| AppErr::Bad("file messages need a file".into()))?;
            if room.kind == RoomKind::Text {
                return Err(AppErr::FileTypeNotAllowed("this room only accepts text".into()));
            }
            if file.size <= 0 || file.path.trim().is_empty() || file.stored_name.trim().is_empty() {
                return Err(AppErr::Bad("file descriptor is incomplete".into()));
            }
            if file.size > room.max_file_size {
                return Err(AppErr::FileTooLarge { limit: room.max_file_size });
            }
            if !room.allows_mime(&file.mime_type) {
                return Err(AppErr::FileTypeNotAllowed(file.mime_type.clone()));
            }
            Ok(content)
        }
    }
}

struct NewRow<'a> {
    room_id:         &'a str,
    sender_id:       Option<&'a str>,
    sender_nickname: Option<&'a str>,
    kind:            MessageKind,
    content:         Option<&'a str>,
    file:            Option<&'a FileDescriptor>,
}

async fn insert(pool: &SqlitePool, row: NewRow<'_>) -> AppResult<Message> {
    let f = row.file;
    let stored: MessageRow = sqlx::query_as(
        "INSERT INTO messages (room_id, sender_id, sender_nickname, kind, content, content_folded,
                               file_name, file_original_name, file_path, file_size, file_mime, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(row.room_id)
    .bind(row.sender_id)
    .bind(row.sender_nickname)
    .bind(row.kind)
    .bind(row.content)
    .bind(row.content.map(str::to_lowercase))
    .bind(f.map(|f| f.stored_name.as_str()))
    .bind(f.map(|f| f.original_name.as_str()))
    .bind(f.map(|f| f.path.as_str()))
    .bind(f.map(|f| f.size))
    .bind(f.map(|f| mime_essence(&f.mime_type).to_ascii_lowercase()))
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(stored.into())
}

/// Persists and fans out under the room's writer lock so every bound
/// connection sees the room's messages in id order.
async fn persist_and_fan_out(state: &AppState, row: NewRow<'_>) -> AppResult<Message> {
    let room_id = row.room_id.to_owned();
    let _writer = state.writers.lock(&room_id).await;
    let message = insert(&state.pool, row).await?;
    let event = ServerEvent::NewMessage { message: message.clone() };
    let delivered = state.bindings.broadcast(&room_id, &event, None).await;
    tracing::debug!(room_id = %room_id, message_id = message.id, delivered, "message fanned out");
    Ok(message)
}

/// Sends on behalf of a participant bound to `req.room_id`. The fan-out
/// includes the sender's own connection, carrying the stored id and time.
pub async fn send(state: &AppState, sender_id: &str, req: SendMessage) -> AppResult<Message> {
    let sender = participants::find_by_id(&state.pool, sender_id)
        .await?
        .ok_or(AppErr::NotFound("participant"))?;
    if !sender.is_bound_to(&req.room_id) {
        return Err(AppErr::NotInRoom);
    }
    let room = rooms::find_by_id(&state.pool, &req.room_id).await?;
    if room.is_expired(Utc::now()) {
        return Err(AppErr::Expired);
    }
    if !room.active {
        return Err(AppErr::NotFound("room"));
    }
    let content = check_payload(&room, &req)?;

    let message = persist_and_fan_out(
        state,
        NewRow {
            room_id:         &room.id,
            sender_id:       Some(&sender.id),
            sender_nickname: Some(&sender.nickname),
            kind:            req.kind,
            content:         content.as_deref(),
            file:            req.file.as_ref(),
        },
    )
    .await?;
    participants::touch(&state.pool, &sender.id).await?;
    Ok(message)
}

/// Server-authored `system` message.
pub async fn announce(state: &AppState, room_id: &str, text: &str) -> AppResult<Message> {
    persist_and_fan_out(
        state,
        NewRow {
            room_id,
            sender_id:       None,
            sender_nickname: None,
            kind:            MessageKind::System,
            content:         Some(text),
            file:            None,
        },
    )
    .await
}

pub async fn find_by_id(pool: &SqlitePool, message_id: i64) -> AppResult<Option<Message>> {
    let row: Option<MessageRow> = sqlx::query_as("SELECT * FROM messages WHERE id = ?")
        .bind(message_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Message::from))
}

/// Sender-only soft delete; the room is told so clients can hide it.
pub async fn soft_delete(state: &AppState, message_id: i64, requester_id: &str) -> AppResult<Message> {
    let message = find_by_id(&state.pool, message_id)
        .await?
        .filter(|m| !m.deleted)
        .ok_or(AppErr::NotFound("message"))?;
    if message.sender_id.as_deref() != Some(requester_id) {
        return Err(AppErr::Forbidden);
    }

    // a concurrent delete may have won since the read
    let row: MessageRow = sqlx::query_as(
        "UPDATE messages SET deleted = 1, deleted_at = ? WHERE id = ? AND deleted = 0 RETURNING *",
    )
    .bind(Utc::now())
    .bind(message_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(AppErr::NotFound("message"))?;

    let event = ServerEvent::MessageDeleted { room_id: message.room_id.clone(), message_id };
    state.bindings.broadcast(&message.room_id, &event, None).await;
    tracing::info!(message_id, requester_id, "message deleted");
    Ok(row.into())
}

/// Room history in persisted order, deleted messages excluded.
///
/// Without `after_id`, returns the page ending `offset` messages before the
/// newest. With `after_id`, returns what came after it, oldest first, which
/// is what polling clients want.
pub async fn list(
    pool: &SqlitePool,
    room_id: &str,
    page: Pagination,
    after_id: Option<i64>,
) -> AppResult<Vec<Message>> {
    let (limit, offset) = page.bounds(100);
    let rows: Vec<MessageRow> = match after_id {
        Some(after) => {
            sqlx::query_as(
                "SELECT * FROM messages WHERE room_id = ? AND deleted = 0 AND id > ?
                 ORDER BY id LIMIT ?",
            )
            .bind(room_id)
            .bind(after)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT * FROM (
                     SELECT * FROM messages WHERE room_id = ? AND deleted = 0
                     ORDER BY id DESC LIMIT ? OFFSET ?
                 ) ORDER BY id",
            )
            .bind(room_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows.into_iter().map(Message::from).collect())
}

fn like_pattern(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// Case-insensitive substring search over content, newest first. Matching
/// runs against the Unicode-lowercased copy stored at insert time.
pub async fn search(pool: &SqlitePool, room_id: &str, term: &str, page: Pagination) -> AppResult<Vec<Message>> {
    let term = term.trim();
    if !(1..=MAX_SEARCH_CHARS).contains(&term.chars().count()) {
        return Err(AppErr::Bad(format!("search term must be 1-{MAX_SEARCH_CHARS} characters")));
    }
    let (limit, offset) = page.bounds(50);
    let rows: Vec<MessageRow> = sqlx::query_as(
        "SELECT * FROM messages
         WHERE room_id = ? AND deleted = 0 AND content_folded LIKE ? ESCAPE '\\'
         ORDER BY id DESC LIMIT ? OFFSET ?",
    )
    .bind(room_id)
    .bind(like_pattern(&term.to_lowercase()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Message::from).collect())
}

/// File messages of a room, newest first.
pub async fn list_files(pool: &SqlitePool, room_id: &str, page: Pagination) -> AppResult<Vec<Message>> {
    let (limit, offset) = page.bounds(50);
    let rows: Vec<MessageRow> = sqlx::query_as(
        "SELECT * FROM messages WHERE room_id = ? AND deleted = 0 AND kind = 'file'
         ORDER BY id DESC LIMIT ? OFFSET ?",
    )
    .bind(room_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Message::from).collect())
}

/// Permanently removes messages soft-deleted longer than `retention` ago.
pub async fn purge_deleted(pool: &SqlitePool, retention: Duration) -> AppResult<u64> {
    let done = sqlx::query("DELETE FROM messages WHERE deleted = 1 AND deleted_at < ?")
        .bind(ago(retention))
        .execute(pool)
        .await?;
    Ok(done.rows_affected())
}
