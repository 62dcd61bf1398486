//! Rows shared by the registry, the directory and the message engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RoomKind {
    Text,
    Multimedia,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Room {
    pub id:          String,
    pub name:        String,
    pub description: Option<String>,
    pub pin:         String,
    pub kind:        RoomKind,
    pub capacity:    i64,
    pub max_file_size: i64,
    /// Comma separated MIME types; empty accepts everything.
    #[serde(serialize_with = "comma_list")]
    pub allowed_file_types: String,
    pub active:      bool,
    pub expires_at:  Option<DateTime<Utc>>,
    pub owner_id:    String,
    pub created_at:  DateTime<Utc>,
    pub updated_at:  DateTime<Utc>,
}

impl Room {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn allowed_types(&self) -> impl Iterator<Item = &str> {
        self.allowed_file_types.split(',').map(str::trim).filter(|t| !t.is_empty())
    }

    /// Parameters such as `;codecs=opus` are ignored on both sides.
    pub fn allows_mime(&self, mime: &str) -> bool {
        let mime = mime_essence(mime);
        let mut types = self.allowed_types().peekable();
        types.peek().is_none() || types.any(|t| mime_essence(t).eq_ignore_ascii_case(mime))
    }
}

/// `type/subtype` with any parameters stripped.
pub fn mime_essence(mime: &str) -> &str {
    mime.split(';').next().unwrap_or_default().trim()
}

fn comma_list<S: Serializer>(raw: &str, s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(raw.split(',').map(str::trim).filter(|t| !t.is_empty()))
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Participant {
    pub id:            String,
    pub nickname:      String,
    #[serde(skip_serializing)]
    pub session_token: String,
    #[serde(skip_serializing)]
    pub origin:        String,
    #[serde(skip_serializing)]
    pub user_agent:    Option<String>,
    pub room_id:       Option<String>,
    pub online:        bool,
    pub last_activity: DateTime<Utc>,
    pub joined_at:     DateTime<Utc>,
}

impl Participant {
    pub fn is_bound_to(&self, room_id: &str) -> bool {
        self.online && self.room_id.as_deref() == Some(room_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub stored_name:   String,
    pub original_name: String,
    pub path:          String,
    pub size:          i64,
    pub mime_type:     String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id:              i64,
    pub room_id:         String,
    pub sender_id:       Option<String>,
    pub sender_nickname: Option<String>,
    pub kind:            MessageKind,
    pub content:         Option<String>,
    pub file:            Option<FileDescriptor>,
    pub deleted:         bool,
    pub deleted_at:      Option<DateTime<Utc>>,
    pub created_at:      DateTime<Utc>,
}

/// Flat shape of a `messages` row; the file columns fold into `FileDescriptor`.
#[derive(sqlx::FromRow)]
pub(crate) struct MessageRow {
    id:                 i64,
    room_id:            String,
    sender_id:          Option<String>,
    sender_nickname:    Option<String>,
    kind:               MessageKind,
    content:            Option<String>,
    file_name:          Option<String>,
    file_original_name: Option<String>,
    file_path:          Option<String>,
    file_size:          Option<i64>,
    file_mime:          Option<String>,
    deleted:            bool,
    deleted_at:         Option<DateTime<Utc>>,
    created_at:         DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(r: MessageRow) -> Self {
        let file = match (r.file_name, r.file_path) {
            (Some(stored_name), Some(path)) => Some(FileDescriptor {
                original_name: r.file_original_name.unwrap_or_else(|| stored_name.clone()),
                stored_name,
                path,
                size: r.file_size.unwrap_or_default(),
                mime_type: r.file_mime.unwrap_or_else(|| "application/octet-stream".into()),
            }),
            _ => None,
        };
        Self {
            id: r.id,
            room_id: r.room_id,
            sender_id: r.sender_id,
            sender_nickname: r.sender_nickname,
            kind: r.kind,
            content: r.content,
            file,
            deleted: r.deleted,
            deleted_at: r.deleted_at,
            created_at: r.created_at,
        }
    }
}

/// `now - d`, for "idle longer than" style cutoffs.
pub fn ago(d: std::time::Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Pagination {
    pub limit:  Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    pub const DEFAULT_LIMIT: i64 = 50;

    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit: Some(limit), offset: Some(offset) }
    }

    /// `(limit, offset)` clamped to `1..=max` and `0..`.
    pub fn bounds(&self, max: i64) -> (i64, i64) {
        let limit = self.limit.unwrap_or(Self::DEFAULT_LIMIT.min(max)).clamp(1, max);
        (limit, self.offset.unwrap_or(0).max(0))
    }
}
