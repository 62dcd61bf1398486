use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::fmt::Display;

pub type AppResult<T> = Result<T, AppErr>;

#[derive(thiserror::Error, Debug)]
pub enum AppErr {
    #[error("Bad request: {0}")]
    Bad(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("nickname is already in use in this room")]
    NicknameTaken,

    #[error("this device already holds a slot in this room")]
    DuplicateConnection,

    #[error("room has expired")]
    Expired,

    #[error("room is full")]
    RoomFull,

    #[error("not allowed")]
    Forbidden,

    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("not a member of this room")]
    NotInRoom,

    #[error("file exceeds the room limit of {limit} bytes")]
    FileTooLarge { limit: i64 },

    #[error("file type not allowed: {0}")]
    FileTypeNotAllowed(String),

    #[error("could not allocate a unique room PIN")]
    PinExhausted,

    #[error("Config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("DB: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Migrate: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

impl AppErr {
    /// Stable identifier sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            AppErr::Bad(_) => "validation_failed",
            AppErr::NotFound(_) => "not_found",
            AppErr::NicknameTaken => "nickname_taken",
            AppErr::DuplicateConnection => "duplicate_connection",
            AppErr::Expired => "expired",
            AppErr::RoomFull => "room_full",
            AppErr::Forbidden => "forbidden",
            AppErr::Unauthorized(_) => "unauthorized",
            AppErr::NotInRoom => "not_in_room",
            AppErr::FileTooLarge { .. } => "file_too_large",
            AppErr::FileTypeNotAllowed(_) => "file_type_not_allowed",
            AppErr::PinExhausted => "pin_exhausted",
            AppErr::Config(_)
            | AppErr::Io(_)
            | AppErr::Db(_)
            | AppErr::Migrate(_)
            | AppErr::Token(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppErr::Bad(_) => StatusCode::BAD_REQUEST,
            AppErr::NotFound(_) => StatusCode::NOT_FOUND,
            AppErr::NicknameTaken | AppErr::DuplicateConnection => StatusCode::CONFLICT,
            AppErr::Expired => StatusCode::GONE,
            AppErr::RoomFull => StatusCode::TOO_MANY_REQUESTS,
            AppErr::Forbidden | AppErr::NotInRoom => StatusCode::FORBIDDEN,
            AppErr::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppErr::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppErr::FileTypeNotAllowed(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppErr::PinExhausted => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.code() == "internal"
    }

    /// Text safe to hand to a client. Internal failures are logged here and
    /// reported without detail.
    pub fn public_message(&self) -> String {
        if self.is_internal() {
            tracing::error!(error = %self, "internal failure");
            "internal error".into()
        } else {
            self.to_string()
        }
    }
}

impl IntoResponse for AppErr {
    fn into_response(self) -> axum::response::Response {
        let body = json!({ "error": self.code(), "message": self.public_message() });
        (self.status(), Json(body)).into_response()
    }
}

/* ── helpers: turn any error into Bad / Io ── */
pub fn bad<E: Display>(e: E) -> AppErr { AppErr::Bad(e.to_string()) }

pub fn io<E: Into<std::io::Error>>(e: E) -> AppErr {
    AppErr::Io(e.into())
}

/// Which partial unique index a failed insert tripped, if any.
pub(crate) fn unique_violation(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => Some(db.message().to_owned()),
        _ => None,
    }
}
