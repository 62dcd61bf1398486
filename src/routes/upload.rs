use std::path::Path;

use axum::{extract::multipart::Multipart, http::StatusCode, routing::post, Extension, Json, Router};
use bytes::Bytes;
use tokio::{fs::{self, File}, io::AsyncWriteExt};

use crate::{
    error::{bad, io, AppErr, AppResult},
    models::{mime_essence, FileDescriptor, RoomKind},
    rooms,
    state::AppState,
};

use super::extract::Session;

pub fn router() -> Router {
    Router::new().route("/upload", post(upload_file))
}

fn extension_for(mime: &str, original: &str) -> String {
    if mime.starts_with("audio/webm") {
        return "weba".into();
    }
    mime_guess::get_mime_extensions_str(mime)
        .and_then(|a| a.first().copied())
        .map(str::to_owned)
        .or_else(|| {
            Path::new(original)
                .extension()
                .and_then(|e| e.to_str())
                .filter(|e| e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
                .map(str::to_ascii_lowercase)
        })
        .unwrap_or_else(|| "bin".into())
}

/// Stores one multipart file for the caller's room and hands back the
/// descriptor a `file` message will carry. The room's size and type policy
/// is applied while the body streams in.
pub async fn upload_file(
    Extension(state): Extension<AppState>,
    Session(p): Session,
    mut mp: Multipart,
) -> AppResult<(StatusCode, Json<FileDescriptor>)> {
    let room_id = p.room_id.clone().filter(|_| p.online).ok_or(AppErr::NotInRoom)?;
    let room = rooms::find_by_id(&state.pool, &room_id).await?;
    if room.kind == RoomKind::Text {
        return Err(AppErr::FileTypeNotAllowed("this room only accepts text".into()));
    }

    let mut field = loop {
        match mp.next_field().await.map_err(bad)? {
            Some(f) if f.file_name().is_some() => break f,
            Some(_) => continue,
            None => return Err(bad("no file")),
        }
    };

    let original = field.file_name().unwrap_or("upload").to_owned();
    let mime = match field.content_type().map(mime_essence) {
        Some(m) if !m.eq_ignore_ascii_case("application/octet-stream") => m.to_ascii_lowercase(),
        _ => mime_guess::from_path(&original).first_or_octet_stream().essence_str().to_owned(),
    };
    if !room.allows_mime(&mime) {
        return Err(AppErr::FileTypeNotAllowed(mime));
    }

    let stored_name = format!("{}.{}", uuid::Uuid::new_v4(), extension_for(&mime, &original));
    fs::create_dir_all(&state.config.upload_dir).await.map_err(io)?;
    let full = Path::new(&state.config.upload_dir).join(&stored_name);

    let mut file = File::create(&full).await.map_err(io)?;
    let mut size: i64 = 0;
    let written: AppResult<()> = async {
        while let Some(chunk) = field.chunk().await.map_err(bad)? {
            let chunk: Bytes = chunk;
            size += chunk.len() as i64;
            if size > room.max_file_size {
                return Err(AppErr::FileTooLarge { limit: room.max_file_size });
            }
            file.write_all(&chunk).await.map_err(io)?;
        }
        file.flush().await.map_err(io)
    }
    .await;

    if let Err(e) = written {
        drop(file);
        let _ = fs::remove_file(&full).await;
        return Err(e);
    }
    if size == 0 {
        let _ = fs::remove_file(&full).await;
        return Err(bad("empty file"));
    }

    tracing::info!(room_id = %room_id, participant_id = %p.id, stored_name = %stored_name, size, mime = %mime, "file uploaded");
    Ok((
        StatusCode::CREATED,
        Json(FileDescriptor {
            path: format!("/uploads/{stored_name}"),
            stored_name,
            original_name: original,
            size,
            mime_type: mime,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_follow_mime_then_name() {
        assert_eq!(extension_for("audio/webm;codecs=opus", "note"), "weba");
        assert_eq!(extension_for("application/x-unknown-thing", "report.TAR"), "tar");
        assert_eq!(extension_for("application/x-unknown-thing", "noext"), "bin");
        assert!(!extension_for("image/png", "x").is_empty());
    }
}
