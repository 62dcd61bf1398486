#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use pin_chat::{
    app,
    config::Config,
    db,
    models::{Room, RoomKind},
    rooms::{self, NewRoom},
    state::AppState,
    utils::jwt::{self, Role},
};
use tempfile::TempDir;

pub const ADMIN: &str = "admin-1";

pub struct TestServer {
    pub addr:  SocketAddr,
    pub state: AppState,
    _dir:      TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/chat", self.addr)
    }

    pub fn admin_token(&self) -> String {
        jwt::sign(ADMIN, Role::Admin, &self.state.config.jwt_secret, Duration::from_secs(3600)).unwrap()
    }

    pub async fn room(&self, name: &str, kind: RoomKind, capacity: i64) -> Room {
        let draft = NewRoom { name: name.into(), kind: Some(kind), capacity: Some(capacity), ..Default::default() };
        rooms::create_room(&self.state.pool, ADMIN, draft).await.unwrap()
    }
}

/// File-backed database in a temp dir, so several pool connections really
/// race each other.
pub async fn state(dir: &TempDir) -> AppState {
    let url = format!("sqlite://{}", dir.path().join("chat.db").display());
    let pool = db::connect(&url, 8).await.unwrap();
    let config = Config {
        trust_forwarded: true,
        upload_dir: dir.path().join("uploads").display().to_string(),
        keepalive: Duration::from_secs(5),
        ..Config::default()
    };
    AppState::new(pool, config)
}

pub async fn spawn() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let state = state(&dir).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    TestServer { addr, state, _dir: dir }
}
