mod common;

use pin_chat::models::RoomKind;
use reqwest::{multipart, Client, StatusCode};
use serde_json::{json, Value};

struct Joined {
    session: String,
    id:      String,
}

async fn join(c: &Client, srv: &common::TestServer, pin: &str, nick: &str, ip: &str) -> reqwest::Response {
    c.post(srv.url("/api/join"))
        .header("x-forwarded-for", ip)
        .json(&json!({ "pin": pin, "nickname": nick }))
        .send()
        .await
        .unwrap()
}

async fn joined(c: &Client, srv: &common::TestServer, pin: &str, nick: &str, ip: &str) -> Joined {
    let res = join(c, srv, pin, nick, ip).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert!(body["token"].as_str().is_some_and(|t| !t.is_empty()));
    Joined {
        session: body["session_token"].as_str().unwrap().to_owned(),
        id:      body["participant"]["id"].as_str().unwrap().to_owned(),
    }
}

async fn error_code(res: reqwest::Response) -> String {
    let body: Value = res.json().await.unwrap();
    body["error"].as_str().unwrap_or_default().to_owned()
}

#[tokio::test]
async fn room_lifecycle_over_http() {
    let srv = common::spawn().await;
    let c = Client::new();
    let admin = srv.admin_token();

    // no token, then a participant-shaped token
    let res = c.post(srv.url("/api/rooms")).json(&json!({ "name": "Nope" })).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = c
        .post(srv.url("/api/rooms"))
        .bearer_auth(&admin)
        .json(&json!({
            "name": "Standup",
            "kind": "multimedia",
            "capacity": 5,
            "max_file_size": 1024,
            "allowed_file_types": ["image/png"]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let room: Value = res.json().await.unwrap();
    let pin = room["pin"].as_str().unwrap().to_owned();
    let room_id = room["id"].as_str().unwrap().to_owned();

    let lookup: Value = c.get(srv.url(&format!("/api/pin/{pin}"))).send().await.unwrap().json().await.unwrap();
    assert_eq!(lookup["remaining"], 5);
    assert_eq!(lookup["kind"], "multimedia");

    let alice = joined(&c, &srv, &pin, "alice", "10.0.0.1").await;
    assert_eq!(error_code(join(&c, &srv, &pin, "alice", "10.0.0.2").await).await, "nickname_taken");
    assert_eq!(error_code(join(&c, &srv, &pin, "sam", "10.0.0.1").await).await, "duplicate_connection");
    let bob = joined(&c, &srv, &pin, "bob", "10.0.0.2").await;

    let listed: Value =
        c.get(srv.url("/api/rooms")).bearer_auth(&admin).send().await.unwrap().json().await.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let detail: Value = c
        .get(srv.url(&format!("/api/rooms/{room_id}")))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["stats"]["online_count"], 2);

    // a participant token is not an admin token
    let res = c
        .get(srv.url(&format!("/api/rooms/{room_id}")))
        .header("x-session-id", &alice.session)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let roster: Value = c
        .get(srv.url(&format!("/api/rooms/{room_id}/participants")))
        .header("x-session-id", &bob.session)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(roster["participants"].as_array().unwrap().len(), 2);

    // leave, then the session no longer works
    let res = c.post(srv.url("/api/leave")).header("x-session-id", &bob.session).send().await.unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["left"], true);
    let res = c.get(srv.url("/api/me")).header("x-session-id", &bob.session).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = c
        .post(srv.url(&format!("/api/rooms/{room_id}/deactivate")))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["evicted"], 1);
    assert_eq!(body["room"]["active"], false);

    let res = c.get(srv.url(&format!("/api/pin/{pin}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let res = c.get(srv.url("/api/me")).header("x-session-id", &alice.session).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = c.delete(srv.url(&format!("/api/rooms/{room_id}"))).bearer_auth(&admin).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn capacity_one_admits_the_next_after_a_leave() {
    let srv = common::spawn().await;
    let c = Client::new();
    let room = srv.room("Solo room", RoomKind::Text, 1).await;

    let a = joined(&c, &srv, &room.pin, "anna", "10.2.0.1").await;
    let res = join(&c, &srv, &room.pin, "ben", "10.2.0.2").await;
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(error_code(res).await, "room_full");

    c.post(srv.url("/api/leave")).header("x-session-id", &a.session).send().await.unwrap();
    joined(&c, &srv, &room.pin, "ben", "10.2.0.2").await;
}

#[tokio::test]
async fn messages_history_delete_and_files() {
    let srv = common::spawn().await;
    let c = Client::new();
    let room = srv.room("Media room", RoomKind::Multimedia, 10).await;
    // 1 KiB limit, PNG only
    sqlx::query("UPDATE rooms SET max_file_size = 1024, allowed_file_types = 'image/png' WHERE id = ?")
        .bind(&room.id)
        .execute(&srv.state.pool)
        .await
        .unwrap();

    let alice = joined(&c, &srv, &room.pin, "alice", "10.3.0.1").await;
    let bob = joined(&c, &srv, &room.pin, "bob", "10.3.0.2").await;

    let res = c
        .post(srv.url("/api/messages"))
        .header("x-session-id", &alice.session)
        .json(&json!({ "room_id": room.id, "content": "hello there" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let msg: Value = res.json().await.unwrap();
    assert_eq!(msg["sender_id"], alice.id.as_str());
    let msg_id = msg["id"].as_i64().unwrap();

    let history: Vec<Value> = c
        .get(srv.url("/api/messages"))
        .header("x-session-id", &bob.session)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 1);

    let found: Vec<Value> = c
        .get(srv.url("/api/messages/search?q=HELLO"))
        .header("x-session-id", &bob.session)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    let res = c
        .delete(srv.url(&format!("/api/messages/{msg_id}")))
        .header("x-session-id", &bob.session)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let res = c
        .delete(srv.url(&format!("/api/messages/{msg_id}")))
        .header("x-session-id", &alice.session)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // too large: refused, nothing stored
    let res = c
        .post(srv.url("/api/messages"))
        .header("x-session-id", &alice.session)
        .json(&json!({
            "room_id": room.id,
            "kind": "file",
            "file": {
                "stored_name": "x.png", "original_name": "x.png", "path": "/uploads/x.png",
                "size": 4096, "mime_type": "image/png"
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(error_code(res).await, "file_too_large");

    let history: Vec<Value> = c
        .get(srv.url(&format!("/api/messages?room_id={}", room.id)))
        .header("x-session-id", &alice.session)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(history.is_empty());

    // upload, then post the descriptor
    let part = multipart::Part::bytes(vec![0x89, b'P', b'N', b'G', 1, 2, 3, 4])
        .file_name("dot.png")
        .mime_str("image/png")
        .unwrap();
    let res = c
        .post(srv.url("/api/upload"))
        .header("x-session-id", &alice.session)
        .multipart(multipart::Form::new().part("file", part))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let descriptor: Value = res.json().await.unwrap();
    assert_eq!(descriptor["size"], 8);
    let path = descriptor["path"].as_str().unwrap().to_owned();

    let served = c.get(srv.url(&path)).send().await.unwrap();
    assert_eq!(served.status(), StatusCode::OK);
    assert_eq!(served.bytes().await.unwrap().len(), 8);

    let res = c
        .post(srv.url("/api/messages"))
        .header("x-session-id", &alice.session)
        .json(&json!({ "room_id": room.id, "kind": "file", "file": descriptor }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let files: Vec<Value> = c
        .get(srv.url("/api/messages/files"))
        .header("x-session-id", &bob.session)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["file"]["original_name"], "dot.png");

    let wrong_type = multipart::Part::bytes(b"%PDF-1.4".to_vec()).file_name("a.pdf").mime_str("application/pdf").unwrap();
    let res = c
        .post(srv.url("/api/upload"))
        .header("x-session-id", &alice.session)
        .multipart(multipart::Form::new().part("file", wrong_type))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn reactivation_and_owner_stats() {
    let srv = common::spawn().await;
    let c = Client::new();
    let admin = srv.admin_token();
    let old = srv.room("Weekly sync", RoomKind::Text, 5).await;
    srv.room("Gallery", RoomKind::Multimedia, 5).await;
    joined(&c, &srv, &old.pin, "ana", "10.4.0.1").await;

    let stats: Value =
        c.get(srv.url("/api/rooms/stats")).bearer_auth(&admin).send().await.unwrap().json().await.unwrap();
    assert_eq!(stats["total_rooms"], 2);
    assert_eq!(stats["active_rooms"], 2);
    assert_eq!(stats["online_participants"], 1);
    assert_eq!(stats["rooms_by_kind"], json!({ "text": 1, "multimedia": 1 }));

    let res = c
        .post(srv.url(&format!("/api/rooms/{}/deactivate", old.id)))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // the PIN goes to a new room while the old one is closed
    sqlx::query("UPDATE rooms SET pin = ? WHERE id != ? AND active = 1 AND kind = 'multimedia'")
        .bind(&old.pin)
        .bind(&old.id)
        .execute(&srv.state.pool)
        .await
        .unwrap();

    let res = c
        .post(srv.url(&format!("/api/rooms/{}/activate", old.id)))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let back: Value = res.json().await.unwrap();
    assert_eq!(back["active"], true);
    let new_pin = back["pin"].as_str().unwrap().to_owned();
    assert_ne!(new_pin, old.pin);

    let lookup: Value =
        c.get(srv.url(&format!("/api/pin/{new_pin}"))).send().await.unwrap().json().await.unwrap();
    assert_eq!(lookup["id"], old.id.as_str());
    let lookup: Value =
        c.get(srv.url(&format!("/api/pin/{}", old.pin))).send().await.unwrap().json().await.unwrap();
    assert_eq!(lookup["name"], "Gallery");

    let res = c.post(srv.url(&format!("/api/rooms/{}/activate", old.id))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let stats: Value =
        c.get(srv.url("/api/rooms/stats")).bearer_auth(&admin).send().await.unwrap().json().await.unwrap();
    assert_eq!((stats["active_rooms"].as_i64(), stats["inactive_rooms"].as_i64()), (Some(2), Some(0)));
    assert_eq!(stats["online_participants"], 0);
}

#[tokio::test]
async fn voice_notes_with_codec_parameters_upload() {
    let srv = common::spawn().await;
    let c = Client::new();
    let room = srv.room("Voice room", RoomKind::Multimedia, 5).await;
    sqlx::query("UPDATE rooms SET allowed_file_types = 'audio/webm' WHERE id = ?")
        .bind(&room.id)
        .execute(&srv.state.pool)
        .await
        .unwrap();
    let ana = joined(&c, &srv, &room.pin, "ana", "10.5.0.1").await;

    let part = multipart::Part::bytes(vec![0x1a, 0x45, 0xdf, 0xa3, 0, 0])
        .file_name("note")
        .mime_str("audio/webm;codecs=opus")
        .unwrap();
    let res = c
        .post(srv.url("/api/upload"))
        .header("x-session-id", &ana.session)
        .multipart(multipart::Form::new().part("file", part))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let descriptor: Value = res.json().await.unwrap();
    assert_eq!(descriptor["mime_type"], "audio/webm");
    assert!(descriptor["stored_name"].as_str().unwrap().ends_with(".weba"));
}
