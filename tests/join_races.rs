mod common;

use pin_chat::{
    error::AppErr,
    participants,
    presence::{self, JoinRequest},
    rooms::{self, NewRoom},
};

fn req(pin: &str, nickname: &str) -> JoinRequest {
    JoinRequest { pin: pin.into(), nickname: nickname.into(), user_agent: None }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_never_exceed_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let st = common::state(&dir).await;
    let draft = NewRoom { name: "Tight".into(), capacity: Some(3), ..Default::default() };
    let room = rooms::create_room(&st.pool, "admin", draft).await.unwrap();

    let joins = (0..12).map(|i| {
        let st = st.clone();
        let pin = room.pin.clone();
        tokio::spawn(async move {
            presence::join(&st, &req(&pin, &format!("user{i}")), &format!("10.0.0.{i}"), None).await
        })
    });
    let mut admitted = 0;
    let mut full = 0;
    for h in joins.collect::<Vec<_>>() {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(AppErr::RoomFull) => full += 1,
            Err(e) => panic!("unexpected {e}"),
        }
    }
    assert_eq!((admitted, full), (3, 9));
    assert_eq!(participants::online_in_room(&st.pool, &room.id).await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_nickname_race_has_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let st = common::state(&dir).await;
    let draft = NewRoom { name: "Race".into(), ..Default::default() };
    let room = rooms::create_room_with(&st.pool, "admin", draft, || "482913".into()).await.unwrap();

    let a = {
        let st = st.clone();
        tokio::spawn(async move { presence::join(&st, &req("482913", "alex"), "10.1.0.1", None).await })
    };
    let b = {
        let st = st.clone();
        tokio::spawn(async move { presence::join(&st, &req("482913", "alex"), "10.1.0.2", None).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let taken = results.iter().filter(|r| matches!(r, Err(AppErr::NicknameTaken))).count();
    assert_eq!((winners, taken), (1, 1));
    assert_eq!(participants::online_in_room(&st.pool, &room.id).await.unwrap().len(), 1);
}

/// The store alone holds the line, without the in-process room lock.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn direct_reservations_are_atomic() {
    let dir = tempfile::tempdir().unwrap();
    let st = common::state(&dir).await;
    let draft = NewRoom { name: "Raw".into(), capacity: Some(2), ..Default::default() };
    let room = rooms::create_room(&st.pool, "admin", draft).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let pool = st.pool.clone();
            let room_id = room.id.clone();
            tokio::spawn(async move {
                participants::reserve_slot(&pool, &room_id, &format!("n{i}"), &format!("o{i}"), None).await
            })
        })
        .collect();

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(AppErr::RoomFull) => {}
            Err(e) => panic!("unexpected {e}"),
        }
    }
    assert_eq!(ok, 2);
    assert_eq!(rooms::capacity_remaining(&st.pool, &room.id).await.unwrap(), 0);
}
