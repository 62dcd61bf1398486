//! Live connection bindings.
//!
//! The table is process-local and owned here: the socket loop registers and
//! binds connections, everything else reads fan-out sets or asks for an
//! eviction through these methods. It is rebuilt from nothing on restart and is
//! the only answer to "who is reachable right now"; the `online` column in the
//! store can lag behind it.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::{
    events::{LeaveReason, Member, ServerEvent},
    presence::Departure,
};

pub type ConnId = Uuid;
pub type Tx = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub session_token:  String,
    pub participant_id: String,
    pub room_id:        String,
    pub nickname:       String,
}

struct Conn {
    tx:      Tx,
    binding: Option<Binding>,
}

#[derive(Clone, Default)]
pub struct Bindings(Arc<RwLock<HashMap<ConnId, Conn>>>);

impl Bindings {
    pub async fn register(&self, id: ConnId, tx: Tx) {
        self.0.write().await.insert(id, Conn { tx, binding: None });
    }

    /// Binds a registered connection, returning what it was bound to before.
    pub async fn bind(&self, id: ConnId, binding: Binding) -> Option<Binding> {
        let mut map = self.0.write().await;
        map.get_mut(&id).and_then(|c| c.binding.replace(binding))
    }

    pub async fn unbind(&self, id: ConnId) -> Option<Binding> {
        let mut map = self.0.write().await;
        map.get_mut(&id).and_then(|c| c.binding.take())
    }

    /// Forgets a closed connection.
    pub async fn remove(&self, id: ConnId) -> Option<Binding> {
        self.0.write().await.remove(&id).and_then(|c| c.binding)
    }

    pub async fn binding(&self, id: ConnId) -> Option<Binding> {
        self.0.read().await.get(&id).and_then(|c| c.binding.clone())
    }

    pub async fn is_participant_bound(&self, participant_id: &str) -> bool {
        self.0
            .read()
            .await
            .values()
            .any(|c| c.binding.as_ref().is_some_and(|b| b.participant_id == participant_id))
    }

    /// The fan-out set of a room.
    pub async fn bindings_for_room(&self, room_id: &str) -> Vec<(ConnId, Binding)> {
        self.0
            .read()
            .await
            .iter()
            .filter_map(|(id, c)| match &c.binding {
                Some(b) if b.room_id == room_id => Some((*id, b.clone())),
                _ => None,
            })
            .collect()
    }

    pub async fn members(&self, room_id: &str) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .bindings_for_room(room_id)
            .await
            .into_iter()
            .map(|(_, b)| Member { participant_id: b.participant_id, nickname: b.nickname })
            .collect();
        members.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        members.dedup_by(|a, b| a.participant_id == b.participant_id);
        members
    }

    pub async fn connection_count(&self) -> usize {
        self.0.read().await.len()
    }

    pub async fn send_to(&self, id: ConnId, event: ServerEvent) -> bool {
        match self.0.read().await.get(&id) {
            Some(c) => c.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Pushes `event` to every connection bound to `room_id` except `except`.
    /// Returns how many queues accepted it.
    pub async fn broadcast(&self, room_id: &str, event: &ServerEvent, except: Option<ConnId>) -> usize {
        let map = self.0.read().await;
        map.iter()
            .filter(|(id, c)| {
                Some(**id) != except
                    && c.binding.as_ref().is_some_and(|b| b.room_id == room_id)
            })
            .filter(|(_, c)| c.tx.send(event.clone()).is_ok())
            .count()
    }

    /// Tells the room a participant is gone.
    pub async fn announce_departure(&self, d: &Departure, reason: LeaveReason) {
        let event = ServerEvent::UserLeft {
            room_id:        d.room_id.clone(),
            participant_id: d.participant_id.clone(),
            nickname:       d.nickname.clone(),
            reason,
        };
        self.broadcast(&d.room_id, &event, None).await;
    }

    /// Unbinds every connection held by the departed participants, tells
    /// those connections why, then tells the rest of each room.
    pub async fn evict(&self, departures: &[Departure], reason: LeaveReason) {
        if departures.is_empty() {
            return;
        }
        {
            let mut map = self.0.write().await;
            for conn in map.values_mut() {
                let hit = conn.binding.as_ref().is_some_and(|b| {
                    departures.iter().any(|d| d.participant_id == b.participant_id)
                });
                if hit {
                    if let Some(b) = conn.binding.take() {
                        let _ = conn.tx.send(ServerEvent::Left { room_id: b.room_id, reason });
                    }
                }
            }
        }
        for d in departures {
            self.announce_departure(d, reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(participant: &str, room: &str) -> Binding {
        Binding {
            session_token:  format!("tok-{participant}"),
            participant_id: participant.into(),
            room_id:        room.into(),
            nickname:       format!("nick-{participant}"),
        }
    }

    async fn connect(b: &Bindings, bind: Option<Binding>) -> (ConnId, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        b.register(id, tx).await;
        if let Some(bind) = bind {
            b.bind(id, bind).await;
        }
        (id, rx)
    }

    #[tokio::test]
    async fn broadcast_reaches_only_the_room() {
        let b = Bindings::default();
        let (a1, mut rx_a1) = connect(&b, Some(binding("p1", "A"))).await;
        let (_a2, mut rx_a2) = connect(&b, Some(binding("p2", "A"))).await;
        let (_b1, mut rx_b1) = connect(&b, Some(binding("p3", "B"))).await;
        let (_idle, mut rx_idle) = connect(&b, None).await;

        let sent = b.broadcast("A", &ServerEvent::Pong, Some(a1)).await;
        assert_eq!(sent, 1);
        assert!(rx_a2.try_recv().is_ok());
        assert!(rx_a1.try_recv().is_err());
        assert!(rx_b1.try_recv().is_err());
        assert!(rx_idle.try_recv().is_err());
    }

    #[tokio::test]
    async fn rebinding_returns_the_previous_binding() {
        let b = Bindings::default();
        let (id, _rx) = connect(&b, Some(binding("p1", "A"))).await;
        let prev = b.bind(id, binding("p1", "B")).await;
        assert_eq!(prev.map(|p| p.room_id), Some("A".to_string()));
        assert!(b.bindings_for_room("A").await.is_empty());
        assert_eq!(b.bindings_for_room("B").await.len(), 1);

        assert!(b.remove(id).await.is_some());
        assert!(b.unbind(id).await.is_none());
        assert_eq!(b.connection_count().await, 0);
    }

    #[tokio::test]
    async fn evict_unbinds_and_notifies() {
        let b = Bindings::default();
        let (gone, mut rx_gone) = connect(&b, Some(binding("p1", "A"))).await;
        let (_stay, mut rx_stay) = connect(&b, Some(binding("p2", "A"))).await;

        let d = Departure { participant_id: "p1".into(), nickname: "nick-p1".into(), room_id: "A".into() };
        b.evict(&[d], LeaveReason::RoomClosed).await;

        assert!(b.binding(gone).await.is_none());
        assert!(matches!(rx_gone.try_recv(), Ok(ServerEvent::Left { reason: LeaveReason::RoomClosed, .. })));
        match rx_stay.try_recv() {
            Ok(ServerEvent::UserLeft { participant_id, .. }) => assert_eq!(participant_id, "p1"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!b.is_participant_bound("p1").await);
        assert_eq!(b.members("A").await.len(), 1);
    }
}
