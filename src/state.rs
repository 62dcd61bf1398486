use std::{collections::HashMap, sync::Arc};

use sqlx::SqlitePool;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{config::Config, gateway::Bindings};

/* ------------ shared handles, cloned into every handler ------------ */
#[derive(Clone)]
pub struct AppState {
    pub pool:     SqlitePool,
    pub config:   Arc<Config>,
    pub bindings: Bindings,
    /// Serialises membership changes (reserve, eviction, deactivation) per room.
    pub membership: RoomLocks,
    /// Single writer per room so fan-out order equals persisted order.
    pub writers:  RoomLocks,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        Self {
            pool,
            config:     Arc::new(config),
            bindings:   Bindings::default(),
            membership: RoomLocks::default(),
            writers:    RoomLocks::default(),
        }
    }
}

/* ------------ one async mutex per room id ------------ */
#[derive(Clone, Default)]
pub struct RoomLocks(Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>);

impl RoomLocks {
    pub async fn lock(&self, room_id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.0.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(room_id.to_owned()).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Drops the lock entry of a room that no longer exists.
    pub fn forget(&self, room_id: &str) {
        let mut map = self.0.lock().unwrap_or_else(|p| p.into_inner());
        map.remove(room_id);
    }
}
