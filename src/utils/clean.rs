use tokio::time;

use crate::{
    error::AppResult,
    events::LeaveReason,
    messages, participants, presence,
    state::AppState,
};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    pub idle:     usize,
    pub closed:   usize,
    pub purged:   u64,
    pub messages: u64,
}

/// One maintenance pass: idle participants out, expired rooms closed, stale
/// rows removed. Live connections are told about every eviction.
pub async fn sweep(state: &AppState) -> AppResult<Sweep> {
    let idle = presence::sweep_inactive(state).await?;
    state.bindings.evict(&idle, LeaveReason::Inactive).await;

    let closed = presence::close_expired(state).await?;
    state.bindings.evict(&closed, LeaveReason::RoomClosed).await;

    let purged = participants::purge_stale(&state.pool, state.config.stale_participant).await?;
    let messages = messages::purge_deleted(&state.pool, state.config.message_retention).await?;

    Ok(Sweep { idle: idle.len(), closed: closed.len(), purged, messages })
}

pub async fn task(state: AppState) {
    let mut tick = time::interval(state.config.sweep_interval);
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        match sweep(&state).await {
            Ok(s) if s != Sweep::default() => {
                tracing::info!(idle = s.idle, closed = s.closed, purged = s.purged, messages = s.messages, "sweep");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "sweep failed"),
        }
    }
}
