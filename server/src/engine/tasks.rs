//! Periodic background work: snapshot saves, stale-connection cleanup and
//! user-list refreshes.
//!
//! Each loop ticks on its configured interval and exits once the
//! cancellation token fires. A tick that finds the hub busy skips quietly;
//! the next tick tries again.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::chat_hub::{ChatHub, SaveOutcome};

fn interval(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

pub async fn run_save_loop(hub: Arc<ChatHub>, cancel_token: CancellationToken) {
    let secs = hub.config().timers.save_interval_secs;
    info!(interval_secs = secs, "starting save task");
    let mut interval = interval(secs);
    // The first tick completes immediately; nothing has changed yet.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let SaveOutcome::Disabled = hub.periodic_save().await {
                    info!("no snapshot store configured, save task exiting");
                    return;
                }
            }
            _ = cancel_token.cancelled() => {
                info!("save task received shutdown signal, exiting");
                break;
            }
        }
    }
    info!("save task stopped");
}

pub async fn run_cleanup_loop(hub: Arc<ChatHub>, cancel_token: CancellationToken) {
    let secs = hub.config().timers.cleanup_interval_secs;
    info!(interval_secs = secs, "starting cleanup task");
    let mut interval = interval(secs);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let evicted = hub.periodic_cleanup().await;
                if evicted > 0 {
                    debug!(evicted, "cleanup pass evicted connections");
                }
            }
            _ = cancel_token.cancelled() => {
                info!("cleanup task received shutdown signal, exiting");
                break;
            }
        }
    }
    info!("cleanup task stopped");
}

/// Periodically push every bound connection a fresh user list so idle
/// flags and expired rooms show up without any other traffic.
pub async fn run_activity_loop(hub: Arc<ChatHub>, cancel_token: CancellationToken) {
    let secs = hub.config().timers.activity_interval_secs;
    info!(interval_secs = secs, "starting activity task");
    let mut interval = interval(secs);

    loop {
        tokio::select! {
            _ = interval.tick() => hub.broadcast_user_lists().await,
            _ = cancel_token.cancelled() => {
                info!("activity task received shutdown signal, exiting");
                break;
            }
        }
    }
    info!("activity task stopped");
}

/// Spawn all three loops on `cancel_token`.
pub fn spawn_all(hub: &Arc<ChatHub>, cancel_token: &CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        tokio::spawn(run_save_loop(hub.clone(), cancel_token.clone())),
        tokio::spawn(run_cleanup_loop(hub.clone(), cancel_token.clone())),
        tokio::spawn(run_activity_loop(hub.clone(), cancel_token.clone())),
    ]
}
