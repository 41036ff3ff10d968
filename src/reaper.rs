//! Shuts down preloaders that nobody asked for workers in a while.

use crate::preloader::Preloader;
use slog_scope::{debug, info};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// The smallest interval the reaper will poll at.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Starts a task that checks the preloader in `slot` every `every`,
/// and shuts it down if it has been idle for longer than its idle
/// timeout.
///
/// The check takes the same lock as duplication does, so a preloader
/// never gets reaped while it is duplicating itself. A reaped
/// preloader stays in the slot as `Terminated` until the next spawn
/// replaces it. The task ends once the slot is gone.
pub(crate) fn spawn_idle_reaper(
    slot: Weak<Mutex<Option<Preloader>>>,
    every: Duration,
    app: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let strong = match slot.upgrade() {
                Some(strong) => strong,
                None => {
                    debug!("spawner is gone, stopping idle reaper"; "app" => &app);
                    return;
                }
            };
            let mut preloader = strong.lock().await;
            if let Some(preloader) = preloader.as_mut() {
                if preloader.reap_if_idle(Instant::now()).await {
                    info!("idle preloader is gone"; "app" => &app);
                }
            }
        }
    })
}
