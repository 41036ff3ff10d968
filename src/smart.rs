use crate::configuration::AppConfig;
use crate::error::SpawnError;
use crate::handle::{ProcessHandle, Strategy};
use crate::preloader::{ExternalLauncher, LaunchPreloader, Preloader, PreloaderState};
use crate::process_control::Spawner;
use crate::reaper;
use async_trait::async_trait;
use nix::unistd::Pid;
use slog_scope::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Spawns workers by duplicating a preloader that loaded the
/// application once. The preloader gets started on the first spawn,
/// restarted when it dies, and shut down when it sits idle for longer
/// than the application's idle timeout.
pub struct SmartSpawner {
    app: AppConfig,
    launcher: Arc<dyn LaunchPreloader>,

    /// The application's preloader, if there is one. Everything that
    /// touches the preloader (starting, duplicating, reaping,
    /// stopping) holds this lock, so these never overlap.
    slot: Arc<Mutex<Option<Preloader>>>,

    reaper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SmartSpawner {
    /// Whether workers of `app` can be created by duplicating a
    /// preloader.
    pub fn supports_duplication(app: &AppConfig) -> bool {
        cfg!(unix) && app.runtime_capabilities.duplication
    }

    pub fn new(app: &AppConfig) -> Result<SmartSpawner, SpawnError> {
        SmartSpawner::with_launcher(app, Arc::new(ExternalLauncher))
    }

    /// Creates a spawner whose preloaders come from `launcher`.
    pub fn with_launcher(
        app: &AppConfig,
        launcher: Arc<dyn LaunchPreloader>,
    ) -> Result<SmartSpawner, SpawnError> {
        if !SmartSpawner::supports_duplication(app) {
            return Err(SpawnError::DuplicationUnsupported {
                app: app.name.clone(),
            });
        }
        Ok(SmartSpawner {
            app: app.clone(),
            launcher,
            slot: Arc::new(Mutex::new(None)),
            reaper: parking_lot::Mutex::new(None),
        })
    }

    /// The state of the current preloader, if there is one.
    pub async fn preloader_state(&self) -> Option<PreloaderState> {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|preloader| preloader.state().clone())
    }

    pub async fn preloader_pid(&self) -> Option<Pid> {
        self.slot.lock().await.as_ref().and_then(Preloader::pid)
    }

    /// Starts the idle reaper, unless it's running already or the
    /// application keeps its preloader forever.
    fn ensure_reaper(&self) {
        if self.app.idle_timeout().is_none() {
            return;
        }
        let mut reaper = self.reaper.lock();
        if reaper.is_none() {
            *reaper = Some(reaper::spawn_idle_reaper(
                Arc::downgrade(&self.slot),
                self.app.reaper_interval,
                self.app.name.clone(),
            ));
        }
    }

    async fn discard(&self, slot: &mut Option<Preloader>) {
        if let Some(mut preloader) = slot.take() {
            preloader.stop().await;
        }
    }

    async fn spawn_locked(
        &self,
        slot: &mut Option<Preloader>,
        deadline: Instant,
    ) -> Result<ProcessHandle, SpawnError> {
        let live = matches!(slot.as_ref(), Some(preloader) if preloader.is_live());
        if !live {
            self.discard(slot).await;
            let mut preloader = Preloader::new(&self.app, self.launcher.launch(&self.app));
            preloader.start(remaining(deadline)).await?;
            *slot = Some(preloader);
        }
        let preloader = slot.as_mut().ok_or(SpawnError::PreloaderDead)?;
        preloader.duplicate(remaining(deadline)).await
    }
}

/// Roughly 30 years from now, for timeouts too large to add to an
/// `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[async_trait]
impl Spawner for SmartSpawner {
    async fn spawn(&self, timeout: Duration) -> Result<ProcessHandle, SpawnError> {
        self.ensure_reaper();
        let deadline = deadline_after(timeout);
        let mut slot = self.slot.lock().await;
        let result = match self.spawn_locked(&mut slot, deadline).await {
            Err(SpawnError::PreloaderDead) => {
                warn!("preloader died, restarting it"; "app" => &self.app.name);
                self.discard(&mut slot).await;
                match self.spawn_locked(&mut slot, deadline).await {
                    Err(SpawnError::PreloaderDead) => {
                        warn!("restarted preloader died too"; "app" => &self.app.name);
                        self.discard(&mut slot).await;
                        Err(SpawnError::SpawnTimeout { timeout })
                    }
                    result => result,
                }
            }
            result => result,
        };
        // Report the caller's timeout, not what was left of it.
        result.map_err(|e| match e {
            SpawnError::SpawnTimeout { .. } => SpawnError::SpawnTimeout { timeout },
            e => e,
        })
    }

    fn strategy(&self) -> Strategy {
        Strategy::Duplicated
    }

    async fn shutdown(&self) {
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            info!("shutting down preloader"; "app" => &self.app.name);
        }
        self.discard(&mut slot).await;
    }
}

impl Drop for SmartSpawner {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.get_mut().take() {
            reaper.abort();
        }
    }
}
