use crate::configuration::{AppConfig, PreloadStrategy};
use crate::error::SpawnError;
use crate::fork_exec::DirectSpawner;
use crate::preloader::{ExternalLauncher, LaunchPreloader};
use crate::process_control::Spawner;
use crate::smart::SmartSpawner;
use parking_lot::Mutex;
use slog_scope::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;

/// Hands out the spawner for an application, creating it the first
/// time it's asked for. Owns every spawner it created.
pub struct SpawnerFactory {
    spawners: Mutex<HashMap<String, Arc<dyn Spawner>>>,
    launcher: Arc<dyn LaunchPreloader>,
}

impl Default for SpawnerFactory {
    fn default() -> Self {
        SpawnerFactory::new()
    }
}

impl SpawnerFactory {
    pub fn new() -> SpawnerFactory {
        SpawnerFactory::with_launcher(Arc::new(ExternalLauncher))
    }

    /// A factory whose smart spawners get their preloaders from
    /// `launcher`.
    pub fn with_launcher(launcher: Arc<dyn LaunchPreloader>) -> SpawnerFactory {
        SpawnerFactory {
            spawners: Mutex::new(HashMap::new()),
            launcher,
        }
    }

    /// Returns the spawner for `app`. Applications that asked for the
    /// smart strategy but can't be duplicated get a direct spawner.
    pub fn get_spawner(&self, app: &AppConfig) -> Result<Arc<dyn Spawner>, SpawnError> {
        let mut spawners = self.spawners.lock();
        if let Some(spawner) = spawners.get(&app.name) {
            return Ok(spawner.clone());
        }
        app.validate().map_err(|e| SpawnError::LoadError {
            message: e.to_string(),
        })?;
        let spawner: Arc<dyn Spawner> = match app.preload_strategy {
            PreloadStrategy::Smart if SmartSpawner::supports_duplication(app) => Arc::new(
                SmartSpawner::with_launcher(app, self.launcher.clone())?,
            ),
            PreloadStrategy::Smart => {
                info!("application can't be duplicated, spawning its workers directly"; "app" => &app.name);
                Arc::new(DirectSpawner::new(app))
            }
            PreloadStrategy::Direct => Arc::new(DirectSpawner::new(app)),
        };
        debug!("created spawner"; "app" => &app.name, "strategy" => ?spawner.strategy());
        spawners.insert(app.name.clone(), spawner.clone());
        Ok(spawner)
    }

    /// The names of the applications that have a spawner.
    pub fn applications(&self) -> Vec<String> {
        self.spawners.lock().keys().cloned().collect()
    }

    /// Forgets the spawner for the named application and shuts it
    /// down.
    pub async fn remove(&self, name: &str) -> bool {
        let spawner = self.spawners.lock().remove(name);
        match spawner {
            Some(spawner) => {
                spawner.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Shuts down every spawner, terminating all preloaders. Workers
    /// that were handed out keep running.
    pub async fn shutdown(&self) {
        let spawners: Vec<_> = self.spawners.lock().drain().collect();
        for (name, spawner) in spawners {
            debug!("shutting down spawner"; "app" => &name);
            spawner.shutdown().await;
        }
    }
}
