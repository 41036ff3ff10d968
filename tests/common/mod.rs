//! A preloader that lives in memory, and keeps track of what it was
//! asked to do.

#![allow(dead_code)]

use async_trait::async_trait;
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zwilling::configuration::AppConfig;
use zwilling::{LaunchPreloader, PreloaderControl, SpawnError};

#[derive(Debug, Default)]
pub struct Stats {
    pub starts: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub duplications: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub kills: AtomicUsize,
}

impl Stats {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn duplications(&self) -> usize {
        self.duplications.load(Ordering::SeqCst)
    }

    fn went_live(&self) {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
    }
}

/// How duplications fail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Failure {
    ResourceExhausted,
    StartupHook,
}

impl Failure {
    fn error(self) -> SpawnError {
        match self {
            Failure::ResourceExhausted => SpawnError::ResourceExhausted {
                source: std::io::Error::from_raw_os_error(nix::errno::Errno::EAGAIN as i32),
            },
            Failure::StartupHook => SpawnError::StartupHookError {
                message: "starting_worker_process listener #1 failed: boom".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub load_delay: Duration,
    pub duplicate_delay: Duration,
    pub fail_load: bool,

    /// The first this-many preloaders die when asked to duplicate.
    pub die_during_duplicate: usize,

    pub fail_duplicate: Option<Failure>,
}

#[derive(Clone, Default)]
pub struct FakeLauncher {
    pub stats: Arc<Stats>,
    pub script: Arc<Mutex<Script>>,
    launched: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl FakeLauncher {
    pub fn new(script: Script) -> FakeLauncher {
        FakeLauncher {
            script: Arc::new(Mutex::new(script)),
            ..Default::default()
        }
    }

    /// Kills every preloader behind the spawner's back.
    pub fn crash_all(&self) {
        for alive in self.launched.lock().iter() {
            if alive.swap(false, Ordering::SeqCst) {
                self.stats.live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl LaunchPreloader for FakeLauncher {
    fn launch(&self, _app: &AppConfig) -> Box<dyn PreloaderControl> {
        let alive = Arc::new(AtomicBool::new(false));
        let mut launched = self.launched.lock();
        launched.push(alive.clone());
        Box::new(FakePreloader {
            stats: self.stats.clone(),
            script: self.script.lock().clone(),
            index: launched.len() - 1,
            alive,
            workers: 0,
        })
    }
}

pub struct FakePreloader {
    stats: Arc<Stats>,
    script: Script,
    index: usize,
    alive: Arc<AtomicBool>,
    workers: i32,
}

impl FakePreloader {
    fn die(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.stats.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Counts a duplication as in flight for as long as it exists.
struct InFlight(Arc<Stats>);

impl InFlight {
    fn new(stats: &Arc<Stats>) -> InFlight {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(stats.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PreloaderControl for FakePreloader {
    async fn load(&mut self) -> Result<(), SpawnError> {
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.script.load_delay).await;
        if self.script.fail_load {
            return Err(SpawnError::LoadError {
                message: "syntax error".to_string(),
            });
        }
        self.alive.store(true, Ordering::SeqCst);
        self.stats.went_live();
        Ok(())
    }

    async fn duplicate(&mut self, _id: &str, _socket: &Path) -> Result<Pid, SpawnError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SpawnError::PreloaderDead);
        }
        let _in_flight = InFlight::new(&self.stats);
        tokio::time::sleep(self.script.duplicate_delay).await;
        self.stats.duplications.fetch_add(1, Ordering::SeqCst);
        if self.index < self.script.die_during_duplicate {
            self.die();
            return Err(SpawnError::PreloaderDead);
        }
        if let Some(failure) = self.script.fail_duplicate {
            return Err(failure.error());
        }
        self.workers += 1;
        Ok(Pid::from_raw(
            5_000_000 + (self.index as i32) * 1000 + self.workers,
        ))
    }

    async fn shutdown(&mut self) {
        self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.die();
    }

    async fn kill(&mut self) {
        self.stats.kills.fetch_add(1, Ordering::SeqCst);
        self.die();
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<Pid> {
        Some(Pid::from_raw(6_000_000 + self.index as i32))
    }
}

pub fn smart_app(name: &str) -> AppConfig {
    let mut app = AppConfig::new(name, "/", &["/bin/false"]);
    app.preload_strategy = zwilling::PreloadStrategy::Smart;
    app.runtime_capabilities.duplication = true;
    app.reaper_interval = Duration::from_millis(100);
    app
}
