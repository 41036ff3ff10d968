//! What a spawner hands out: a running worker process and the means to
//! reach it.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::json;
use slog_scope::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How a worker came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Started from scratch, loading the application itself.
    Direct,

    /// Duplicated off a preloader.
    Duplicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Ready,
    Stopping,
    Dead,
}

/// The record of a spawned worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerProcess {
    pub id: String,
    pub pid: Pid,
    pub strategy: Strategy,

    /// The preloader this worker was duplicated from. Only a
    /// reference by PID: the preloader's lifetime is independent of
    /// the worker's.
    pub preloader: Option<Pid>,

    pub created_at: SystemTime,
    pub last_activity: SystemTime,
    pub state: WorkerState,
}

/// A worker process that has started up, ran its startup hooks and
/// is ready to serve on its endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessHandle {
    pub worker: WorkerProcess,

    /// The UNIX domain socket the worker accepts work on.
    pub endpoint: PathBuf,

    /// How long it took from the spawn request until the worker was
    /// ready.
    pub spawn_duration: Duration,
}

impl ProcessHandle {
    pub fn new(
        id: String,
        pid: Pid,
        endpoint: PathBuf,
        strategy: Strategy,
        preloader: Option<Pid>,
        spawn_duration: Duration,
    ) -> ProcessHandle {
        let now = SystemTime::now();
        ProcessHandle {
            worker: WorkerProcess {
                id,
                pid,
                strategy,
                preloader,
                created_at: now,
                last_activity: now,
                state: WorkerState::Ready,
            },
            endpoint,
            spawn_duration,
        }
    }

    pub fn id(&self) -> &str {
        &self.worker.id
    }

    pub fn pid(&self) -> Pid {
        self.worker.pid
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn strategy(&self) -> Strategy {
        self.worker.strategy
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state
    }

    pub fn spawn_duration_ms(&self) -> u64 {
        self.spawn_duration.as_millis() as u64
    }

    /// Records that the worker did something just now.
    pub fn touch(&mut self) {
        self.worker.last_activity = SystemTime::now();
    }

    /// Asks the worker to exit.
    pub fn terminate(&mut self) {
        if self.signal(Signal::SIGTERM) {
            self.worker.state = WorkerState::Stopping;
        }
    }

    /// Kills the worker outright and removes its endpoint.
    pub fn kill(&mut self) {
        self.signal(Signal::SIGKILL);
        self.worker.state = WorkerState::Dead;
        if let Err(e) = std::fs::remove_file(&self.endpoint) {
            debug!("could not remove worker endpoint"; "endpoint" => ?self.endpoint, "error" => %e);
        }
    }

    /// Checks whether the worker process still exists.
    pub fn is_alive(&mut self) -> bool {
        if self.worker.state == WorkerState::Dead {
            return false;
        }
        match kill(self.worker.pid, None::<Signal>) {
            Err(Errno::ESRCH) => {
                self.worker.state = WorkerState::Dead;
                false
            }
            _ => true,
        }
    }

    /// A JSON summary, for humans and scripts.
    pub fn summary(&self) -> serde_json::Value {
        let created_at = self
            .worker
            .created_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        json!({
            "id": self.worker.id,
            "pid": self.worker.pid.as_raw(),
            "endpoint": self.endpoint,
            "strategy": self.worker.strategy,
            "preloader": self.worker.preloader.map(|pid| pid.as_raw()),
            "state": self.worker.state,
            "spawn_duration_ms": self.spawn_duration_ms(),
            "created_at": created_at,
        })
    }

    /// Returns whether the signal got delivered (or the process was
    /// already gone).
    fn signal(&mut self, signal: Signal) -> bool {
        match kill(self.worker.pid, signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => {
                self.worker.state = WorkerState::Dead;
                false
            }
            Err(e) => {
                warn!("could not signal worker"; "pid" => self.worker.pid.as_raw(), "signal" => ?signal, "error" => %e);
                false
            }
        }
    }
}
