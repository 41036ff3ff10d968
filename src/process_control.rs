use crate::error::SpawnError;
use crate::handle::{ProcessHandle, Strategy};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use slog_scope::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Creates worker processes for one application.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Creates a worker and resolves once it is ready to serve.
    ///
    /// Dropping the returned future before it resolves kills the
    /// partially started worker.
    async fn spawn(&self, timeout: Duration) -> Result<ProcessHandle, SpawnError>;

    /// How the workers of this spawner come to be.
    fn strategy(&self) -> Strategy;

    /// Releases helper processes. Workers that were handed out stay
    /// alive.
    async fn shutdown(&self);
}

/// Spawns `count` workers one after another. When one of them fails,
/// the workers spawned before it get terminated and the error is
/// returned.
pub async fn spawn_workers(
    spawner: &dyn Spawner,
    count: usize,
    timeout: Duration,
) -> Result<Vec<ProcessHandle>, SpawnError> {
    let mut handles = Vec::with_capacity(count);
    for _ in 0..count {
        match spawner.spawn(timeout).await {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                warn!("could not spawn all workers, terminating the others"; "spawned" => handles.len(), "error" => %e);
                for handle in handles.iter_mut() {
                    handle.terminate();
                }
                return Err(e);
            }
        }
    }
    Ok(handles)
}

/// Generates a UUID-based ID string.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// IDs of workers whose spawn was given up before the preloader told
/// us their PID. They get killed as soon as that PID shows up.
pub type AbandonedWorkers = Arc<Mutex<HashSet<String>>>;

/// A worker that was requested, but hasn't acked yet. Unless it is
/// disarmed, dropping this kills the worker, or marks it as abandoned
/// if its PID is not known yet.
#[derive(Debug)]
pub(crate) struct PendingWorker {
    id: String,
    pid: Option<Pid>,
    abandoned: Option<AbandonedWorkers>,
    armed: bool,
}

impl PendingWorker {
    pub(crate) fn new(id: String, abandoned: Option<AbandonedWorkers>) -> Self {
        PendingWorker {
            id,
            pid: None,
            abandoned,
            armed: true,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub(crate) fn launched(&mut self, pid: Pid) {
        self.pid = Some(pid);
    }

    /// The worker is ready (or will never exist); leave it alone.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingWorker {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match (self.pid, &self.abandoned) {
            (Some(pid), _) => {
                info!("killing worker that did not finish starting"; "id" => &self.id, "pid" => pid.as_raw());
                kill_quietly(pid, Signal::SIGKILL);
            }
            (None, Some(abandoned)) => {
                abandoned.lock().insert(self.id.clone());
            }
            (None, None) => {}
        }
    }
}

/// Kills the worker if its spawn was abandoned. Returns whether it
/// was.
pub(crate) fn reap_abandoned(abandoned: &AbandonedWorkers, id: &str, pid: Pid) -> bool {
    if abandoned.lock().remove(id) {
        info!("killing abandoned worker"; "id" => id, "pid" => pid.as_raw());
        kill_quietly(pid, Signal::SIGKILL);
        true
    } else {
        false
    }
}

/// Stops waiting for an abandoned worker that will never show up,
/// because the preloader could not create it. Returns whether it was
/// abandoned.
pub(crate) fn forget_abandoned(abandoned: &AbandonedWorkers, id: &str) -> bool {
    abandoned.lock().remove(id)
}

pub(crate) fn kill_quietly(pid: Pid, signal: Signal) {
    match kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("could not signal process"; "pid" => pid.as_raw(), "signal" => ?signal, "error" => %e),
    }
}
