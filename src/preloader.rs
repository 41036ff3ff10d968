//! The supervisor's side of a preloader: a process that has loaded
//! the application once and duplicates itself into workers on
//! request.

pub use self::machine::PreloaderState;
use self::machine::{
    Died, DuplicationFinished, DuplicationRequested, IdleCheck, Loaded, ShutdownComplete,
    StartRequested, Stop,
};
use crate::configuration::AppConfig;
use crate::error::SpawnError;
use crate::fork_exec;
use crate::handle::{ProcessHandle, Strategy};
use crate::process_control::{
    forget_abandoned, generate_id, reap_abandoned, AbandonedWorkers, PendingWorker,
};
use crate::protocol::{FailureStage, PreloaderRequest, StatusMessage};
use crate::worker_ack::{self, Mode};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use nix::unistd::Pid;
use slog_scope::{debug, error, info, warn};
use std::mem;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

pub(crate) mod logging;
pub mod machine;

/// How long a preloader gets to exit after being asked to, before it
/// gets killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Controls a preloader process.
#[async_trait]
pub trait PreloaderControl: Send {
    /// Launches the process and resolves once the application is
    /// loaded and the preloader is ready to duplicate itself.
    async fn load(&mut self) -> Result<(), SpawnError>;

    /// Has the preloader duplicate itself into a worker with the
    /// given ID, which binds its endpoint at `socket`. Resolves with
    /// the worker's PID once it is ready to serve.
    ///
    /// Dropping the future before it resolves must not leave a
    /// worker running.
    async fn duplicate(&mut self, id: &str, socket: &Path) -> Result<Pid, SpawnError>;

    /// Asks the process to exit, and makes sure it does.
    async fn shutdown(&mut self);

    /// Kills the process right away.
    async fn kill(&mut self);

    /// Checks whether the process is still running.
    fn is_alive(&mut self) -> bool;

    fn pid(&self) -> Option<Pid>;
}

/// Creates preloader processes for an application.
pub trait LaunchPreloader: Send + Sync {
    fn launch(&self, app: &AppConfig) -> Box<dyn PreloaderControl>;
}

/// Launches the application's own program in preload mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalLauncher;

impl LaunchPreloader for ExternalLauncher {
    fn launch(&self, app: &AppConfig) -> Box<dyn PreloaderControl> {
        Box::new(ExternalPreloader::new(app))
    }
}

/// A preloader in the application's state machine. Holds the process
/// and tracks what it is up to.
pub struct Preloader {
    app: AppConfig,
    process: Box<dyn PreloaderControl>,
    state: PreloaderState,
    idle_timeout: Option<Duration>,
}

impl Preloader {
    pub fn new(app: &AppConfig, process: Box<dyn PreloaderControl>) -> Preloader {
        Preloader {
            app: app.clone(),
            process,
            state: PreloaderState::not_started(),
            idle_timeout: app.idle_timeout(),
        }
    }

    pub fn state(&self) -> &PreloaderState {
        &self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.process.pid()
    }

    pub fn idle_since(&self) -> Option<Instant> {
        self.state.idle_since()
    }

    /// Whether this preloader can still be asked for workers.
    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    fn transition(&mut self, with: impl FnOnce(PreloaderState) -> PreloaderState) {
        let state = mem::replace(&mut self.state, PreloaderState::Error);
        self.state = with(state);
        if self.state == PreloaderState::Error {
            error!("preloader state machine went into an error state. This is a bug."; "app" => &self.app.name);
        }
    }

    /// A duplication whose caller went away leaves the preloader
    /// `Busy`. Since duplicating and reaping both happen under the same
    /// lock, a `Busy` preloader seen by either of them is one of those.
    fn settle(&mut self) {
        if let PreloaderState::Busy(_) = self.state {
            debug!("previous duplication was abandoned"; "app" => &self.app.name);
            self.transition(|s| s.on_duplication_finished(DuplicationFinished(Instant::now())));
        }
    }

    /// Launches the preloader and waits until it has loaded the
    /// application.
    pub async fn start(&mut self, within: Duration) -> Result<(), SpawnError> {
        self.transition(|s| s.on_start_requested(StartRequested));
        info!("starting preloader"; "app" => &self.app.name);
        let result = match timeout(within, self.process.load()).await {
            Ok(result) => result,
            Err(_) => Err(SpawnError::SpawnTimeout { timeout: within }),
        };
        match result {
            Ok(()) => {
                info!("preloader loaded the application"; "app" => &self.app.name, "pid" => self.pid().map(Pid::as_raw));
                self.transition(|s| s.on_loaded(Loaded(Instant::now())));
                Ok(())
            }
            Err(e) => {
                warn!("preloader failed to load"; "app" => &self.app.name, "error" => %e);
                self.process.kill().await;
                self.transition(|s| s.on_died(Died));
                Err(e)
            }
        }
    }

    /// Duplicates the preloader into a new worker. Only possible when
    /// the preloader is idle.
    pub async fn duplicate(&mut self, within: Duration) -> Result<ProcessHandle, SpawnError> {
        self.settle();
        match self.state {
            PreloaderState::Idle(_) => {}
            ref state if state.is_terminal() => return Err(SpawnError::PreloaderDead),
            ref state => {
                return Err(anyhow!("Preloader can not duplicate itself while {:?}", state).into())
            }
        }
        if !self.process.is_alive() {
            info!("preloader has exited"; "app" => &self.app.name);
            self.transition(|s| s.on_died(Died));
            return Err(SpawnError::PreloaderDead);
        }

        self.transition(|s| s.on_duplication_requested(DuplicationRequested));
        let started = Instant::now();
        let id = generate_id();
        let socket = self.app.socket_path(&id);
        debug!("requesting a worker"; "app" => &self.app.name, "id" => &id);
        let result = match timeout(within, self.process.duplicate(&id, &socket)).await {
            Ok(result) => result,
            Err(_) => Err(SpawnError::SpawnTimeout { timeout: within }),
        };
        match result {
            Ok(pid) => {
                self.transition(|s| s.on_duplication_finished(DuplicationFinished(Instant::now())));
                info!("worker is ready"; "app" => &self.app.name, "id" => &id, "pid" => pid.as_raw());
                Ok(ProcessHandle::new(
                    id,
                    pid,
                    socket,
                    Strategy::Duplicated,
                    self.pid(),
                    started.elapsed(),
                ))
            }
            Err(SpawnError::PreloaderDead) => {
                warn!("preloader died while duplicating"; "app" => &self.app.name, "id" => &id);
                self.process.kill().await;
                self.transition(|s| s.on_died(Died));
                Err(SpawnError::PreloaderDead)
            }
            Err(e) => {
                self.transition(|s| s.on_duplication_finished(DuplicationFinished(Instant::now())));
                Err(e)
            }
        }
    }

    /// Shuts the preloader down if it has been idle for longer than
    /// its idle timeout. Returns whether it did.
    pub async fn reap_if_idle(&mut self, now: Instant) -> bool {
        let idle_timeout = match self.idle_timeout {
            Some(idle_timeout) => idle_timeout,
            None => return false,
        };
        self.settle();
        if self.idle_since().is_none() {
            return false;
        }
        self.transition(|s| {
            s.on_idle_check(IdleCheck {
                now,
                timeout: idle_timeout,
            })
        });
        if let PreloaderState::ShuttingDown(_) = self.state {
            info!("reaping idle preloader"; "app" => &self.app.name, "pid" => self.pid().map(Pid::as_raw));
            self.process.shutdown().await;
            self.transition(|s| s.on_shutdown_complete(ShutdownComplete));
            true
        } else {
            false
        }
    }

    /// Shuts the preloader down, no matter what it is doing.
    pub async fn stop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if !matches!(self.state, PreloaderState::ShuttingDown(_)) {
            self.transition(|s| s.on_stop(Stop));
        }
        info!("stopping preloader"; "app" => &self.app.name, "pid" => self.pid().map(Pid::as_raw));
        self.process.shutdown().await;
        self.transition(|s| s.on_shutdown_complete(ShutdownComplete));
    }
}

/// A preloader that runs the application's program in preload mode
/// and talks to it over a status channel.
pub struct ExternalPreloader {
    app: AppConfig,
    child: Option<Child>,
    writer: Option<OwnedWriteHalf>,
    messages: Option<mpsc::Receiver<anyhow::Result<StatusMessage>>>,
    reader: Option<JoinHandle<()>>,
    abandoned: AbandonedWorkers,
}

impl ExternalPreloader {
    pub fn new(app: &AppConfig) -> ExternalPreloader {
        ExternalPreloader {
            app: app.clone(),
            child: None,
            writer: None,
            messages: None,
            reader: None,
            abandoned: AbandonedWorkers::default(),
        }
    }

    async fn send_message(&mut self, msg: &PreloaderRequest) -> anyhow::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("Preloader control channel is closed"))?;
        let mut msg = serde_json::to_vec(msg)?;
        msg.push(b'\n');
        writer
            .write_all(&msg)
            .await
            .context("Failed to send control message")?;
        writer
            .flush()
            .await
            .context("Could not flush control channel")?;
        Ok(())
    }

    fn close(&mut self) {
        self.messages = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    /// Returns the next message from the preloader, or `None` once the
    /// channel is closed.
    async fn next_message(&mut self) -> Result<Option<StatusMessage>, SpawnError> {
        let messages = match self.messages.as_mut() {
            Some(messages) => messages,
            None => return Ok(None),
        };
        match messages.recv().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(e.into()),
            None => {
                debug!("preloader status channel is closed"; "app" => &self.app.name);
                Ok(None)
            }
        }
    }
}

/// Reads status messages off the preloader's channel and forwards
/// them until the channel closes. Keeps reads from getting cut off
/// halfway through a line when a spawn gets cancelled.
async fn forward_status(
    reader: OwnedReadHalf,
    messages: mpsc::Sender<anyhow::Result<StatusMessage>>,
) {
    let mut reader = BufReader::new(reader);
    loop {
        match worker_ack::read_status(&mut reader).await {
            Ok(Some(msg)) => {
                if messages.send(Ok(msg)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = messages.send(Err(e)).await;
                return;
            }
        }
    }
}

#[async_trait]
impl PreloaderControl for ExternalPreloader {
    async fn load(&mut self) -> Result<(), SpawnError> {
        let (theirs, ours) = worker_ack::status_channel()?;
        let mut cmd = fork_exec::app_command(&self.app, Mode::Preload, &theirs)?;
        cmd.kill_on_drop(true);
        debug!("running preloader"; "cmd" => ?cmd);
        let child = cmd.spawn().map_err(SpawnError::from_spawn_io)?;
        drop(theirs);
        debug!("preloader running"; "pid" => ?child.id());
        self.child = Some(child);

        let (read, write) = ours.into_split();
        let (sender, receiver) = mpsc::channel(16);
        self.reader = Some(tokio::spawn(forward_status(read, sender)));
        self.writer = Some(write);
        self.messages = Some(receiver);

        loop {
            match self.next_message().await? {
                None => {
                    return Err(SpawnError::LoadError {
                        message: "preloader exited while loading the application".to_string(),
                    })
                }
                Some(StatusMessage::Loading { file }) => {
                    debug!("loading"; "file" => ?file);
                }
                Some(StatusMessage::Ready) => return Ok(()),
                Some(StatusMessage::Failed {
                    stage,
                    message,
                    errno,
                    ..
                }) => return Err(SpawnError::from_failure(stage, message, errno)),
                Some(StatusMessage::Error { message }) => {
                    return Err(SpawnError::LoadError { message })
                }
                Some(msg) => {
                    return Err(anyhow!("Unexpected preloader message {:?} while loading", msg).into())
                }
            }
        }
    }

    async fn duplicate(&mut self, id: &str, socket: &Path) -> Result<Pid, SpawnError> {
        if let Err(e) = self
            .send_message(&PreloaderRequest::Spawn {
                id: id.to_string(),
                socket: socket.to_path_buf(),
            })
            .await
        {
            debug!("could not send spawn request"; "error" => %e);
            return Err(SpawnError::PreloaderDead);
        }

        let mut worker = PendingWorker::new(id.to_string(), Some(self.abandoned.clone()));
        let mut acked = false;
        loop {
            match self.next_message().await? {
                None => return Err(SpawnError::PreloaderDead),
                Some(StatusMessage::Launched { id: launched, pid }) => {
                    let pid = Pid::from_raw(pid);
                    if launched == worker.id() {
                        debug!("worker launched"; "id" => &launched, "pid" => pid.as_raw());
                        worker.launched(pid);
                    } else if !reap_abandoned(&self.abandoned, &launched, pid) {
                        warn!("preloader launched a worker nobody asked for"; "id" => &launched, "pid" => pid.as_raw());
                    }
                }
                Some(StatusMessage::Ack { id: acked_id }) => {
                    if acked_id == worker.id() {
                        acked = true;
                    } else {
                        debug!("ignoring ack from an abandoned worker"; "id" => &acked_id);
                    }
                }
                Some(StatusMessage::Failed {
                    id: failed,
                    stage,
                    message,
                    errno,
                }) => {
                    match failed {
                        Some(ref failed) if failed == worker.id() => {
                            // No worker process exists to wait for.
                            if stage == FailureStage::Fork {
                                worker.disarm();
                            }
                            return Err(SpawnError::from_failure(stage, message, errno));
                        }
                        Some(ref failed) if forget_abandoned(&self.abandoned, failed) => {
                            debug!("abandoned worker failed to start"; "id" => failed, "message" => %message);
                        }
                        _ => {
                            debug!("ignoring failure of another worker"; "id" => ?failed, "message" => %message);
                        }
                    }
                }
                Some(StatusMessage::Error { message }) => {
                    return Err(anyhow!("Preloader rejected the request: {}", message).into())
                }
                Some(msg) => {
                    debug!("ignoring unexpected preloader message"; "msg" => ?msg);
                }
            }
            if acked {
                if let Some(pid) = worker.pid() {
                    worker.disarm();
                    return Ok(pid);
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.writer.is_some() {
            if let Err(e) = self.send_message(&PreloaderRequest::Shutdown).await {
                debug!("could not ask preloader to shut down"; "error" => %e);
            }
        }
        self.writer = None;
        if let Some(mut child) = self.child.take() {
            match timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("preloader exited"; "status" => ?status),
                Ok(Err(e)) => warn!("could not wait for preloader"; "error" => %e),
                Err(_) => {
                    warn!("preloader did not exit in time, killing it"; "app" => &self.app.name);
                    if let Err(e) = child.kill().await {
                        warn!("could not kill preloader"; "error" => %e);
                    }
                }
            }
        }
        self.close();
    }

    async fn kill(&mut self) {
        self.writer = None;
        if let Some(mut child) = self.child.take() {
            debug!("killing preloader"; "app" => &self.app.name, "pid" => ?child.id());
            if let Err(e) = child.kill().await {
                warn!("could not kill preloader"; "error" => %e);
            }
        }
        self.close();
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                debug!("preloader has exited"; "status" => ?status);
                false
            }
            Some(Err(e)) => {
                warn!("could not check on preloader"; "error" => %e);
                false
            }
            None => false,
        }
    }

    fn pid(&self) -> Option<Pid> {
        self.child
            .as_ref()
            .and_then(Child::id)
            .map(|pid| Pid::from_raw(pid as i32))
    }
}

impl Drop for ExternalPreloader {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
