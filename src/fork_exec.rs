use crate::configuration::AppConfig;
use crate::error::SpawnError;
use crate::handle::{ProcessHandle, Strategy};
use crate::process_control::{generate_id, PendingWorker, Spawner};
use crate::protocol::StatusMessage;
use crate::worker_ack::{self, InheritableFd, Mode};
use async_trait::async_trait;
use nix::unistd::Pid;
use slog_scope::{debug, info, warn};
use tokio::io::{AsyncBufRead, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, Instant};

/// Starts every worker from scratch: the application's program runs
/// in direct mode, loads the application and then serves.
pub struct DirectSpawner {
    app: AppConfig,
}

impl DirectSpawner {
    pub fn new(app: &AppConfig) -> DirectSpawner {
        DirectSpawner { app: app.clone() }
    }
}

/// Builds the command that runs the application's program in the
/// given mode, with `status` as its status channel.
pub(crate) fn app_command(
    app: &AppConfig,
    mode: Mode,
    status: &InheritableFd,
) -> Result<Command, SpawnError> {
    let program = app.program().ok_or_else(|| SpawnError::LoadError {
        message: format!("application {:?} has no cmdline", app.name),
    })?;
    std::fs::create_dir_all(&app.socket_dir).map_err(|e| SpawnError::LoadError {
        message: format!(
            "could not create socket directory {:?}: {}",
            app.socket_dir, e
        ),
    })?;

    let mut cmd = Command::new(program);
    cmd.args(&app.cmdline[1..])
        .envs(app.env_vars())
        .env(worker_ack::MODE_ENV, mode.as_str())
        .env(worker_ack::STATUS_FD_ENV, status.to_env_value())
        .env(worker_ack::APP_ENV, &app.name)
        .current_dir(&app.root_path);
    let fd = status.as_raw_fd();
    unsafe {
        cmd.pre_exec(move || worker_ack::clear_cloexec(fd));
    }
    Ok(cmd)
}

/// Reads the status channel of a worker until it acks with the given
/// ID, or reports a failure.
async fn await_ack<R>(id: &str, reader: &mut R) -> Result<(), SpawnError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match worker_ack::read_status(reader).await? {
            None => {
                return Err(SpawnError::LoadError {
                    message: "application exited before it was ready".to_string(),
                })
            }
            Some(StatusMessage::Ack { id: acked }) if acked == id => return Ok(()),
            Some(StatusMessage::Ack { id: acked }) => {
                warn!("worker acked with an unexpected ID"; "expected" => id, "acked" => acked);
            }
            Some(StatusMessage::Failed {
                stage,
                message,
                errno,
                ..
            }) => return Err(SpawnError::from_failure(stage, message, errno)),
            Some(StatusMessage::Loading { file }) => {
                debug!("loading"; "file" => ?file);
            }
            Some(msg) => {
                debug!("ignoring unexpected worker message"; "msg" => ?msg);
            }
        }
    }
}

#[async_trait]
impl Spawner for DirectSpawner {
    async fn spawn(&self, within: std::time::Duration) -> Result<ProcessHandle, SpawnError> {
        let started = Instant::now();
        let id = generate_id();
        let socket = self.app.socket_path(&id);
        let (theirs, ours) = worker_ack::status_channel()?;
        let mut cmd = app_command(&self.app, Mode::Direct, &theirs)?;
        cmd.env(worker_ack::WORKER_ID_ENV, &id)
            .env(worker_ack::SOCKET_ENV, &socket);
        let child = cmd.spawn().map_err(SpawnError::from_spawn_io)?;
        drop(theirs);

        let pid = child
            .id()
            .map(|pid| Pid::from_raw(pid as i32))
            .ok_or_else(|| SpawnError::LoadError {
                message: "application exited before it was ready".to_string(),
            })?;
        let mut worker = PendingWorker::new(id.clone(), None);
        worker.launched(pid);
        debug!("worker launched"; "app" => &self.app.name, "id" => &id, "pid" => pid.as_raw());

        let mut reader = BufReader::new(ours);
        match timeout(within, await_ack(&id, &mut reader)).await {
            Ok(Ok(())) => worker.disarm(),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(SpawnError::SpawnTimeout { timeout: within }),
        }
        info!("worker is ready"; "app" => &self.app.name, "id" => &id, "pid" => pid.as_raw());
        Ok(ProcessHandle::new(
            id,
            pid,
            socket,
            Strategy::Direct,
            None,
            started.elapsed(),
        ))
    }

    fn strategy(&self) -> Strategy {
        Strategy::Direct
    }

    async fn shutdown(&self) {}
}
