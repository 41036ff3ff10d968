//! The application's side of spawning: a program that links this
//! module gets started by a spawner, loads the application, and then
//! either serves as a worker itself or duplicates itself into workers.
//!
//! ```no_run
//! use std::os::unix::net::UnixListener;
//! use zwilling::loader::{Application, Hooks, Loader};
//!
//! struct Echo;
//!
//! impl Application for Echo {
//!     fn load(&mut self, hooks: &mut Hooks) -> anyhow::Result<()> {
//!         hooks.on_starting_worker_process(|_was_duplicated| Ok(()));
//!         Ok(())
//!     }
//!
//!     fn serve(&mut self, listener: UnixListener) -> anyhow::Result<()> {
//!         for conn in listener.incoming() {
//!             drop(conn?);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     Loader::new(Echo).run()
//! }
//! ```

use crate::logging;
use crate::protocol::{FailureStage, StatusMessage};
use crate::worker_ack::{self, Mode};
use anyhow::{Context, Result};
use channel::Channel;
use preload::Role;
use slog_scope::{info, warn};
use std::env;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

mod channel;
pub mod hooks;
mod preload;

pub use hooks::{DatastoreClient, HookError, Hooks, STARTING_WORKER_PROCESS};

/// An application that can be started by a spawner.
pub trait Application {
    /// Loads the application's code and sets up anything that
    /// survives duplication. Runs exactly once per loader process;
    /// register `starting_worker_process` listeners on `hooks` here.
    fn load(&mut self, hooks: &mut Hooks) -> Result<()>;

    /// Serves requests arriving on the worker's endpoint. Runs in the
    /// worker process; returning ends the worker.
    fn serve(&mut self, listener: UnixListener) -> Result<()>;
}

/// Runs an application in whatever mode the spawner asked for.
pub struct Loader<A: Application> {
    app: A,
    hooks: Hooks,
    name: String,
}

fn env_var(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("${} is not set; was this started by a spawner?", name))
}

impl<A: Application> Loader<A> {
    pub fn new(app: A) -> Loader<A> {
        let name = env::var(worker_ack::APP_ENV).unwrap_or_else(|_| "app".to_string());
        Loader {
            app,
            hooks: Hooks::new(&name),
            name,
        }
    }

    /// Registers a listener for `event`.
    pub fn on<F>(&mut self, event: &str, listener: F) -> &mut Self
    where
        F: FnMut(bool) -> Result<()> + 'static,
    {
        self.hooks.on(event, listener);
        self
    }

    pub fn on_starting_worker_process<F>(&mut self, listener: F) -> &mut Self
    where
        F: FnMut(bool) -> Result<()> + 'static,
    {
        self.hooks.on_starting_worker_process(listener);
        self
    }

    pub fn hooks(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    /// Loads the application and runs it until the process should
    /// exit.
    pub fn run(mut self) -> Result<()> {
        slog_scope::set_global_logger(logging::process_logger(&self.name)).cancel_reset();
        let mode: Mode = env_var(worker_ack::MODE_ENV)?.parse()?;
        let fd: RawFd = env_var(worker_ack::STATUS_FD_ENV)?
            .parse()
            .context("Status FD is not a number")?;
        let mut channel = unsafe { Channel::from_raw_fd(fd) }?;

        let file = env::current_exe().unwrap_or_else(|_| PathBuf::from(&self.name));
        channel.send(&StatusMessage::Loading { file })?;
        info!("loading application"; "mode" => mode.as_str());
        if let Err(e) = self.app.load(&mut self.hooks) {
            warn!("application failed to load"; "error" => %e);
            channel.send(&StatusMessage::Failed {
                id: None,
                stage: FailureStage::Load,
                message: format!("{:#}", e),
                errno: None,
            })?;
            return Err(e);
        }

        match mode {
            Mode::Direct => {
                let id = env_var(worker_ack::WORKER_ID_ENV)?;
                let socket = PathBuf::from(env_var(worker_ack::SOCKET_ENV)?);
                self.start_worker(channel, id, socket, false)
            }
            Mode::Preload => match preload::serve_duplications(channel)? {
                Role::Preloader => Ok(()),
                Role::Worker {
                    id,
                    socket,
                    channel,
                } => self.start_worker(channel, id, socket, true),
            },
        }
    }

    /// Turns this process into a worker: repairs its state, binds the
    /// endpoint, tells the supervisor it's ready and serves.
    fn start_worker(
        mut self,
        mut channel: Channel,
        id: String,
        socket: PathBuf,
        was_duplicated: bool,
    ) -> Result<()> {
        if let Err(e) = self.hooks.starting_worker_process(was_duplicated) {
            channel.send(&StatusMessage::Failed {
                id: Some(id),
                stage: FailureStage::Hook,
                message: e.to_string(),
                errno: None,
            })?;
            return Err(e.into());
        }
        let listener = match UnixListener::bind(&socket) {
            Ok(listener) => listener,
            Err(e) => {
                channel.send(&StatusMessage::Failed {
                    id: Some(id),
                    stage: FailureStage::Bind,
                    message: format!("{:?}: {}", socket, e),
                    errno: e.raw_os_error(),
                })?;
                return Err(e).with_context(|| format!("Could not bind {:?}", socket));
            }
        };
        channel.send(&StatusMessage::Ack { id: id.clone() })?;
        drop(channel);
        info!("worker is serving"; "id" => &id, "endpoint" => ?socket, "was_duplicated" => was_duplicated);
        self.app.serve(listener)
    }
}
