use super::channel::Channel;
use crate::protocol::{FailureStage, PreloaderRequest, StatusMessage};
use anyhow::Result;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{fork, ForkResult};
use slog_scope::{debug, info};
use std::path::PathBuf;

/// What a process turned out to be after serving duplication requests.
pub(crate) enum Role {
    /// The preloader itself, told to stop.
    Preloader,

    /// A freshly duplicated worker.
    Worker {
        id: String,
        socket: PathBuf,
        channel: Channel,
    },
}

/// Duplicates this process whenever the supervisor asks for a worker.
/// Returns in the preloader once it should exit, and in each
/// duplicated worker right after the fork.
///
/// The preloader must be single-threaded when this gets called.
pub(crate) fn serve_duplications(mut channel: Channel) -> Result<Role> {
    // Workers are nobody's business in the preloader; let the kernel
    // reap them.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }?;
    channel.send(&StatusMessage::Ready)?;
    info!("preloader is ready");

    loop {
        let request = match channel.next_request()? {
            Some(request) => request,
            None => {
                info!("supervisor closed the control channel");
                return Ok(Role::Preloader);
            }
        };
        match request {
            PreloaderRequest::Shutdown => {
                info!("shutting down");
                return Ok(Role::Preloader);
            }
            PreloaderRequest::Spawn { id, socket } => match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    return Ok(Role::Worker {
                        id,
                        socket,
                        channel,
                    })
                }
                Ok(ForkResult::Parent { child }) => {
                    debug!("duplicated"; "id" => &id, "pid" => child.as_raw());
                    channel.send(&StatusMessage::Launched {
                        id,
                        pid: child.as_raw(),
                    })?;
                }
                Err(errno) => {
                    channel.send(&StatusMessage::Failed {
                        id: Some(id),
                        stage: FailureStage::Fork,
                        message: errno.desc().to_string(),
                        errno: Some(errno as i32),
                    })?;
                }
            },
        }
    }
}
