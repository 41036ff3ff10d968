//! The ways a spawn can fail.

use crate::protocol::FailureStage;
use nix::errno::Errno;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpawnError {
    /// The application failed to initialize. Fatal to the spawn
    /// attempt, not to the spawner.
    #[error("application failed to load: {message}")]
    LoadError { message: String },

    /// The worker did not become ready in time. Callers may retry.
    #[error("worker did not become ready within {timeout:?}")]
    SpawnTimeout { timeout: Duration },

    /// The preloader process is gone. Smart spawners recover from this
    /// once by restarting the preloader.
    #[error("preloader process has died")]
    PreloaderDead,

    /// The OS refused to create another process.
    #[error("the OS refused to create a process: {source}")]
    ResourceExhausted {
        #[source]
        source: io::Error,
    },

    /// A `starting_worker_process` listener failed inside the new
    /// worker, which has been torn down.
    #[error("a starting_worker_process listener failed: {message}")]
    StartupHookError { message: String },

    /// The application can't be spawned by duplication; use a direct
    /// spawner instead.
    #[error("application {app:?} does not support process duplication")]
    DuplicationUnsupported { app: String },

    /// Garbled traffic or plumbing failures on the status channel.
    #[error(transparent)]
    Protocol(#[from] anyhow::Error),
}

fn is_resource_exhaustion(errno: Errno) -> bool {
    matches!(
        errno,
        Errno::EAGAIN | Errno::ENOMEM | Errno::EMFILE | Errno::ENFILE
    )
}

impl SpawnError {
    /// Classifies an error from starting a program.
    pub(crate) fn from_spawn_io(err: io::Error) -> SpawnError {
        match err.raw_os_error().map(Errno::from_i32) {
            Some(errno) if is_resource_exhaustion(errno) => {
                SpawnError::ResourceExhausted { source: err }
            }
            _ => SpawnError::LoadError {
                message: format!("could not start the application: {}", err),
            },
        }
    }

    /// Classifies a failure that the loader reported over the status
    /// channel.
    pub(crate) fn from_failure(
        stage: FailureStage,
        message: String,
        errno: Option<i32>,
    ) -> SpawnError {
        match stage {
            FailureStage::Hook => SpawnError::StartupHookError { message },
            FailureStage::Fork => match errno {
                Some(errno) if is_resource_exhaustion(Errno::from_i32(errno)) => {
                    SpawnError::ResourceExhausted {
                        source: io::Error::from_raw_os_error(errno),
                    }
                }
                _ => SpawnError::LoadError {
                    message: format!("preloader could not duplicate itself: {}", message),
                },
            },
            FailureStage::Load => SpawnError::LoadError { message },
            FailureStage::Bind => SpawnError::LoadError {
                message: format!("worker could not bind its endpoint: {}", message),
            },
        }
    }
}
