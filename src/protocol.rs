//! Messages exchanged between the spawner and the loader processes it
//! starts. Every message is one line of JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Commands the spawner sends to a preloader.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
#[serde(rename_all = "snake_case")]
pub enum PreloaderRequest {
    /// Duplicate the preloader into a new worker, which binds its
    /// endpoint at `socket`.
    Spawn { id: String, socket: PathBuf },

    /// Exit without spawning anything else.
    Shutdown,
}

/// Messages a loader (preloader or worker) sends to the spawner.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
#[serde(rename_all = "snake_case")]
pub enum StatusMessage {
    /// The loader is loading application code.
    Loading {
        /// What is being loaded.
        file: PathBuf,
    },

    /// The preloader has loaded the application and is standing by to
    /// duplicate itself.
    Ready,

    /// The preloader has duplicated itself into a new worker, which is
    /// now initializing.
    Launched { id: String, pid: i32 },

    /// The worker ran its startup hooks, bound its endpoint and is
    /// ready to serve.
    Ack { id: String },

    /// Something went wrong starting a worker (or loading the
    /// preloader, in which case there is no `id`).
    Failed {
        #[serde(default)]
        id: Option<String>,
        stage: FailureStage,
        message: String,
        #[serde(default)]
        errno: Option<i32>,
    },

    /// The loader could not make sense of a request.
    Error { message: String },

    /// Some message that the loader wants us to log.
    Log {
        level: LogLevel,
        msg: String,
        #[serde(flatten)]
        kv: HashMap<String, String>,
    },
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Application code failed to load.
    Load,

    /// `fork(2)` failed in the preloader.
    Fork,

    /// A `starting_worker_process` listener failed.
    Hook,

    /// The worker couldn't bind its endpoint.
    Bind,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}
