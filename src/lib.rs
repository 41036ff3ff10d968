//! Creates the worker processes of an application server.
//!
//! Workers get started either from scratch (every worker loads the
//! application itself), or by duplicating a preloader process that
//! loaded the application once. The application's side of that lives
//! in [`loader`]; the supervisor's side starts at [`SpawnerFactory`].

pub mod configuration;
pub mod error;
pub mod factory;
pub mod fork_exec;
pub mod handle;
pub mod loader;
pub mod logging;
pub mod preloader;
pub mod process_control;
pub mod protocol;
pub mod smart;
pub mod worker_ack;

mod reaper;

pub use configuration::{AppConfig, PreloadStrategy, RuntimeCapabilities};
pub use error::SpawnError;
pub use factory::SpawnerFactory;
pub use fork_exec::DirectSpawner;
pub use handle::{ProcessHandle, Strategy, WorkerProcess, WorkerState};
pub use preloader::{LaunchPreloader, Preloader, PreloaderControl, PreloaderState};
pub use process_control::Spawner;
pub use smart::SmartSpawner;
