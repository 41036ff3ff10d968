//! Listeners that run inside every new worker process, before it
//! accepts any work.
//!
//! A worker duplicated off a preloader shares everything the preloader
//! had set up: signal dispositions, threads (gone in the copy), open
//! connections. Listeners for [`STARTING_WORKER_PROCESS`] get to repair
//! that state; they learn whether the worker was duplicated.

use crate::logging;
use nix::sys::signal::{signal, SigHandler, Signal};
use slog_scope::{debug, warn};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The event fired in each new worker process.
pub const STARTING_WORKER_PROCESS: &str = "starting_worker_process";

/// A connection to the application's default datastore. It gets
/// re-established in every duplicated worker, since a connection
/// shared with the preloader and its siblings is unusable.
pub trait DatastoreClient {
    fn reconnect(&mut self) -> anyhow::Result<()>;
}

type Listener = Box<dyn FnMut(bool) -> anyhow::Result<()>>;

/// A listener failed; the worker must not serve.
#[derive(Error, Debug, PartialEq)]
#[error("{listener} failed: {message}")]
pub struct HookError {
    /// Which listener failed.
    pub listener: String,
    pub message: String,
}

/// State fix-ups that run before any of the application's listeners.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Builtin {
    /// The preloader ignores `SIGCHLD`; workers get the default back.
    RestoreSignals,

    /// The logger gets rebuilt with this process's PID.
    ReinstallLogger,

    /// The default datastore client reconnects, if there is one. Only
    /// in duplicated workers.
    ReconnectDatastore,
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Builtin::RestoreSignals => "restoring signal handlers",
            Builtin::ReinstallLogger => "reinstalling the logger",
            Builtin::ReconnectDatastore => "reconnecting the datastore",
        };
        f.write_str(name)
    }
}

/// Event listeners, by event name, in the order they were registered.
pub struct Hooks {
    app: String,
    builtins: Vec<Builtin>,
    listeners: HashMap<String, Vec<(String, Listener)>>,
    datastore: Option<Box<dyn DatastoreClient>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("app", &self.app)
            .field("builtins", &self.builtins)
            .field(
                "listeners",
                &self
                    .listeners
                    .iter()
                    .map(|(event, listeners)| (event, listeners.len()))
                    .collect::<HashMap<_, _>>(),
            )
            .field("datastore", &self.datastore.is_some())
            .finish()
    }
}

impl Hooks {
    pub fn new(app: &str) -> Hooks {
        Hooks {
            app: app.to_string(),
            builtins: vec![
                Builtin::RestoreSignals,
                Builtin::ReinstallLogger,
                Builtin::ReconnectDatastore,
            ],
            listeners: HashMap::new(),
            datastore: None,
        }
    }

    /// Registers a listener for `event`. Listeners run in the order
    /// they were registered.
    pub fn on<F>(&mut self, event: &str, listener: F) -> &mut Hooks
    where
        F: FnMut(bool) -> anyhow::Result<()> + 'static,
    {
        let listeners = self.listeners.entry(event.to_string()).or_default();
        let name = format!("{} listener #{}", event, listeners.len() + 1);
        listeners.push((name, Box::new(listener)));
        self
    }

    pub fn on_starting_worker_process<F>(&mut self, listener: F) -> &mut Hooks
    where
        F: FnMut(bool) -> anyhow::Result<()> + 'static,
    {
        self.on(STARTING_WORKER_PROCESS, listener)
    }

    /// Sets the client that gets reconnected in duplicated workers.
    pub fn set_datastore(&mut self, client: Box<dyn DatastoreClient>) -> &mut Hooks {
        self.datastore = Some(client);
        self
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map(Vec::len).unwrap_or(0)
    }

    /// Runs every listener for `event`, in order. Stops at the first
    /// one that fails.
    pub fn fire(&mut self, event: &str, was_duplicated: bool) -> Result<(), HookError> {
        let listeners = match self.listeners.get_mut(event) {
            Some(listeners) => listeners,
            None => return Ok(()),
        };
        for (name, listener) in listeners.iter_mut() {
            debug!("running listener"; "listener" => &*name, "was_duplicated" => was_duplicated);
            if let Err(e) = listener(was_duplicated) {
                warn!("listener failed"; "listener" => &*name, "error" => %e);
                return Err(HookError {
                    listener: name.clone(),
                    message: format!("{:#}", e),
                });
            }
        }
        Ok(())
    }

    /// Prepares a new worker process: runs the built-in fix-ups, then
    /// the application's `starting_worker_process` listeners.
    pub fn starting_worker_process(&mut self, was_duplicated: bool) -> Result<(), HookError> {
        for builtin in self.builtins.clone() {
            self.run_builtin(builtin, was_duplicated)
                .map_err(|e| HookError {
                    listener: builtin.to_string(),
                    message: format!("{:#}", e),
                })?;
        }
        self.fire(STARTING_WORKER_PROCESS, was_duplicated)
    }

    fn run_builtin(&mut self, builtin: Builtin, was_duplicated: bool) -> anyhow::Result<()> {
        match builtin {
            Builtin::RestoreSignals => {
                unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) }?;
            }
            Builtin::ReinstallLogger => {
                slog_scope::set_global_logger(logging::process_logger(&self.app)).cancel_reset();
            }
            Builtin::ReconnectDatastore => {
                if let (true, Some(datastore)) = (was_duplicated, self.datastore.as_mut()) {
                    debug!("reconnecting datastore");
                    datastore.reconnect()?;
                }
            }
        }
        Ok(())
    }
}
