use machine::*;
use slog_scope::{debug, info};
use std::time::Duration;
use tokio::time::Instant;

machine! {
    #[derive(Clone, PartialEq, Debug)]
    pub enum PreloaderState {
        NotStarted,
        Loading,
        Idle { since: Instant },
        Busy,
        ShuttingDown,
        Terminated,
    }
}

/// The preloader process is being launched.
#[derive(Clone, Debug, PartialEq)]
pub struct StartRequested;

/// The application finished loading at the given time.
#[derive(Clone, Debug, PartialEq)]
pub struct Loaded(pub Instant);

#[derive(Clone, Debug, PartialEq)]
pub struct DuplicationRequested;

/// A duplication attempt is over (successful or not), at the given
/// time.
#[derive(Clone, Debug, PartialEq)]
pub struct DuplicationFinished(pub Instant);

/// Checks whether an idle preloader has been idle for too long.
#[derive(Clone, Debug, PartialEq)]
pub struct IdleCheck {
    pub now: Instant,
    pub timeout: Duration,
}

/// The preloader should exit.
#[derive(Clone, Debug, PartialEq)]
pub struct Stop;

#[derive(Clone, Debug, PartialEq)]
pub struct ShutdownComplete;

/// The preloader process went away on its own, or never came up.
#[derive(Clone, Debug, PartialEq)]
pub struct Died;

transitions!(PreloaderState, [
    (NotStarted, StartRequested) => Loading,
    (NotStarted, Stop) => ShuttingDown,

    (Loading, Loaded) => Idle,
    (Loading, Died) => Terminated,
    (Loading, Stop) => ShuttingDown,

    (Idle, DuplicationRequested) => Busy,
    (Idle, IdleCheck) => [Idle, ShuttingDown],
    (Idle, Died) => Terminated,
    (Idle, Stop) => ShuttingDown,

    (Busy, DuplicationFinished) => Idle,
    (Busy, Died) => Terminated,
    (Busy, Stop) => ShuttingDown,

    (ShuttingDown, ShutdownComplete) => Terminated,
    (ShuttingDown, Died) => Terminated
]);

methods!(PreloaderState, [
    Idle => fn idle_since(&self) -> Instant,
    Loading, Idle, Busy => fn live(&self) -> bool
]);

impl PreloaderState {
    /// Whether the preloader process is (or should be) around.
    pub fn is_live(&self) -> bool {
        self.live().unwrap_or(false)
    }

    /// Whether this preloader is done for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PreloaderState::Terminated(_) | PreloaderState::Error)
    }
}

impl NotStarted {
    fn on_start_requested(self, _: StartRequested) -> Loading {
        Loading {}
    }

    fn on_stop(self, _: Stop) -> ShuttingDown {
        ShuttingDown {}
    }
}

impl Loading {
    fn on_loaded(self, loaded: Loaded) -> Idle {
        debug!("preloader is ready");
        Idle { since: loaded.0 }
    }

    fn on_died(self, _: Died) -> Terminated {
        Terminated {}
    }

    fn on_stop(self, _: Stop) -> ShuttingDown {
        ShuttingDown {}
    }

    fn live(&self) -> bool {
        true
    }
}

impl Idle {
    fn on_duplication_requested(self, _: DuplicationRequested) -> Busy {
        Busy {}
    }

    fn on_idle_check(self, check: IdleCheck) -> PreloaderState {
        let idle_for = check.now.saturating_duration_since(self.since);
        if idle_for > check.timeout {
            info!("preloader has been idle for too long"; "idle_for" => ?idle_for, "timeout" => ?check.timeout);
            PreloaderState::shutting_down()
        } else {
            PreloaderState::idle(self.since)
        }
    }

    fn on_died(self, _: Died) -> Terminated {
        Terminated {}
    }

    fn on_stop(self, _: Stop) -> ShuttingDown {
        ShuttingDown {}
    }

    fn idle_since(&self) -> Instant {
        self.since
    }

    fn live(&self) -> bool {
        true
    }
}

impl Busy {
    fn on_duplication_finished(self, finished: DuplicationFinished) -> Idle {
        Idle { since: finished.0 }
    }

    fn on_died(self, _: Died) -> Terminated {
        Terminated {}
    }

    fn on_stop(self, _: Stop) -> ShuttingDown {
        ShuttingDown {}
    }

    fn live(&self) -> bool {
        true
    }
}

impl ShuttingDown {
    fn on_shutdown_complete(self, _: ShutdownComplete) -> Terminated {
        Terminated {}
    }

    fn on_died(self, _: Died) -> Terminated {
        Terminated {}
    }
}
